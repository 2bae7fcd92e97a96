//! HTTP listeners: metrics, console, and the two federation bridge ports.
//!
//! Each configured port gets one listener task. Accepted connections are
//! served on spawned worker tasks; transient accept errors keep the loop
//! running, anything else tears the listener down and re-binds it. A reload
//! that changes a port number re-binds the listener without a restart.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1::Builder as HyperHttpBuilder;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::context::SharedContext;

pub mod bridge;
pub mod console;
pub mod metrics;

/// The endpoints multiplexed over this listener machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Metrics,
    Console,
    BridgeText,
    BridgeJson,
}

impl Endpoint {
    fn port(&self, config: &Config) -> u16 {
        match self {
            Endpoint::Metrics => config.metrics_port,
            Endpoint::Console => config.console_port,
            Endpoint::BridgeText => config.bridge_port,
            Endpoint::BridgeJson => config.bridge_json_port,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Endpoint::Metrics => "metrics",
            Endpoint::Console => "console",
            Endpoint::BridgeText => "bridge",
            Endpoint::BridgeJson => "bridge-json",
        }
    }
}

// Errnos the accept loop survives in place; anything else re-binds.
const TRANSIENT_ACCEPT_ERRNOS: &[i32] = &[
    11,  // EAGAIN
    71,  // EPROTO
    92,  // ENOPROTOOPT
    95,  // EOPNOTSUPP
    100, // ENETDOWN
    101, // ENETUNREACH
    102, // ENETRESET
    112, // EHOSTDOWN
    113, // EHOSTUNREACH
];

fn transient_accept_error(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || e.raw_os_error().is_some_and(|errno| TRANSIENT_ACCEPT_ERRNOS.contains(&errno))
}

/// Resolves the configured bind host; `*` binds every interface.
fn bind_address(config: &Config, port: u16) -> std::io::Result<SocketAddr> {
    if config.host == "*" {
        return Ok((Ipv4Addr::UNSPECIFIED, port).into());
    }
    if let Ok(ip) = config.host.parse::<IpAddr>() {
        return Ok((ip, port).into());
    }
    (config.host.as_str(), port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "host resolves to nothing"))
}

/// Binds a listener honoring `keep_alive`, `non_blocking` and `backlog`.
fn bind_listener(config: &Config, port: u16) -> std::io::Result<TcpListener> {
    let addr = bind_address(config, port)?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if config.keep_alive {
        socket.set_keepalive(true)?;
    }
    // Tokio requires a non-blocking fd regardless of the configured value.
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog)?;
    TcpListener::from_std(socket.into())
}

/// Server-side TLS from the `[pgexporter]` tls_cert_file / tls_key_file pair.
fn tls_acceptor(config: &Config) -> Option<TlsAcceptor> {
    if !config.tls {
        return None;
    }
    let (cert, key) = match (&config.tls_cert_file, &config.tls_key_file) {
        (Some(cert), Some(key)) => (cert, key),
        _ => {
            warn!("tls enabled without tls_cert_file/tls_key_file, serving plaintext");
            return None;
        }
    };

    let certs = std::fs::File::open(cert)
        .map(std::io::BufReader::new)
        .and_then(|mut r| rustls_pemfile::certs(&mut r).collect::<Result<Vec<_>, _>>());
    let key_der = std::fs::File::open(key)
        .map(std::io::BufReader::new)
        .and_then(|mut r| rustls_pemfile::private_key(&mut r));

    match (certs, key_der) {
        (Ok(certs), Ok(Some(key))) => {
            match rustls::ServerConfig::builder().with_no_client_auth().with_single_cert(certs, key)
            {
                Ok(server_config) => Some(TlsAcceptor::from(Arc::new(server_config))),
                Err(e) => {
                    error!(error = %e, "invalid TLS certificate/key, serving plaintext");
                    None
                }
            }
        }
        _ => {
            error!("cannot read TLS certificate/key, serving plaintext");
            None
        }
    }
}

/// Listener for the management endpoint, honoring the same socket options.
pub fn bind_management_listener(config: &Config, port: u16) -> std::io::Result<TcpListener> {
    bind_listener(config, port)
}

/// TLS acceptor for the management endpoint when `tls` is configured.
pub fn management_tls(config: &Config) -> Option<TlsAcceptor> {
    tls_acceptor(config)
}

/// Runs one endpoint's listener until shutdown, re-binding after fatal accept
/// errors and after reloads that move the port.
pub async fn run_listener(ctx: SharedContext, endpoint: Endpoint) {
    let mut config_rx = ctx.config_watch();
    let mut shutdown_rx = ctx.shutdown_signal();

    'rebind: loop {
        let config = ctx.config();
        let port = endpoint.port(&config);
        if port == 0 {
            tokio::select! {
                _ = config_rx.changed() => continue 'rebind,
                _ = shutdown_rx.changed() => return,
            }
        }

        let listener = match bind_listener(&config, port) {
            Ok(listener) => listener,
            Err(e) => {
                error!(endpoint = endpoint.name(), port, error = %e, "bind failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue 'rebind,
                    _ = shutdown_rx.changed() => return,
                }
            }
        };
        info!(endpoint = endpoint.name(), port, "listening");
        let acceptor =
            if endpoint == Endpoint::Metrics { tls_acceptor(&config) } else { None };

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(endpoint = endpoint.name(), %peer, "accepted");
                        let _ = stream.set_nodelay(config.nodelay);
                        let ctx = ctx.clone();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            handle_connection(ctx, endpoint, stream, acceptor).await;
                        });
                    }
                    Err(e) if transient_accept_error(&e) => {
                        warn!(endpoint = endpoint.name(), error = %e, "transient accept error");
                    }
                    Err(e) => {
                        error!(endpoint = endpoint.name(), error = %e, "accept failed, re-binding");
                        continue 'rebind;
                    }
                },
                _ = config_rx.changed() => {
                    let next = ctx.config();
                    if endpoint.port(&next) != port {
                        info!(endpoint = endpoint.name(), "port changed, re-binding");
                        continue 'rebind;
                    }
                }
                _ = shutdown_rx.changed() => return,
            }
        }
    }
}

/// Peeks the first byte for a TLS record (`0x16`, or `0x80` for ancient
/// clients) and upgrades when a TLS config is present.
async fn handle_connection(
    ctx: SharedContext,
    endpoint: Endpoint,
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
) {
    if let Some(acceptor) = acceptor {
        let mut first = [0u8; 1];
        let is_tls = matches!(stream.peek(&mut first).await, Ok(1) if first[0] == 0x16 || first[0] == 0x80);
        if is_tls {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => serve_http(ctx, endpoint, tls_stream).await,
                Err(e) => debug!(error = %e, "TLS handshake failed"),
            }
            return;
        }
    }
    serve_http(ctx, endpoint, stream).await;
}

async fn serve_http<S>(ctx: SharedContext, endpoint: Endpoint, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        async move { Ok::<_, hyper::Error>(route(ctx, endpoint, &req).await) }
    });

    if let Err(e) = HyperHttpBuilder::new().serve_connection(TokioIo::new(stream), service).await {
        debug!(error = %e, "error serving connection");
    }
}

/// Endpoint-specific routing: bad requests get 400, unknown paths 403.
async fn route(ctx: SharedContext, endpoint: Endpoint, req: &Request<Incoming>) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return empty_status(StatusCode::BAD_REQUEST);
    }

    match (endpoint, req.uri().path()) {
        (Endpoint::Metrics, "/") => html_response(metrics::home_page(&ctx)),
        (Endpoint::Metrics, "/metrics") => metrics::serve(&ctx).await,
        (Endpoint::Console, "/") => html_response(console::page(&ctx).await),
        (Endpoint::Console, "/api") => console::api(&ctx).await,
        (Endpoint::BridgeText, "/metrics") => bridge::serve_text(&ctx).await,
        (Endpoint::BridgeJson, "/metrics") => bridge::serve_json(&ctx).await,
        _ => empty_status(StatusCode::FORBIDDEN),
    }
}

pub(crate) fn empty_status(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::default());
    *response.status_mut() = status;
    response
}

pub(crate) fn html_response(body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::from(body));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    response
}

pub(crate) fn text_response(body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::from(body));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.1; charset=utf-8"),
    );
    response
}

pub(crate) fn json_response(body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::from(body));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errno_classification() {
        let again = std::io::Error::from_raw_os_error(11);
        assert!(transient_accept_error(&again));
        let eproto = std::io::Error::from_raw_os_error(71);
        assert!(transient_accept_error(&eproto));
        let refused = std::io::Error::from_raw_os_error(111); // ECONNREFUSED
        assert!(!transient_accept_error(&refused));
    }

    #[test]
    fn bind_address_wildcard_and_literal() {
        let mut config = Config::default();
        config.host = "*".into();
        assert_eq!(
            bind_address(&config, 9187).unwrap(),
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9187))
        );

        config.host = "127.0.0.1".into();
        assert_eq!(
            bind_address(&config, 9187).unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 9187))
        );
    }
}
