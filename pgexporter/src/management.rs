//! Remote management: the control-plane RPC exposed over TCP, behind
//! SCRAM-SHA-256 admin authentication and optional TLS.
//!
//! The handshake reuses the RPC framing: the client sends its SCRAM
//! client-first-message as a frame, the server answers with server-first,
//! the client sends client-final, and the server closes with server-final.
//! Only then does the JSON command loop start.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use pgexporter_wire::scram::ScramServer;

use crate::context::SharedContext;
use crate::control::{read_frame, serve_rpc, write_frame};
use crate::users::find;

/// Runs the management listener until shutdown; no-op when `management = 0`.
pub async fn run_management(ctx: SharedContext) {
    let mut config_rx = ctx.config_watch();
    let mut shutdown_rx = ctx.shutdown_signal();

    'rebind: loop {
        let config = ctx.config();
        let port = config.management_port;
        if port == 0 {
            tokio::select! {
                _ = config_rx.changed() => continue 'rebind,
                _ = shutdown_rx.changed() => return,
            }
        }

        let listener = match crate::server::bind_management_listener(&config, port) {
            Ok(listener) => listener,
            Err(e) => {
                warn!(port, error = %e, "management bind failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => continue 'rebind,
                    _ = shutdown_rx.changed() => return,
                }
            }
        };
        info!(port, "management endpoint ready");
        let acceptor = crate::server::management_tls(&config);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "management connection");
                        let ctx = ctx.clone();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            handle_client(ctx, stream, acceptor).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "management accept failed"),
                },
                _ = config_rx.changed() => {
                    if ctx.config().management_port != port {
                        continue 'rebind;
                    }
                }
                _ = shutdown_rx.changed() => return,
            }
        }
    }
}

async fn handle_client(
    ctx: SharedContext,
    stream: TcpStream,
    acceptor: Option<tokio_rustls::TlsAcceptor>,
) {
    match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => authenticated_session(ctx, tls_stream).await,
            Err(e) => debug!(error = %e, "management TLS handshake failed"),
        },
        None => authenticated_session(ctx, stream).await,
    }
}

async fn authenticated_session<S>(ctx: SharedContext, mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match authenticate_admin(&ctx, &mut stream).await {
        Ok(user) => {
            info!(user = %user, "management session authenticated");
            if let Err(e) = serve_rpc(&ctx, &mut stream).await {
                debug!(error = %e, "management session ended");
            }
        }
        Err(reason) => {
            warn!(reason = %reason, "management authentication failed");
        }
    }
}

/// Runs the server side of the SCRAM exchange against the admins vault.
/// Returns the authenticated admin name.
async fn authenticate_admin<S>(ctx: &SharedContext, stream: &mut S) -> Result<String, String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_first = read_frame(stream)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "client closed before client-first".to_string())?;
    let client_first =
        String::from_utf8(client_first).map_err(|_| "non-utf8 client-first".to_string())?;

    let mut server = ScramServer::new();
    let server_first = server.server_first_message(&client_first).map_err(|e| e.to_string())?;

    let admins = ctx.admins.load_full();
    let admin = find(&admins, server.username())
        .ok_or_else(|| format!("unknown admin {:?}", server.username()))?
        .clone();

    write_frame(stream, server_first.as_bytes()).await.map_err(|e| e.to_string())?;

    let client_final = read_frame(stream)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "client closed before client-final".to_string())?;
    let client_final =
        String::from_utf8(client_final).map_err(|_| "non-utf8 client-final".to_string())?;

    let server_final = server
        .verify_client_final(&client_final, &admin.password)
        .map_err(|e| e.to_string())?;
    write_frame(stream, server_final.as_bytes()).await.map_err(|e| e.to_string())?;

    Ok(admin.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::{Context, RuntimePaths};
    use crate::logging::LogCounters;
    use crate::registry::Registry;
    use crate::users::User;
    use pgexporter_wire::scram::ScramClient;
    use std::sync::Arc;

    fn ctx_with_admin(name: &str, password: &str) -> SharedContext {
        let config = Config::parse("[pgexporter]\nmetrics = 5001\n").unwrap();
        Arc::new(Context::new(
            RuntimePaths::default(),
            config,
            Registry::load(None).unwrap(),
            Vec::new(),
            vec![User { name: name.into(), password: password.into() }],
            Arc::new(LogCounters::default()),
        ))
    }

    #[tokio::test]
    async fn scram_handshake_and_rpc_round_trip() {
        let ctx = ctx_with_admin("admin", "letmein");
        let (mut client_side, server_side) = tokio::io::duplex(8192);

        let server = tokio::spawn({
            let ctx = ctx.clone();
            async move {
                let mut stream = server_side;
                let user = authenticate_admin(&ctx, &mut stream).await.unwrap();
                assert_eq!(user, "admin");
                serve_rpc(&ctx, &mut stream).await.unwrap();
            }
        });

        let mut scram = ScramClient::with_nonce("admin", "fixedfixedfixed".into());
        write_frame(&mut client_side, scram.client_first_message().as_bytes()).await.unwrap();

        let server_first = read_frame(&mut client_side).await.unwrap().unwrap();
        let client_final = scram
            .client_final_message(std::str::from_utf8(&server_first).unwrap(), "letmein")
            .unwrap();
        write_frame(&mut client_side, client_final.as_bytes()).await.unwrap();

        let server_final = read_frame(&mut client_side).await.unwrap().unwrap();
        scram.verify_server_final(std::str::from_utf8(&server_final).unwrap()).unwrap();

        // Authenticated: the RPC loop is live.
        write_frame(&mut client_side, br#"{"command":1}"#).await.unwrap();
        let reply = read_frame(&mut client_side).await.unwrap().unwrap();
        let reply: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(reply["payload"]["alive"], true);

        drop(client_side);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn wrong_admin_password_is_rejected() {
        let ctx = ctx_with_admin("admin", "right");
        let (mut client_side, server_side) = tokio::io::duplex(8192);

        let server = tokio::spawn({
            let ctx = ctx.clone();
            async move {
                let mut stream = server_side;
                authenticate_admin(&ctx, &mut stream).await
            }
        });

        let mut scram = ScramClient::with_nonce("admin", "fixedfixedfixed".into());
        write_frame(&mut client_side, scram.client_first_message().as_bytes()).await.unwrap();
        let server_first = read_frame(&mut client_side).await.unwrap().unwrap();
        let client_final = scram
            .client_final_message(std::str::from_utf8(&server_first).unwrap(), "wrong")
            .unwrap();
        write_frame(&mut client_side, client_final.as_bytes()).await.unwrap();

        assert!(server.await.unwrap().is_err());
    }
}
