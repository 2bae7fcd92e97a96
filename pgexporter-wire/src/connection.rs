//! Connection establishment, authentication and the simple query protocol.
//!
//! A handle moves `Fresh → Startup → Authenticating → Idle → Querying → Idle`
//! and [`Connection::simple_query`] is only legal in `Idle`. Any unexpected
//! backend message or transport failure poisons the handle: every later call
//! returns [`WireError::Closed`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::error::WireError;
use crate::message::{self, AuthRequest, BackendMessage};
use crate::rowset::RowSet;
use crate::scram::{ScramClient, MECHANISM};
use crate::tls;

/// How to reach one PostgreSQL server.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Host name, IP address, or a directory path for Unix-domain sockets.
    pub host: String,
    pub port: u16,
    /// CA file used to verify the server certificate when TLS is negotiated.
    pub tls_ca_file: Option<PathBuf>,
    /// Client certificate/key pair presented to the server.
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
}

enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Startup,
    Idle,
    Closed,
}

/// A live handle to one server. Never multiplexed.
pub struct Connection {
    transport: Transport,
    state: State,
    parameters: HashMap<String, String>,
}

impl Connection {
    /// Opens the stream and negotiates TLS on TCP transports: the SSLRequest
    /// sentinel is sent, `'S'` upgrades, `'N'` continues in plaintext, and any
    /// other reply byte is a protocol violation.
    pub async fn connect(options: &ConnectOptions) -> Result<Connection, WireError> {
        if options.host.starts_with('/') {
            let path = format!("{}/.s.PGSQL.{}", options.host, options.port);
            let stream = UnixStream::connect(&path).await?;
            debug!(path, "connected over unix socket");
            return Ok(Connection {
                transport: Transport::Unix(stream),
                state: State::Startup,
                parameters: HashMap::new(),
            });
        }

        let mut stream = TcpStream::connect((options.host.as_str(), options.port)).await?;
        stream.set_nodelay(true)?;

        let mut buf = BytesMut::new();
        message::write_ssl_request(&mut buf);
        stream.write_all(&buf).await?;

        let mut reply = [0u8; 1];
        stream.read_exact(&mut reply).await?;

        let transport = match reply[0] {
            b'S' => {
                let config = tls::client_config(
                    options.tls_ca_file.as_deref(),
                    options.tls_cert_file.as_deref(),
                    options.tls_key_file.as_deref(),
                )?;
                let connector = TlsConnector::from(Arc::new(config));
                let name = tls::server_name(&options.host)?;
                let stream = connector
                    .connect(name, stream)
                    .await
                    .map_err(|e| WireError::Tls(e.to_string()))?;
                debug!(host = %options.host, "TLS established");
                Transport::Tls(Box::new(stream))
            }
            b'N' => {
                debug!(host = %options.host, "server declined TLS, continuing in plaintext");
                Transport::Tcp(stream)
            }
            other => {
                return Err(WireError::protocol(format!(
                    "unexpected SSLRequest reply byte {other:#04x}"
                )))
            }
        };

        Ok(Connection { transport, state: State::Startup, parameters: HashMap::new() })
    }

    /// Runs the startup and authentication exchange, then drains
    /// ParameterStatus/BackendKeyData until ReadyForQuery.
    pub async fn authenticate(
        &mut self,
        user: &str,
        password: Option<&str>,
        database: &str,
    ) -> Result<(), WireError> {
        if self.state != State::Startup {
            return Err(WireError::Closed);
        }

        let mut buf = BytesMut::new();
        message::write_startup(&mut buf, user, database, "pgexporter");
        self.send(&buf).await?;

        let mut scram: Option<ScramClient> = None;

        loop {
            match self.receive().await? {
                BackendMessage::Authentication(AuthRequest::Ok) => {}
                BackendMessage::Authentication(AuthRequest::CleartextPassword) => {
                    let password = required_password(user, password)?;
                    let mut buf = BytesMut::new();
                    message::write_password(&mut buf, password);
                    self.send(&buf).await?;
                }
                BackendMessage::Authentication(AuthRequest::Md5Password(salt)) => {
                    let password = required_password(user, password)?;
                    let mut buf = BytesMut::new();
                    message::write_password(&mut buf, &md5_password(user, password, &salt));
                    self.send(&buf).await?;
                }
                BackendMessage::Authentication(AuthRequest::Sasl(mechanisms)) => {
                    if !mechanisms.iter().any(|m| m == MECHANISM) {
                        self.state = State::Closed;
                        return Err(WireError::AuthUnsupported(format!(
                            "server offered {mechanisms:?}, only {MECHANISM} is spoken"
                        )));
                    }
                    let client = scram.insert(ScramClient::new());
                    let first = client.client_first_message();
                    let mut buf = BytesMut::new();
                    message::write_sasl_initial(&mut buf, MECHANISM, first.as_bytes());
                    self.send(&buf).await?;
                }
                BackendMessage::Authentication(AuthRequest::SaslContinue(data)) => {
                    let password = required_password(user, password)?;
                    let client = scram
                        .as_mut()
                        .ok_or_else(|| WireError::protocol("SASL continue before SASL start"))?;
                    let server_first = std::str::from_utf8(&data)
                        .map_err(|_| WireError::protocol("non-utf8 server-first message"))?;
                    let final_message = client.client_final_message(server_first, password)?;
                    let mut buf = BytesMut::new();
                    message::write_sasl_response(&mut buf, final_message.as_bytes());
                    self.send(&buf).await?;
                }
                BackendMessage::Authentication(AuthRequest::SaslFinal(data)) => {
                    let client = scram
                        .as_ref()
                        .ok_or_else(|| WireError::protocol("SASL final before SASL start"))?;
                    let server_final = std::str::from_utf8(&data)
                        .map_err(|_| WireError::protocol("non-utf8 server-final message"))?;
                    client.verify_server_final(server_final)?;
                }
                BackendMessage::Authentication(AuthRequest::Unsupported(code)) => {
                    self.state = State::Closed;
                    return Err(WireError::AuthUnsupported(format!(
                        "authentication request code {code}"
                    )));
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::BackendKeyData { .. } => {}
                BackendMessage::NoticeResponse(fields) => {
                    trace!(message = fields.message(), "notice during startup");
                }
                BackendMessage::ErrorResponse(fields) => {
                    self.state = State::Closed;
                    return Err(WireError::AuthBadPassword {
                        user: user.to_string(),
                        message: fields.message().to_string(),
                    });
                }
                BackendMessage::ReadyForQuery(_) => {
                    self.state = State::Idle;
                    return Ok(());
                }
                other => {
                    self.state = State::Closed;
                    return Err(WireError::protocol(format!(
                        "unexpected message during authentication: {other:?}"
                    )));
                }
            }
        }
    }

    /// Runs one simple query and collects the full result set.
    ///
    /// All values come back in their text representation; binary format is
    /// never requested.
    pub async fn simple_query(&mut self, sql: &str) -> Result<RowSet, WireError> {
        if self.state != State::Idle {
            return Err(WireError::Closed);
        }

        let mut buf = BytesMut::new();
        message::write_query(&mut buf, sql);
        self.send(&buf).await?;

        let mut result = RowSet::default();
        let mut error: Option<WireError> = None;

        loop {
            match self.receive().await? {
                BackendMessage::RowDescription(columns) => {
                    result = RowSet::new(columns.into_iter().map(|c| c.name).collect());
                }
                BackendMessage::DataRow(values) => {
                    result.push_row(
                        values
                            .into_iter()
                            .map(|v| v.map(|b| String::from_utf8_lossy(&b).into_owned()))
                            .collect(),
                    );
                }
                BackendMessage::CommandComplete(_) | BackendMessage::EmptyQueryResponse => {}
                BackendMessage::NoticeResponse(fields) => {
                    trace!(message = fields.message(), "notice during query");
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::ErrorResponse(fields) => {
                    error = Some(WireError::Postgres {
                        sqlstate: fields.sqlstate().to_string(),
                        message: fields.message().to_string(),
                    });
                }
                BackendMessage::ReadyForQuery(_) => {
                    return match error {
                        Some(e) => Err(e),
                        None => Ok(result),
                    };
                }
                other => {
                    self.state = State::Closed;
                    return Err(WireError::protocol(format!(
                        "unexpected message during query: {other:?}"
                    )));
                }
            }
        }
    }

    /// A ParameterStatus value reported by the server, e.g. `server_version`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Sends Terminate and shuts the stream down.
    pub async fn close(mut self) {
        if self.state == State::Closed {
            return;
        }
        let mut buf = BytesMut::new();
        message::write_terminate(&mut buf);
        let _ = self.send(&buf).await;
        let _ = match &mut self.transport {
            Transport::Tcp(s) => s.shutdown().await,
            Transport::Unix(s) => s.shutdown().await,
            Transport::Tls(s) => s.shutdown().await,
        };
    }

    async fn send(&mut self, buf: &[u8]) -> Result<(), WireError> {
        let result = match &mut self.transport {
            Transport::Tcp(s) => s.write_all(buf).await,
            Transport::Unix(s) => s.write_all(buf).await,
            Transport::Tls(s) => s.write_all(buf).await,
        };
        if result.is_err() {
            self.state = State::Closed;
        }
        result.map_err(WireError::from)
    }

    async fn receive(&mut self) -> Result<BackendMessage, WireError> {
        let header = self.read_exact(5).await?;
        let tag = header[0];
        let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        if len < 4 {
            self.state = State::Closed;
            return Err(WireError::protocol(format!("invalid frame length {len}")));
        }
        let body = self.read_exact(len as usize - 4).await?;
        match message::decode(tag, body) {
            Ok(msg) => Ok(msg),
            Err(e) => {
                self.state = State::Closed;
                Err(e)
            }
        }
    }

    async fn read_exact(&mut self, len: usize) -> Result<Bytes, WireError> {
        let mut buf = vec![0u8; len];
        let result = match &mut self.transport {
            Transport::Tcp(s) => s.read_exact(&mut buf).await,
            Transport::Unix(s) => s.read_exact(&mut buf).await,
            Transport::Tls(s) => s.read_exact(&mut buf).await,
        };
        if let Err(e) = result {
            self.state = State::Closed;
            return Err(e.into());
        }
        Ok(Bytes::from(buf))
    }
}

fn required_password<'a>(user: &str, password: Option<&'a str>) -> Result<&'a str, WireError> {
    password.ok_or_else(|| {
        WireError::AuthUnsupported(format!("server requires a password for user {user:?}"))
    })
}

fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let mut inner = Md5::new();
    inner.update(password.as_bytes());
    inner.update(user.as_bytes());
    let inner_hex = hex(&inner.finalize());

    let mut outer = Md5::new();
    outer.update(inner_hex.as_bytes());
    outer.update(salt);
    format!("md5{}", hex(&outer.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_response_shape() {
        let response = md5_password("prom", "secret", &[0x01, 0x02, 0x03, 0x04]);
        assert!(response.starts_with("md5"));
        assert_eq!(response.len(), 3 + 32);
        assert!(response[3..].bytes().all(|b| b.is_ascii_hexdigit()));
        // Deterministic for fixed inputs.
        assert_eq!(response, md5_password("prom", "secret", &[0x01, 0x02, 0x03, 0x04]));
        assert_ne!(response, md5_password("prom", "other", &[0x01, 0x02, 0x03, 0x04]));
    }
}
