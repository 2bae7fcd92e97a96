//! The control plane: a length-prefixed JSON RPC served on the Unix-domain
//! socket (and re-used by the TCP management endpoint).
//!
//! Requests are `{command: <int>, ...}`; replies are
//! `{category: "response" | "error", start, end, payload}`. Error payloads
//! carry a numeric command-scoped code and a message.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tracing::{debug, error, info, warn};

use crate::collector::ServerRole;
use crate::config::Config;
use crate::context::SharedContext;
use crate::registry::Registry;
use crate::users;

pub const CMD_PING: i64 = 1;
pub const CMD_SHUTDOWN: i64 = 2;
pub const CMD_RELOAD: i64 = 3;
pub const CMD_RESET: i64 = 4;
pub const CMD_STATUS: i64 = 5;
pub const CMD_STATUS_DETAILS: i64 = 6;
pub const CMD_CONF_GET: i64 = 7;
pub const CMD_CONF_SET: i64 = 8;

pub const ERROR_UNKNOWN_COMMAND: i64 = 1;
pub const ERROR_BAD_PAYLOAD: i64 = 2;
pub const ERROR_RELOAD_FAILED: i64 = 3;
pub const ERROR_CONF_UNKNOWN_KEY: i64 = 4;
pub const ERROR_CONF_INVALID_VALUE: i64 = 5;
pub const ERROR_CACHE_BUSY: i64 = 6;

/// Largest accepted request frame.
const MAX_FRAME: u32 = 1024 * 1024;

/// Socket path under `unix_socket_dir`.
pub fn socket_path(config: &Config) -> PathBuf {
    config.unix_socket_dir.join("pgexporter.main")
}

/// Reads one `u32` length-prefixed frame; `None` on clean EOF.
pub async fn read_frame<S>(stream: &mut S) -> std::io::Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the limit"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Writes one `u32` length-prefixed frame.
pub async fn write_frame<S>(stream: &mut S, body: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn response(start: u64, payload: Value) -> Value {
    json!({ "category": "response", "start": start, "end": now_secs(), "payload": payload })
}

fn error_reply(start: u64, code: i64, message: &str) -> Value {
    json!({
        "category": "error",
        "start": start,
        "end": now_secs(),
        "payload": { "code": code, "message": message },
    })
}

/// Binds and serves the control socket until shutdown.
pub async fn run_control_socket(ctx: SharedContext) {
    let path = socket_path(&ctx.config());
    let _ = std::fs::remove_file(&path);
    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(e) => {
            error!(path = %path.display(), error = %e, "cannot bind control socket");
            return;
        }
    };
    info!(path = %path.display(), "control socket ready");

    let mut shutdown = ctx.shutdown_signal();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        let mut stream = stream;
                        if let Err(e) = serve_rpc(&ctx, &mut stream).await {
                            debug!(error = %e, "control connection ended");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "control accept failed"),
            },
            _ = shutdown.changed() => break,
        }
    }

    let _ = std::fs::remove_file(&path);
}

/// Serves request frames until EOF on any framed byte stream.
pub async fn serve_rpc<S>(ctx: &SharedContext, stream: &mut S) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(body) = read_frame(stream).await? {
        let reply = match serde_json::from_slice::<Value>(&body) {
            Ok(request) => dispatch(ctx, &request).await,
            Err(e) => error_reply(now_secs(), ERROR_BAD_PAYLOAD, &format!("malformed JSON: {e}")),
        };
        let encoded = serde_json::to_vec(&reply).unwrap_or_default();
        write_frame(stream, &encoded).await?;

        if reply_is_shutdown(&reply) {
            ctx.trigger_shutdown();
            break;
        }
    }
    Ok(())
}

fn reply_is_shutdown(reply: &Value) -> bool {
    reply.pointer("/payload/shutdown").and_then(Value::as_bool).unwrap_or(false)
}

/// Routes one decoded request to its handler.
pub async fn dispatch(ctx: &SharedContext, request: &Value) -> Value {
    let start = now_secs();
    let command = match request.get("command").and_then(Value::as_i64) {
        Some(command) => command,
        None => return error_reply(start, ERROR_BAD_PAYLOAD, "missing command"),
    };

    match command {
        CMD_PING => response(start, json!({ "alive": true })),
        CMD_SHUTDOWN => response(start, json!({ "shutdown": true })),
        CMD_RESET => {
            let timeout = ctx.config().blocking_timeout;
            match ctx.metrics_cache.invalidate(timeout).await {
                Ok(()) => {
                    let _ = ctx.bridge_cache.invalidate(timeout).await;
                    response(start, json!({ "reset": true }))
                }
                Err(_) => error_reply(start, ERROR_CACHE_BUSY, "cache lock is busy"),
            }
        }
        CMD_RELOAD => match perform_reload(ctx).await {
            Ok(outcome) => response(
                start,
                json!({ "restart": outcome.restart, "fields": outcome.restart_fields }),
            ),
            Err(reason) => error_reply(start, ERROR_RELOAD_FAILED, &reason),
        },
        CMD_STATUS => response(start, status_payload(ctx, false).await),
        CMD_STATUS_DETAILS => response(start, status_payload(ctx, true).await),
        CMD_CONF_GET => {
            let key = request.get("key").and_then(Value::as_str).unwrap_or("");
            match ctx.config().get(key) {
                Some(value) => response(start, json!({ "key": key, "value": value })),
                None => error_reply(
                    start,
                    ERROR_CONF_UNKNOWN_KEY,
                    &format!("unknown configuration key {key:?}"),
                ),
            }
        }
        CMD_CONF_SET => {
            let key = request.get("key").and_then(Value::as_str).unwrap_or("");
            let value = request.get("value").and_then(Value::as_str).unwrap_or("");
            conf_set(ctx, start, key, value).await
        }
        other => {
            error_reply(start, ERROR_UNKNOWN_COMMAND, &format!("unknown command {other}"))
        }
    }
}

async fn conf_set(ctx: &SharedContext, start: u64, key: &str, value: &str) -> Value {
    let old = ctx.config();
    let next = match old.set(key, value) {
        Ok(next) => next,
        Err(e) => return error_reply(start, ERROR_CONF_INVALID_VALUE, &e.to_string()),
    };

    let fields = old.restart_required(&next);
    if !fields.is_empty() {
        // Keep the live value; the operator has to restart for these.
        return response(start, json!({ "restart": true, "fields": fields }));
    }

    ctx.config.store(std::sync::Arc::new(next));
    let timeout = ctx.config().blocking_timeout;
    let _ = ctx.metrics_cache.invalidate(timeout).await;
    ctx.bump_config();
    response(start, json!({ "restart": false, "key": key, "value": value }))
}

pub struct ReloadOutcome {
    pub restart: bool,
    pub restart_fields: Vec<&'static str>,
}

/// Parses and validates the shadow configuration, registry and vaults, then
/// swaps them in. Restart-required fields keep their live values and flag
/// `restart = true`; a failed shadow leaves everything untouched.
pub async fn perform_reload(ctx: &SharedContext) -> Result<ReloadOutcome, String> {
    let paths = &ctx.paths;

    let shadow = Config::load(&paths.config).map_err(|e| e.to_string())?;
    let registry = Registry::load(paths.metrics.as_ref()).map_err(|e| e.to_string())?;

    let mut users = Vec::new();
    let mut admins = Vec::new();
    if paths.users.is_some() || paths.admins.is_some() {
        let key = users::master_key().map_err(|e| e.to_string())?;
        if let Some(path) = &paths.users {
            users = users::load_vault(path, &key).map_err(|e| e.to_string())?;
        }
        if let Some(path) = &paths.admins {
            admins = users::load_vault(path, &key).map_err(|e| e.to_string())?;
        }
    }

    let old = ctx.config();
    let restart_fields = old.restart_required(&shadow);
    let effective = merge_for_reload(&old, shadow);

    ctx.reset_servers(&effective, &users).await;
    ctx.config.store(std::sync::Arc::new(effective));
    ctx.registry.store(std::sync::Arc::new(registry));
    ctx.users.store(std::sync::Arc::new(users));
    ctx.admins.store(std::sync::Arc::new(admins));

    let timeout = ctx.config().blocking_timeout;
    let _ = ctx.metrics_cache.invalidate(timeout).await;
    let _ = ctx.bridge_cache.invalidate(timeout).await;
    ctx.bump_config();

    info!(restart = !restart_fields.is_empty(), "configuration reloaded");
    Ok(ReloadOutcome { restart: !restart_fields.is_empty(), restart_fields })
}

/// The shadow with restart-required fields pinned to their live values.
fn merge_for_reload(old: &Config, mut next: Config) -> Config {
    next.metrics_cache_max_size = old.metrics_cache_max_size;
    next.bridge_cache_max_size = old.bridge_cache_max_size;
    next.log_type = old.log_type;
    next.pidfile = old.pidfile.clone();
    next.hugepage = old.hugepage;
    next.update_process_title = old.update_process_title;
    next.unix_socket_dir = old.unix_socket_dir.clone();
    next
}

/// The `status` / `status_details` payload.
pub async fn status_payload(ctx: &SharedContext, details: bool) -> Value {
    let config = ctx.config();
    let servers = ctx.snapshot_servers().await;

    let mut listed = Vec::new();
    for state in &servers {
        let role = match state.role {
            ServerRole::Primary => "primary",
            ServerRole::Replica => "replica",
            ServerRole::Unknown => "unknown",
        };
        let mut entry = json!({
            "server": state.config.name,
            "active": state.available,
            "role": role,
        });
        if details {
            entry["version"] =
                json!(format!("{}.{}", state.major_version, state.minor_version));
            entry["databases"] = json!(state.databases);
            entry["extensions"] = json!(state
                .extensions
                .iter()
                .map(|e| e.name.clone())
                .collect::<Vec<_>>());
        }
        listed.push(entry);
    }

    let mut payload = json!({
        "servers": listed,
        "metrics": config.metrics_port,
        "cache": {
            "max_age": config.metrics_cache_max_age.as_secs(),
            "max_size": config.metrics_cache_max_size,
        },
    });
    if details {
        payload["number_of_metrics"] = json!(ctx.registry().metrics().len());
        payload["collectors"] = json!(config.collectors);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, RuntimePaths};
    use crate::logging::LogCounters;
    use std::sync::Arc;

    fn test_ctx() -> SharedContext {
        let config = Config::parse("[pgexporter]\nmetrics = 5001\n").unwrap();
        Arc::new(Context::new(
            RuntimePaths::default(),
            config,
            Registry::load(None).unwrap(),
            Vec::new(),
            Vec::new(),
            Arc::new(LogCounters::default()),
        ))
    }

    #[tokio::test]
    async fn ping_answers_alive() {
        let ctx = test_ctx();
        let reply = dispatch(&ctx, &json!({ "command": CMD_PING })).await;
        assert_eq!(reply["category"], "response");
        assert_eq!(reply["payload"]["alive"], true);
        assert!(reply["start"].as_u64().is_some());
        assert!(reply["end"].as_u64().is_some());
    }

    #[tokio::test]
    async fn unknown_command_is_an_error() {
        let ctx = test_ctx();
        let reply = dispatch(&ctx, &json!({ "command": 999 })).await;
        assert_eq!(reply["category"], "error");
        assert_eq!(reply["payload"]["code"], ERROR_UNKNOWN_COMMAND);
    }

    #[tokio::test]
    async fn missing_command_is_bad_payload() {
        let ctx = test_ctx();
        let reply = dispatch(&ctx, &json!({ "ping": true })).await;
        assert_eq!(reply["payload"]["code"], ERROR_BAD_PAYLOAD);
    }

    #[tokio::test]
    async fn conf_get_and_set() {
        let ctx = test_ctx();

        let reply =
            dispatch(&ctx, &json!({ "command": CMD_CONF_GET, "key": "metrics" })).await;
        assert_eq!(reply["payload"]["value"], "5001");

        let reply = dispatch(
            &ctx,
            &json!({ "command": CMD_CONF_SET, "key": "metrics", "value": "5002" }),
        )
        .await;
        assert_eq!(reply["payload"]["restart"], false);
        assert_eq!(ctx.config().metrics_port, 5002);

        // Restart-required keys are refused and keep the live value.
        let reply = dispatch(
            &ctx,
            &json!({ "command": CMD_CONF_SET, "key": "metrics_cache_max_size", "value": "1024" }),
        )
        .await;
        assert_eq!(reply["payload"]["restart"], true);
        assert_eq!(ctx.config().metrics_cache_max_size, 0);

        let reply =
            dispatch(&ctx, &json!({ "command": CMD_CONF_GET, "key": "bogus" })).await;
        assert_eq!(reply["payload"]["code"], ERROR_CONF_UNKNOWN_KEY);
    }

    #[tokio::test]
    async fn status_lists_servers() {
        let ctx = test_ctx();
        let payload = status_payload(&ctx, true).await;
        assert!(payload["servers"].as_array().unwrap().is_empty());
        assert!(payload["number_of_metrics"].as_u64().unwrap() >= 10);
    }

    #[tokio::test]
    async fn reload_swaps_or_keeps_the_live_config() {
        let dir = std::env::temp_dir().join(format!("pgexporter-reload-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pgexporter.conf");
        std::fs::write(&path, "[pgexporter]\nmetrics = 9187\n").unwrap();

        let config = Config::load(&path).unwrap();
        let ctx: SharedContext = std::sync::Arc::new(crate::context::Context::new(
            crate::context::RuntimePaths {
                config: path.clone(),
                users: None,
                admins: None,
                metrics: None,
            },
            config,
            Registry::load(None).unwrap(),
            Vec::new(),
            Vec::new(),
            std::sync::Arc::new(crate::logging::LogCounters::default()),
        ));

        // A port change applies live, without a restart.
        std::fs::write(&path, "[pgexporter]\nmetrics = 9188\n").unwrap();
        let outcome = perform_reload(&ctx).await.unwrap();
        assert!(!outcome.restart);
        assert_eq!(ctx.config().metrics_port, 9188);

        // A malformed shadow is dropped and the live config kept.
        let before = ctx.config();
        std::fs::write(&path, "[pgexporter]\nbogus_key = 1\n").unwrap();
        assert!(perform_reload(&ctx).await.is_err());
        assert_eq!(*ctx.config(), *before);

        // Restart-required fields keep their live values and raise the flag.
        std::fs::write(&path, "[pgexporter]\nmetrics = 9188\nunix_socket_dir = /run\n")
            .unwrap();
        let outcome = perform_reload(&ctx).await.unwrap();
        assert!(outcome.restart);
        assert_eq!(outcome.restart_fields, vec!["unix_socket_dir"]);
        assert_eq!(ctx.config().unix_socket_dir, PathBuf::from("/tmp"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, br#"{"command":1}"#).await.unwrap();
        let frame = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(frame, br#"{"command":1}"#);

        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }
}
