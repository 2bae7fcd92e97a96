//! Configuration loading and reload bookkeeping.
//!
//! The main file is an ini dialect: one `[pgexporter]` section with daemon
//! settings and one `[name]` section per monitored server. Values use
//! the suffix grammar for sizes (`b|k|m|g`, optionally with a trailing `b`)
//! and ages (`s|m|h|d|w`). Reloads parse into a shadow [`Config`]; only a
//! valid shadow ever replaces the live snapshot.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Longest accepted section name; longer names fail the load, never truncate.
pub const MAX_SECTION_NAME: usize = 512;

/// Default location probed when `-c` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pgexporter/pgexporter.conf";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: malformed entry: {text}")]
    Malformed { line: usize, text: String },
    #[error("line {line}: unknown key {key:?} in section {section:?}")]
    UnknownKey { line: usize, key: String, section: String },
    #[error("line {line}: invalid value for {key}: {reason}")]
    InvalidValue { line: usize, key: String, reason: String },
    #[error("line {line}: section name exceeds {MAX_SECTION_NAME} bytes")]
    SectionTooLong { line: usize },
    #[error("duplicate server section {name:?}")]
    DuplicateServer { name: String },
    #[error("server {name:?} is missing required key {key:?}")]
    MissingServerKey { name: String, key: String },
    #[error("no [pgexporter] section in configuration")]
    MissingMainSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    Console,
    File,
    Syslog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug5,
    Debug4,
    Debug3,
    Debug2,
    Debug1,
    Info,
    Warn,
    Error,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    Append,
    Create,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hugepage {
    Off,
    Try,
    On,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessTitle {
    Never,
    Strict,
    Minimal,
    Verbose,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug5 => "debug5",
            LogLevel::Debug4 => "debug4",
            LogLevel::Debug3 => "debug3",
            LogLevel::Debug2 => "debug2",
            LogLevel::Debug1 => "debug1",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// One `[name]` server section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub data_dir: Option<PathBuf>,
    pub wal_dir: Option<PathBuf>,
    pub tls_ca_file: Option<PathBuf>,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
}

/// The full daemon configuration; an immutable snapshot once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub metrics_port: u16,
    pub console_port: u16,
    pub bridge_port: u16,
    pub bridge_json_port: u16,
    pub bridge_endpoints: Vec<String>,
    pub management_port: u16,
    pub metrics_path: Option<PathBuf>,
    pub metrics_cache_max_age: Duration,
    pub metrics_cache_max_size: usize,
    pub bridge_cache_max_age: Duration,
    pub bridge_cache_max_size: usize,
    pub blocking_timeout: Duration,
    pub authentication_timeout: Duration,
    pub pidfile: Option<PathBuf>,
    pub log_type: LogType,
    pub log_level: LogLevel,
    pub log_path: Option<PathBuf>,
    pub log_rotation_size: usize,
    pub log_rotation_age: Duration,
    pub log_mode: LogMode,
    pub log_line_prefix: Option<String>,
    pub unix_socket_dir: PathBuf,
    pub libev: Option<String>,
    pub keep_alive: bool,
    pub nodelay: bool,
    pub non_blocking: bool,
    pub backlog: i32,
    pub hugepage: Hugepage,
    pub update_process_title: ProcessTitle,
    pub tls: bool,
    pub tls_ca_file: Option<PathBuf>,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
    pub collectors: Vec<String>,
    pub servers: Vec<ServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "*".into(),
            metrics_port: 0,
            console_port: 0,
            bridge_port: 0,
            bridge_json_port: 0,
            bridge_endpoints: Vec::new(),
            management_port: 0,
            metrics_path: None,
            metrics_cache_max_age: Duration::ZERO,
            metrics_cache_max_size: 0,
            bridge_cache_max_age: Duration::ZERO,
            bridge_cache_max_size: 0,
            blocking_timeout: Duration::from_secs(30),
            authentication_timeout: Duration::from_secs(5),
            pidfile: None,
            log_type: LogType::Console,
            log_level: LogLevel::Info,
            log_path: None,
            log_rotation_size: 0,
            log_rotation_age: Duration::ZERO,
            log_mode: LogMode::Append,
            log_line_prefix: None,
            unix_socket_dir: PathBuf::from("/tmp"),
            libev: None,
            keep_alive: true,
            nodelay: true,
            non_blocking: true,
            backlog: 16,
            hugepage: Hugepage::Try,
            update_process_title: ProcessTitle::Strict,
            tls: false,
            tls_ca_file: None,
            tls_cert_file: None,
            tls_key_file: None,
            collectors: Vec::new(),
            servers: Vec::new(),
        }
    }
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Config::parse(&text)
    }

    /// Parses the ini dialect from a string.
    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        let mut section: Option<String> = None;
        let mut main_seen = false;
        let mut server: Option<PartialServer> = None;
        let mut names = HashSet::new();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let name = rest
                    .strip_suffix(']')
                    .ok_or_else(|| ConfigError::Malformed { line: line_no, text: raw.into() })?
                    .trim();
                if name.len() > MAX_SECTION_NAME {
                    return Err(ConfigError::SectionTooLong { line: line_no });
                }
                if let Some(done) = server.take() {
                    config.servers.push(done.finish()?);
                }
                if name == "pgexporter" {
                    main_seen = true;
                    section = Some(name.to_string());
                } else {
                    if !names.insert(name.to_string()) {
                        return Err(ConfigError::DuplicateServer { name: name.into() });
                    }
                    server = Some(PartialServer::new(name));
                    section = Some(name.to_string());
                }
                continue;
            }

            let (key, value) = split_entry(line)
                .ok_or_else(|| ConfigError::Malformed { line: line_no, text: raw.into() })?;
            match (&section, &mut server) {
                (Some(s), None) if s == "pgexporter" => {
                    config.apply_main(line_no, key, value)?;
                }
                (Some(s), Some(partial)) => {
                    partial.apply(line_no, s, key, value)?;
                }
                _ => {
                    return Err(ConfigError::Malformed { line: line_no, text: raw.into() });
                }
            }
        }

        if let Some(done) = server.take() {
            config.servers.push(done.finish()?);
        }
        if !main_seen {
            return Err(ConfigError::MissingMainSection);
        }

        Ok(config)
    }

    fn apply_main(&mut self, line: usize, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "host" => self.host = value.to_string(),
            "metrics" => self.metrics_port = parse_port(line, key, value)?,
            "console" => self.console_port = parse_port(line, key, value)?,
            "bridge" => self.bridge_port = parse_port(line, key, value)?,
            "bridge_json" => self.bridge_json_port = parse_port(line, key, value)?,
            "bridge_endpoints" => {
                self.bridge_endpoints =
                    value.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
            }
            "management" => self.management_port = parse_port(line, key, value)?,
            "metrics_path" => self.metrics_path = Some(PathBuf::from(value)),
            "metrics_cache_max_age" => {
                self.metrics_cache_max_age = parse_age(line, key, value, Duration::ZERO)?;
            }
            "metrics_cache_max_size" => {
                self.metrics_cache_max_size = parse_size(line, key, value, 0)?;
            }
            "bridge_cache_max_age" => {
                self.bridge_cache_max_age = parse_age(line, key, value, Duration::ZERO)?;
            }
            "bridge_cache_max_size" => {
                self.bridge_cache_max_size = parse_size(line, key, value, 0)?;
            }
            "blocking_timeout" => {
                self.blocking_timeout = parse_age(line, key, value, Duration::from_secs(30))?;
            }
            "authentication_timeout" => {
                self.authentication_timeout = parse_age(line, key, value, Duration::from_secs(5))?;
            }
            "pidfile" => self.pidfile = Some(PathBuf::from(value)),
            "log_type" => {
                self.log_type = match value {
                    "console" => LogType::Console,
                    "file" => LogType::File,
                    "syslog" => LogType::Syslog,
                    other => return invalid(line, key, format!("unknown log type {other:?}")),
                };
            }
            "log_level" => {
                self.log_level = match value {
                    "debug5" => LogLevel::Debug5,
                    "debug4" => LogLevel::Debug4,
                    "debug3" => LogLevel::Debug3,
                    "debug2" => LogLevel::Debug2,
                    "debug1" | "debug" => LogLevel::Debug1,
                    "info" => LogLevel::Info,
                    "warn" => LogLevel::Warn,
                    "error" => LogLevel::Error,
                    "fatal" => LogLevel::Fatal,
                    other => return invalid(line, key, format!("unknown log level {other:?}")),
                };
            }
            "log_path" => self.log_path = Some(PathBuf::from(value)),
            "log_rotation_size" => {
                self.log_rotation_size = parse_size(line, key, value, 0)?;
            }
            "log_rotation_age" => {
                self.log_rotation_age = parse_age(line, key, value, Duration::ZERO)?;
            }
            "log_mode" => {
                self.log_mode = match value {
                    "append" => LogMode::Append,
                    "create" => LogMode::Create,
                    other => return invalid(line, key, format!("unknown log mode {other:?}")),
                };
            }
            "log_line_prefix" => self.log_line_prefix = Some(value.to_string()),
            "unix_socket_dir" => self.unix_socket_dir = PathBuf::from(value),
            "libev" => self.libev = Some(value.to_string()),
            "keep_alive" => self.keep_alive = parse_bool(line, key, value)?,
            "nodelay" => self.nodelay = parse_bool(line, key, value)?,
            "non_blocking" => self.non_blocking = parse_bool(line, key, value)?,
            "backlog" => {
                self.backlog = value
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        line,
                        key: key.into(),
                        reason: "not an integer".into(),
                    })?;
            }
            "hugepage" => {
                self.hugepage = match value {
                    "off" => Hugepage::Off,
                    "try" => Hugepage::Try,
                    "on" => Hugepage::On,
                    other => return invalid(line, key, format!("unknown hugepage mode {other:?}")),
                };
            }
            "update_process_title" => {
                self.update_process_title = match value {
                    "never" => ProcessTitle::Never,
                    "strict" => ProcessTitle::Strict,
                    "minimal" => ProcessTitle::Minimal,
                    "verbose" => ProcessTitle::Verbose,
                    other => return invalid(line, key, format!("unknown policy {other:?}")),
                };
            }
            "tls" => self.tls = parse_bool(line, key, value)?,
            "tls_ca_file" => self.tls_ca_file = Some(PathBuf::from(value)),
            "tls_cert_file" => self.tls_cert_file = Some(PathBuf::from(value)),
            "tls_key_file" => self.tls_key_file = Some(PathBuf::from(value)),
            other => {
                return Err(ConfigError::UnknownKey {
                    line,
                    key: other.into(),
                    section: "pgexporter".into(),
                })
            }
        }
        Ok(())
    }

    /// Names of restart-required fields that differ between `self` and `next`.
    ///
    /// Ports are hot-swappable (listeners re-bind); the fields below cannot
    /// be applied to a running process.
    pub fn restart_required(&self, next: &Config) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.metrics_cache_max_size != next.metrics_cache_max_size {
            fields.push("metrics_cache_max_size");
        }
        if self.bridge_cache_max_size != next.bridge_cache_max_size {
            fields.push("bridge_cache_max_size");
        }
        if self.log_type != next.log_type {
            fields.push("log_type");
        }
        if self.pidfile != next.pidfile {
            fields.push("pidfile");
        }
        if self.hugepage != next.hugepage {
            fields.push("hugepage");
        }
        if self.update_process_title != next.update_process_title {
            fields.push("update_process_title");
        }
        if self.unix_socket_dir != next.unix_socket_dir {
            fields.push("unix_socket_dir");
        }
        fields
    }

    /// Reads a main-section key for `conf_get`.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "host" => self.host.clone(),
            "metrics" => self.metrics_port.to_string(),
            "console" => self.console_port.to_string(),
            "bridge" => self.bridge_port.to_string(),
            "bridge_json" => self.bridge_json_port.to_string(),
            "management" => self.management_port.to_string(),
            "metrics_cache_max_age" => self.metrics_cache_max_age.as_secs().to_string(),
            "metrics_cache_max_size" => self.metrics_cache_max_size.to_string(),
            "bridge_cache_max_age" => self.bridge_cache_max_age.as_secs().to_string(),
            "bridge_cache_max_size" => self.bridge_cache_max_size.to_string(),
            "blocking_timeout" => self.blocking_timeout.as_secs().to_string(),
            "authentication_timeout" => self.authentication_timeout.as_secs().to_string(),
            "log_level" => self.log_level.to_string(),
            "unix_socket_dir" => self.unix_socket_dir.display().to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// Applies a main-section key for `conf_set`, returning the new snapshot.
    pub fn set(&self, key: &str, value: &str) -> Result<Config, ConfigError> {
        let mut next = self.clone();
        next.apply_main(0, key, value)?;
        Ok(next)
    }
}

fn invalid(line: usize, key: &str, reason: String) -> Result<(), ConfigError> {
    Err(ConfigError::InvalidValue { line, key: key.into(), reason })
}

struct PartialServer {
    name: String,
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    data_dir: Option<PathBuf>,
    wal_dir: Option<PathBuf>,
    tls_ca_file: Option<PathBuf>,
    tls_cert_file: Option<PathBuf>,
    tls_key_file: Option<PathBuf>,
}

impl PartialServer {
    fn new(name: &str) -> Self {
        PartialServer {
            name: name.to_string(),
            host: None,
            port: None,
            user: None,
            data_dir: None,
            wal_dir: None,
            tls_ca_file: None,
            tls_cert_file: None,
            tls_key_file: None,
        }
    }

    fn apply(
        &mut self,
        line: usize,
        section: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        match key {
            "host" => self.host = Some(value.to_string()),
            "port" => self.port = Some(parse_port(line, key, value)?),
            "user" => self.user = Some(value.to_string()),
            "data_dir" => self.data_dir = Some(PathBuf::from(value)),
            "wal_dir" => self.wal_dir = Some(PathBuf::from(value)),
            "tls_ca_file" => self.tls_ca_file = Some(PathBuf::from(value)),
            "tls_cert_file" => self.tls_cert_file = Some(PathBuf::from(value)),
            "tls_key_file" => self.tls_key_file = Some(PathBuf::from(value)),
            other => {
                return Err(ConfigError::UnknownKey {
                    line,
                    key: other.into(),
                    section: section.into(),
                })
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<ServerConfig, ConfigError> {
        let host = self.host.ok_or_else(|| ConfigError::MissingServerKey {
            name: self.name.clone(),
            key: "host".into(),
        })?;
        let user = self.user.ok_or_else(|| ConfigError::MissingServerKey {
            name: self.name.clone(),
            key: "user".into(),
        })?;
        Ok(ServerConfig {
            name: self.name,
            host,
            port: self.port.unwrap_or(5432),
            user,
            data_dir: self.data_dir,
            wal_dir: self.wal_dir,
            tls_ca_file: self.tls_ca_file,
            tls_cert_file: self.tls_cert_file,
            tls_key_file: self.tls_key_file,
        })
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find(|c| c == '#' || c == ';') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn split_entry(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    Some((key.trim(), value.trim()))
}

fn parse_port(line: usize, key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        line,
        key: key.into(),
        reason: format!("{value:?} is not a valid port"),
    })
}

fn parse_bool(line: usize, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            line,
            key: key.into(),
            reason: format!("{other:?} is not a boolean"),
        }),
    }
}

/// Age grammar: digits plus optional `s|m|h|d|w` (seconds when omitted).
/// Empty values yield `default`; negative values reject.
pub fn parse_age(
    line: usize,
    key: &str,
    value: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(default);
    }
    let (digits, unit) = split_suffix(value);
    let amount: i64 = digits.parse().map_err(|_| ConfigError::InvalidValue {
        line,
        key: key.into(),
        reason: format!("{value:?} is not a valid age"),
    })?;
    if amount < 0 {
        return Err(ConfigError::InvalidValue {
            line,
            key: key.into(),
            reason: "negative values are not allowed".into(),
        });
    }
    let seconds = match unit {
        "" | "s" | "S" => amount,
        "m" | "M" => amount * 60,
        "h" | "H" => amount * 3600,
        "d" | "D" => amount * 86_400,
        "w" | "W" => amount * 604_800,
        other => {
            return Err(ConfigError::InvalidValue {
                line,
                key: key.into(),
                reason: format!("unknown age suffix {other:?}"),
            })
        }
    };
    Ok(Duration::from_secs(seconds as u64))
}

/// Size grammar: digits plus optional `b|k|m|g`, each optionally followed by
/// `b` (bytes when omitted). Empty values yield `default`; negative rejects.
pub fn parse_size(
    line: usize,
    key: &str,
    value: &str,
    default: usize,
) -> Result<usize, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(default);
    }
    let (digits, unit) = split_suffix(value);
    let amount: i64 = digits.parse().map_err(|_| ConfigError::InvalidValue {
        line,
        key: key.into(),
        reason: format!("{value:?} is not a valid size"),
    })?;
    if amount < 0 {
        return Err(ConfigError::InvalidValue {
            line,
            key: key.into(),
            reason: "negative values are not allowed".into(),
        });
    }
    let multiplier: i64 = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        other => {
            return Err(ConfigError::InvalidValue {
                line,
                key: key.into(),
                reason: format!("unknown size suffix {other:?}"),
            })
        }
    };
    Ok((amount * multiplier) as usize)
}

fn split_suffix(value: &str) -> (&str, &str) {
    let idx = value
        .find(|c: char| !c.is_ascii_digit() && c != '-')
        .unwrap_or(value.len());
    (&value[..idx], value[idx..].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[pgexporter]\n\
host = *\n\
metrics = 5001\n\
metrics_cache_max_age = 5s\n\
metrics_cache_max_size = 1m\n\
blocking_timeout = 30\n\
log_type = console\n\
log_level = info\n\
unix_socket_dir = /tmp\n\
\n\
[primary]\n\
host = localhost\n\
port = 5432\n\
user = prom\n";

    #[test]
    fn parses_main_and_server_sections() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.metrics_port, 5001);
        assert_eq!(config.metrics_cache_max_age, Duration::from_secs(5));
        assert_eq!(config.metrics_cache_max_size, 1024 * 1024);
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].name, "primary");
        assert_eq!(config.servers[0].port, 5432);
        assert_eq!(config.servers[0].user, "prom");
    }

    #[test]
    fn age_suffixes() {
        let age = |v| parse_age(0, "k", v, Duration::ZERO).unwrap();
        assert_eq!(age("10"), Duration::from_secs(10));
        assert_eq!(age("10s"), Duration::from_secs(10));
        assert_eq!(age("2m"), Duration::from_secs(120));
        assert_eq!(age("1h"), Duration::from_secs(3600));
        assert_eq!(age("1d"), Duration::from_secs(86_400));
        assert_eq!(age("1w"), Duration::from_secs(604_800));
        assert_eq!(age(""), Duration::ZERO);
        assert!(parse_age(0, "k", "-5", Duration::ZERO).is_err());
        assert!(parse_age(0, "k", "5y", Duration::ZERO).is_err());
    }

    #[test]
    fn size_suffixes() {
        let size = |v| parse_size(0, "k", v, 7).unwrap();
        assert_eq!(size("512"), 512);
        assert_eq!(size("512b"), 512);
        assert_eq!(size("4k"), 4096);
        assert_eq!(size("4kb"), 4096);
        assert_eq!(size("2M"), 2 * 1024 * 1024);
        assert_eq!(size("1g"), 1024 * 1024 * 1024);
        assert_eq!(size(""), 7);
        assert!(parse_size(0, "k", "-1", 0).is_err());
        assert!(parse_size(0, "k", "1q", 0).is_err());
    }

    #[test]
    fn rejects_unknown_keys_and_duplicates() {
        let bad = "[pgexporter]\nmetricz = 5001\n";
        assert!(matches!(Config::parse(bad), Err(ConfigError::UnknownKey { .. })));

        let dup = "[pgexporter]\nmetrics = 5001\n[a]\nhost = h\nuser = u\n[a]\nhost = h\nuser = u\n";
        assert!(matches!(Config::parse(dup), Err(ConfigError::DuplicateServer { .. })));
    }

    #[test]
    fn rejects_missing_required_server_keys() {
        let bad = "[pgexporter]\nmetrics = 5001\n[a]\nhost = h\n";
        assert!(matches!(
            Config::parse(bad),
            Err(ConfigError::MissingServerKey { ref key, .. }) if key == "user"
        ));
    }

    #[test]
    fn rejects_oversized_section_names() {
        let name = "x".repeat(MAX_SECTION_NAME + 1);
        let bad = format!("[pgexporter]\nmetrics = 5001\n[{name}]\nhost = h\nuser = u\n");
        assert!(matches!(Config::parse(&bad), Err(ConfigError::SectionTooLong { .. })));
    }

    #[test]
    fn restart_fields_are_flagged_but_ports_are_not() {
        let old = Config::parse(SAMPLE).unwrap();

        let mut next = old.clone();
        next.metrics_port = 5002;
        assert!(old.restart_required(&next).is_empty());

        next.metrics_cache_max_size = 42;
        next.unix_socket_dir = PathBuf::from("/run");
        let fields = old.restart_required(&next);
        assert!(fields.contains(&"metrics_cache_max_size"));
        assert!(fields.contains(&"unix_socket_dir"));
    }

    #[test]
    fn conf_get_and_set_round_trip() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.get("metrics").as_deref(), Some("5001"));
        let next = config.set("metrics_cache_max_age", "60").unwrap();
        assert_eq!(next.metrics_cache_max_age, Duration::from_secs(60));
        assert!(config.set("nonsense", "1").is_err());
    }
}
