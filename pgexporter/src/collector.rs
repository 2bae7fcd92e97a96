//! The collector: drives the query registry over server connections and
//! yields row sets for the emitter.
//!
//! Per scrape, metrics run in registry declaration order, servers in
//! configuration order, and databases in the server's database-list order.
//! Wire access goes through [`QueryExecutor`] so the scrape pipeline can be
//! exercised against a replaying mock.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use pgexporter_wire::{ConnectOptions, Connection, RowSet, WireError};

use crate::config::ServerConfig;
use crate::registry::{
    ExtVersion, MetricDef, QueryAlternative, Registry, ServerSelector, VersionKey,
};

pub const PROBE_VERSION_SQL: &str = "SELECT current_setting('server_version_num')";
pub const PROBE_RECOVERY_SQL: &str = "SELECT pg_is_in_recovery()";
pub const PROBE_DATABASES_SQL: &str =
    "SELECT datname FROM pg_database WHERE datistemplate = false ORDER BY datname";
pub const PROBE_EXTENSIONS_SQL: &str = "SELECT extname, extversion FROM pg_extension";

/// Database contacted when a query is not fanned out.
pub const DEFAULT_DATABASE: &str = "postgres";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Unknown,
    Primary,
    Replica,
}

#[derive(Debug, Clone)]
pub struct ExtensionInfo {
    pub name: String,
    /// `None` when `extversion` did not parse as a version triple.
    pub version: Option<ExtVersion>,
}

/// Runtime state of one configured server.
#[derive(Debug, Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub password: Option<String>,
    pub probed: bool,
    pub available: bool,
    pub major_version: u32,
    pub minor_version: u32,
    pub role: ServerRole,
    /// Non-template databases; the default database is kept last.
    pub databases: Vec<String>,
    pub extensions: Vec<ExtensionInfo>,
}

impl ServerState {
    pub fn new(config: ServerConfig, password: Option<String>) -> Self {
        ServerState {
            config,
            password,
            probed: false,
            available: false,
            major_version: 0,
            minor_version: 0,
            role: ServerRole::Unknown,
            databases: Vec::new(),
            extensions: Vec::new(),
        }
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            host: self.config.host.clone(),
            port: self.config.port,
            tls_ca_file: self.config.tls_ca_file.clone(),
            tls_cert_file: self.config.tls_cert_file.clone(),
            tls_key_file: self.config.tls_key_file.clone(),
        }
    }

    pub fn default_database(&self) -> &str {
        self.databases.last().map(String::as_str).unwrap_or(DEFAULT_DATABASE)
    }

    pub fn extension_version(&self, name: &str) -> Option<ExtVersion> {
        self.extensions.iter().find(|e| e.name == name).and_then(|e| e.version)
    }

    fn selected_by(&self, selector: ServerSelector) -> bool {
        match selector {
            ServerSelector::Both => true,
            ServerSelector::Primary => self.role == ServerRole::Primary,
            ServerSelector::Replica => self.role == ServerRole::Replica,
        }
    }
}

/// Opens a connection and completes authentication within `auth_timeout`.
async fn open_connection(
    state: &ServerState,
    database: &str,
    auth_timeout: Duration,
) -> Result<Connection, WireError> {
    let options = state.connect_options();
    let user = state.config.user.clone();
    let password = state.password.clone();
    let handshake = async {
        let mut conn = Connection::connect(&options).await?;
        conn.authenticate(&user, password.as_deref(), database).await?;
        Ok::<_, WireError>(conn)
    };
    match tokio::time::timeout(auth_timeout, handshake).await {
        Ok(result) => result,
        Err(_) => Err(WireError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "authentication timeout exceeded",
        ))),
    }
}

/// Probes version, role, databases and installed extensions; marks the server
/// available on success.
pub async fn probe_server(state: &mut ServerState, auth_timeout: Duration) {
    state.probed = true;
    state.available = false;

    let result = probe_inner(state, auth_timeout).await;
    match result {
        Ok(()) => {
            state.available = true;
            debug!(
                server = %state.config.name,
                major = state.major_version,
                role = ?state.role,
                databases = state.databases.len(),
                "server probed"
            );
        }
        Err(e) => {
            warn!(server = %state.config.name, error = %e, "server probe failed, marking down");
        }
    }
}

async fn probe_inner(state: &mut ServerState, auth_timeout: Duration) -> Result<(), WireError> {
    let mut conn = open_connection(state, DEFAULT_DATABASE, auth_timeout).await?;

    let version = conn.simple_query(PROBE_VERSION_SQL).await?;
    let version_num: u32 = version
        .rows()
        .first()
        .and_then(|r| r.get(0))
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| WireError::Protocol("server_version_num is not numeric".into()))?;
    state.major_version = version_num / 10_000;
    state.minor_version = version_num % 10_000;

    let recovery = conn.simple_query(PROBE_RECOVERY_SQL).await?;
    state.role = match recovery.rows().first().and_then(|r| r.get(0)) {
        Some("f") => ServerRole::Primary,
        Some("t") => ServerRole::Replica,
        _ => ServerRole::Unknown,
    };

    let databases = conn.simple_query(PROBE_DATABASES_SQL).await?;
    let mut names: Vec<String> = databases
        .rows()
        .iter()
        .filter_map(|r| r.get(0).map(str::to_string))
        .collect();
    // Keep the default database last; per-scrape queries run against it.
    names.retain(|n| n != DEFAULT_DATABASE);
    names.push(DEFAULT_DATABASE.to_string());
    state.databases = names;

    let extensions = conn.simple_query(PROBE_EXTENSIONS_SQL).await?;
    state.extensions = extensions
        .rows()
        .iter()
        .filter_map(|r| {
            r.get(0).map(|name| ExtensionInfo {
                name: name.to_string(),
                version: r.get(1).and_then(|v| v.parse().ok()),
            })
        })
        .collect();

    conn.close().await;
    Ok(())
}

/// Seam between the collector and the wire layer.
#[async_trait]
pub trait QueryExecutor: Send {
    async fn execute(
        &mut self,
        server_index: usize,
        database: &str,
        sql: &str,
    ) -> Result<RowSet, WireError>;
}

/// Production executor: one reused [`Connection`] per (server, database) for
/// the lifetime of a scrape.
pub struct WireExecutor {
    servers: Vec<ServerState>,
    auth_timeout: Duration,
    connections: HashMap<(usize, String), Connection>,
}

impl WireExecutor {
    pub fn new(servers: Vec<ServerState>, auth_timeout: Duration) -> Self {
        WireExecutor { servers, auth_timeout, connections: HashMap::new() }
    }

    /// Terminates every connection opened during the scrape.
    pub async fn close_all(self) {
        for (_, conn) in self.connections {
            conn.close().await;
        }
    }
}

#[async_trait]
impl QueryExecutor for WireExecutor {
    async fn execute(
        &mut self,
        server_index: usize,
        database: &str,
        sql: &str,
    ) -> Result<RowSet, WireError> {
        let key = (server_index, database.to_string());
        if !self.connections.contains_key(&key) {
            let state = &self.servers[server_index];
            let conn = open_connection(state, database, self.auth_timeout).await?;
            self.connections.insert(key.clone(), conn);
        }
        let conn = self.connections.get_mut(&key).expect("connection was just inserted");
        match conn.simple_query(sql).await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                // A poisoned handle is useless for the rest of the scrape.
                if let Some(conn) = self.connections.remove(&key) {
                    conn.close().await;
                }
                Err(e)
            }
        }
    }
}

/// One executed query alternative with the rows it produced.
pub struct CollectedQuery<'a> {
    pub def: &'a MetricDef,
    pub alt: &'a QueryAlternative,
    pub server: String,
    pub database: String,
    pub rows: RowSet,
}

/// Drives one scrape across the registry.
pub struct Collector<'a> {
    registry: &'a Registry,
    servers: &'a [ServerState],
    collectors: &'a [String],
}

impl<'a> Collector<'a> {
    pub fn new(registry: &'a Registry, servers: &'a [ServerState], collectors: &'a [String]) -> Self {
        Collector { registry, servers, collectors }
    }

    /// Expose only if default or specified.
    fn collector_enabled(&self, name: &str) -> bool {
        self.collectors.is_empty() || self.collectors.iter().any(|c| c == name)
    }

    pub async fn collect(&self, exec: &mut dyn QueryExecutor) -> Vec<CollectedQuery<'a>> {
        let mut collected = Vec::new();

        for def in self.registry.metrics() {
            if !self.collector_enabled(&def.collector) {
                continue;
            }

            for (index, server) in self.servers.iter().enumerate() {
                if !server.available || !server.selected_by(def.server) {
                    continue;
                }

                let probe = match &def.extension {
                    Some(ext) => match server.extension_version(ext) {
                        Some(version) => VersionKey::Extension(version),
                        None => continue,
                    },
                    None => VersionKey::Postgres(server.major_version),
                };
                let alt = match def.lookup(probe) {
                    Some(alt) => alt,
                    None => continue,
                };

                let databases: Vec<String> = if def.all_databases {
                    server.databases.clone()
                } else {
                    vec![server.default_database().to_string()]
                };

                for database in databases {
                    match exec.execute(index, &database, &alt.sql).await {
                        Ok(rows) => collected.push(CollectedQuery {
                            def,
                            alt,
                            server: server.config.name.clone(),
                            database,
                            rows,
                        }),
                        Err(e) => {
                            warn!(
                                server = %server.config.name,
                                database = %database,
                                tag = %def.tag,
                                error = %e,
                                "query failed, continuing"
                            );
                        }
                    }
                }
            }
        }

        collected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    fn server(name: &str, major: u32, role: ServerRole) -> ServerState {
        let mut state = ServerState::new(
            ServerConfig {
                name: name.into(),
                host: "localhost".into(),
                port: 5432,
                user: "prom".into(),
                data_dir: None,
                wal_dir: None,
                tls_ca_file: None,
                tls_cert_file: None,
                tls_key_file: None,
            },
            None,
        );
        state.probed = true;
        state.available = true;
        state.major_version = major;
        state.role = role;
        state.databases = vec!["app".into(), DEFAULT_DATABASE.into()];
        state
    }

    struct Canned {
        queries: Vec<(usize, String, String)>,
        rows: fn(&str) -> RowSet,
    }

    #[async_trait]
    impl QueryExecutor for Canned {
        async fn execute(
            &mut self,
            server_index: usize,
            database: &str,
            sql: &str,
        ) -> Result<RowSet, WireError> {
            self.queries.push((server_index, database.into(), sql.into()));
            Ok((self.rows)(sql))
        }
    }

    fn no_rows(_: &str) -> RowSet {
        RowSet::default()
    }

    #[test]
    fn selector_and_role_checks() {
        let primary = server("p", 16, ServerRole::Primary);
        let replica = server("r", 16, ServerRole::Replica);
        assert!(primary.selected_by(ServerSelector::Both));
        assert!(primary.selected_by(ServerSelector::Primary));
        assert!(!primary.selected_by(ServerSelector::Replica));
        assert!(replica.selected_by(ServerSelector::Replica));
        assert!(!replica.selected_by(ServerSelector::Primary));
    }

    #[tokio::test]
    async fn version_gated_metrics_are_skipped() {
        let yaml = "\
metrics:
  - tag: modern
    queries:
      - version: 14
        query: SELECT modern
        columns: [{type: gauge}]
      - version: 17
        query: SELECT modern17
        columns: [{type: gauge}]
";
        let registry = Registry::from_yaml(yaml).unwrap();
        let servers =
            vec![server("old", 13, ServerRole::Primary), server("new", 16, ServerRole::Primary)];
        let collector = Collector::new(&registry, &servers, &[]);
        let mut exec = Canned { queries: Vec::new(), rows: no_rows };

        let _ = collector.collect(&mut exec).await;

        // Only the 16 server runs, and with the version-14 alternative.
        assert_eq!(exec.queries.len(), 1);
        assert_eq!(exec.queries[0].0, 1);
        assert_eq!(exec.queries[0].2, "SELECT modern");
    }

    #[tokio::test]
    async fn database_fan_out_and_default_scope() {
        let yaml = "\
metrics:
  - tag: everywhere
    database: all
    queries:
      - version: 10
        query: SELECT a
        columns: [{type: gauge}]
  - tag: one_db
    queries:
      - version: 10
        query: SELECT b
        columns: [{type: gauge}]
";
        let registry = Registry::from_yaml(yaml).unwrap();
        let servers = vec![server("s1", 16, ServerRole::Primary)];
        let collector = Collector::new(&registry, &servers, &[]);
        let mut exec = Canned { queries: Vec::new(), rows: no_rows };

        let _ = collector.collect(&mut exec).await;

        let fanned: Vec<&str> = exec
            .queries
            .iter()
            .filter(|(_, _, sql)| sql == "SELECT a")
            .map(|(_, db, _)| db.as_str())
            .collect();
        assert_eq!(fanned, vec!["app", DEFAULT_DATABASE]);

        let single: Vec<&str> = exec
            .queries
            .iter()
            .filter(|(_, _, sql)| sql == "SELECT b")
            .map(|(_, db, _)| db.as_str())
            .collect();
        assert_eq!(single, vec![DEFAULT_DATABASE]);
    }

    #[tokio::test]
    async fn collector_allow_list_filters() {
        let yaml = "\
metrics:
  - tag: kept
    collector: wanted
    queries:
      - version: 10
        query: SELECT kept
        columns: [{type: gauge}]
  - tag: dropped
    collector: unwanted
    queries:
      - version: 10
        query: SELECT dropped
        columns: [{type: gauge}]
";
        let registry = Registry::from_yaml(yaml).unwrap();
        let servers = vec![server("s1", 16, ServerRole::Primary)];
        let enabled = vec!["wanted".to_string()];
        let collector = Collector::new(&registry, &servers, &enabled);
        let mut exec = Canned { queries: Vec::new(), rows: no_rows };

        let _ = collector.collect(&mut exec).await;

        assert_eq!(exec.queries.len(), 1);
        assert_eq!(exec.queries[0].2, "SELECT kept");
    }
}
