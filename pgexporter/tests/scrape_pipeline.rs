//! End-to-end scrape pipeline tests against a replaying wire layer.

use std::sync::Arc;

use async_trait::async_trait;

use pgexporter::collector::{QueryExecutor, ServerRole};
use pgexporter::config::Config;
use pgexporter::context::{Context, RuntimePaths, SharedContext};
use pgexporter::logging::LogCounters;
use pgexporter::registry::Registry;
use pgexporter::server::metrics;
use pgexporter_wire::{RowSet, WireError};

/// Replays canned row sets per SQL text and counts round trips.
struct MockWire {
    responses: Vec<(&'static str, RowSet)>,
    round_trips: usize,
}

impl MockWire {
    fn new(responses: Vec<(&'static str, RowSet)>) -> Self {
        MockWire { responses, round_trips: 0 }
    }
}

#[async_trait]
impl QueryExecutor for MockWire {
    async fn execute(
        &mut self,
        _server_index: usize,
        _database: &str,
        sql: &str,
    ) -> Result<RowSet, WireError> {
        self.round_trips += 1;
        Ok(self
            .responses
            .iter()
            .find(|(needle, _)| sql.contains(needle))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }
}

fn rowset(columns: &[&str], rows: &[&[Option<&str>]]) -> RowSet {
    let mut set = RowSet::new(columns.iter().map(|c| c.to_string()).collect());
    for row in rows {
        set.push_row(row.iter().map(|v| v.map(str::to_string)).collect());
    }
    set
}

/// Context with the given registry YAML and probed servers `(name, major)`.
async fn pipeline_ctx(registry_yaml: &str, servers: &[(&str, u32)]) -> SharedContext {
    let mut config_text = String::from(
        "[pgexporter]\nmetrics = 5001\nmetrics_cache_max_age = 5\nmetrics_cache_max_size = 256k\n",
    );
    for (name, _) in servers {
        config_text.push_str(&format!("[{name}]\nhost = localhost\nuser = prom\n"));
    }
    let config = Config::parse(&config_text).unwrap();
    let registry = Registry::from_yaml(registry_yaml).unwrap();

    let ctx = Arc::new(Context::new(
        RuntimePaths::default(),
        config,
        registry,
        Vec::new(),
        Vec::new(),
        Arc::new(LogCounters::default()),
    ));

    {
        let mut states = ctx.servers.write().await;
        for (state, (_, major)) in states.iter_mut().zip(servers) {
            state.probed = true;
            state.available = true;
            state.major_version = *major;
            state.role = ServerRole::Primary;
            state.databases = vec!["postgres".to_string()];
        }
    }

    ctx
}

const PRIMARY_YAML: &str = "\
metrics:
  - tag: postgresql_primary
    server: both
    queries:
      - version: 10
        query: SELECT CASE pg_is_in_recovery() WHEN 'f' THEN 't' ELSE 'f' END
        columns:
          - type: gauge
            description: Is the PostgreSQL instance the primary
";

#[tokio::test]
async fn cold_scrape_single_server_primary_metric() {
    let ctx = pipeline_ctx(PRIMARY_YAML, &[("s1", 16)]).await;
    let mut wire =
        MockWire::new(vec![("pg_is_in_recovery", rowset(&["primary"], &[&[Some("t")]]))]);

    let body = metrics::body_with_executor(&ctx, &mut wire).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(text.contains("# HELP pgexporter_postgresql_primary Is the PostgreSQL instance the primary\n"));
    assert!(text.contains("# TYPE pgexporter_postgresql_primary gauge\n"));
    assert!(text.contains("pgexporter_postgresql_primary{server=\"s1\"} 1\n"));
}

#[tokio::test]
async fn database_label_fan_out() {
    let yaml = "\
metrics:
  - tag: pg_database_size
    sort: data
    queries:
      - version: 10
        query: SELECT datname, pg_database_size(datname) FROM pg_database
        columns:
          - name: database
            type: label
          - type: gauge
            description: Size of the database in bytes
";
    let ctx = pipeline_ctx(yaml, &[("s1", 16)]).await;
    let mut wire = MockWire::new(vec![(
        "pg_database_size",
        rowset(
            &["database", "size"],
            &[&[Some("postgres"), Some("8192")], &[Some("app"), Some("16384")]],
        ),
    )]);

    let body = metrics::body_with_executor(&ctx, &mut wire).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(text.contains("pgexporter_pg_database_size{server=\"s1\",database=\"postgres\"} 8192\n"));
    assert!(text.contains("pgexporter_pg_database_size{server=\"s1\",database=\"app\"} 16384\n"));
    assert_eq!(text.matches("# HELP pgexporter_pg_database_size").count(), 1);
    assert_eq!(text.matches("# TYPE pgexporter_pg_database_size").count(), 1);
}

#[tokio::test]
async fn cache_hit_serves_identical_bytes_without_round_trips() {
    let ctx = pipeline_ctx(PRIMARY_YAML, &[("s1", 16)]).await;
    let mut wire =
        MockWire::new(vec![("pg_is_in_recovery", rowset(&["primary"], &[&[Some("t")]]))]);

    let first = metrics::body_with_executor(&ctx, &mut wire).await.unwrap();
    let after_build = wire.round_trips;
    assert!(after_build > 0);

    let second = metrics::body_with_executor(&ctx, &mut wire).await.unwrap();
    assert_eq!(wire.round_trips, after_build, "cache hit must not touch the wire");
    assert_eq!(first, second, "cached responses are byte-identical");
}

#[tokio::test]
async fn reset_rebuilds_with_equivalent_content() {
    let ctx = pipeline_ctx(PRIMARY_YAML, &[("s1", 16)]).await;
    let mut wire =
        MockWire::new(vec![("pg_is_in_recovery", rowset(&["primary"], &[&[Some("t")]]))]);

    let first = metrics::body_with_executor(&ctx, &mut wire).await.unwrap();
    let timeout = ctx.config().blocking_timeout;
    ctx.metrics_cache.invalidate(timeout).await.unwrap();

    let after_build = wire.round_trips;
    let rebuilt = metrics::body_with_executor(&ctx, &mut wire).await.unwrap();
    assert!(wire.round_trips > after_build, "reset forces a rebuild");
    assert_eq!(first, rebuilt);
}

#[tokio::test]
async fn version_keyed_alternatives_select_per_server() {
    let yaml = "\
metrics:
  - tag: gated
    queries:
      - version: 14
        query: SELECT fourteen
        columns: [{type: gauge}]
      - version: 17
        query: SELECT seventeen
        columns: [{type: gauge}]
";
    let ctx = pipeline_ctx(yaml, &[("old13", 13), ("mid16", 16), ("new18", 18)]).await;
    let mut wire = MockWire::new(vec![
        ("fourteen", rowset(&["v"], &[&[Some("14")]])),
        ("seventeen", rowset(&["v"], &[&[Some("17")]])),
    ]);

    let body = metrics::body_with_executor(&ctx, &mut wire).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    // The 13 server is absent entirely; 16 runs the version-14 alternative,
    // 18 the version-17 one.
    assert!(!text.contains("pgexporter_gated{server=\"old13\"}"));
    assert!(text.contains("pgexporter_gated{server=\"mid16\"} 14\n"));
    assert!(text.contains("pgexporter_gated{server=\"new18\"} 17\n"));
    assert_eq!(wire.round_trips, 2);
}

#[tokio::test]
async fn caching_disabled_rebuilds_every_scrape() {
    let config = Config::parse(
        "[pgexporter]\nmetrics = 5001\nmetrics_cache_max_age = 0\n[s1]\nhost = h\nuser = u\n",
    )
    .unwrap();
    let registry = Registry::from_yaml(PRIMARY_YAML).unwrap();
    let ctx = Arc::new(Context::new(
        RuntimePaths::default(),
        config,
        registry,
        Vec::new(),
        Vec::new(),
        Arc::new(LogCounters::default()),
    ));
    {
        let mut states = ctx.servers.write().await;
        states[0].probed = true;
        states[0].available = true;
        states[0].major_version = 16;
        states[0].role = ServerRole::Primary;
        states[0].databases = vec!["postgres".to_string()];
    }

    let mut wire =
        MockWire::new(vec![("pg_is_in_recovery", rowset(&["primary"], &[&[Some("t")]]))]);

    let _ = metrics::body_with_executor(&ctx, &mut wire).await.unwrap();
    let after_first = wire.round_trips;
    let _ = metrics::body_with_executor(&ctx, &mut wire).await.unwrap();
    assert_eq!(wire.round_trips, after_first * 2, "every scrape hits the wire");
}
