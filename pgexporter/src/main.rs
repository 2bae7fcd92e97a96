use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use pgexporter::config::{Config, DEFAULT_CONFIG_PATH};
use pgexporter::context::{Context, RuntimePaths, SharedContext};
use pgexporter::logging::{self, LogCounters};
use pgexporter::registry::{Registry, UserMetricsSource};
use pgexporter::server::{run_listener, Endpoint};
use pgexporter::users::{load_vault, master_key};
use pgexporter::{control, management};

#[derive(Parser)]
#[command(
    name = "pgexporter",
    version,
    about = "Prometheus exporter for PostgreSQL",
    disable_help_flag = true
)]
struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Users vault file
    #[arg(short = 'u', long = "users")]
    users: Option<PathBuf>,

    /// Admins vault file
    #[arg(short = 'A', long = "admins")]
    admins: Option<PathBuf>,

    /// Custom metrics, YAML file or directory
    #[arg(short = 'Y', long = "yaml", conflicts_with = "json")]
    yaml: Option<PathBuf>,

    /// Custom metrics, JSON file or directory
    #[arg(short = 'J', long = "json")]
    json: Option<PathBuf>,

    /// Base directory for relative paths
    #[arg(short = 'D', long = "directory")]
    directory: Option<PathBuf>,

    /// Detach from the terminal
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,

    /// Collector allow-list (comma separated)
    #[arg(short = 'C', long = "collectors", value_delimiter = ',')]
    collectors: Vec<String>,

    /// Print help
    #[arg(short = '?', long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,
}

#[tokio::main]
async fn main() {
    let counters = Arc::new(LogCounters::default());
    if let Err(reason) = run(counters.clone()).await {
        counters.record_fatal();
        eprintln!("pgexporter: {reason}");
        std::process::exit(1);
    }
}

fn resolve(base: &Option<PathBuf>, path: PathBuf) -> PathBuf {
    match base {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path,
    }
}

async fn run(counters: Arc<LogCounters>) -> Result<(), String> {
    let cli = Cli::parse();

    let config_path = resolve(
        &cli.directory,
        cli.config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
    );
    let mut config = Config::load(&config_path).map_err(|e| e.to_string())?;
    if !cli.collectors.is_empty() {
        config.collectors = cli.collectors.clone();
    }

    logging::init(&config, counters.clone()).map_err(|e| e.to_string())?;
    info!(config = %config_path.display(), "pgexporter starting");
    if cli.daemon {
        warn!("-d is not supported under the task runtime; staying in the foreground");
    }

    let users_path = cli.users.map(|p| resolve(&cli.directory, p));
    let admins_path = cli.admins.map(|p| resolve(&cli.directory, p));
    let (users, admins) = load_vaults(&users_path, &admins_path)?;

    let metrics_source = match (cli.yaml, cli.json, &config.metrics_path) {
        (Some(path), _, _) => Some(UserMetricsSource::Yaml(resolve(&cli.directory, path))),
        (None, Some(path), _) => Some(UserMetricsSource::Json(resolve(&cli.directory, path))),
        (None, None, Some(path)) => Some(UserMetricsSource::Yaml(path.clone())),
        (None, None, None) => None,
    };
    let registry = Registry::load(metrics_source.as_ref()).map_err(|e| e.to_string())?;
    info!(metrics = registry.metrics().len(), servers = config.servers.len(), "configuration loaded");

    let paths = RuntimePaths {
        config: config_path,
        users: users_path,
        admins: admins_path,
        metrics: metrics_source,
    };

    let pidfile = config.pidfile.clone();
    let lock_files = create_lock_files(&config)?;
    if let Some(path) = &pidfile {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .map_err(|e| format!("cannot write pidfile {}: {e}", path.display()))?;
    }

    let ctx: SharedContext =
        Arc::new(Context::new(paths, config, registry, users, admins, counters));

    let mut tasks = Vec::new();
    for endpoint in
        [Endpoint::Metrics, Endpoint::Console, Endpoint::BridgeText, Endpoint::BridgeJson]
    {
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move { run_listener(ctx, endpoint).await }));
    }
    tasks.push(tokio::spawn(control::run_control_socket(ctx.clone())));
    tasks.push(tokio::spawn(management::run_management(ctx.clone())));

    wait_for_shutdown(&ctx).await?;

    info!("shutting down");
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        for task in tasks {
            let _ = task.await;
        }
    })
    .await;

    remove_shared_files(&pidfile, &lock_files);
    Ok(())
}

fn load_vaults(
    users_path: &Option<PathBuf>,
    admins_path: &Option<PathBuf>,
) -> Result<(Vec<pgexporter::users::User>, Vec<pgexporter::users::User>), String> {
    if users_path.is_none() && admins_path.is_none() {
        return Ok((Vec::new(), Vec::new()));
    }
    let key = master_key().map_err(|e| e.to_string())?;
    let users = match users_path {
        Some(path) => load_vault(path, &key).map_err(|e| e.to_string())?,
        None => Vec::new(),
    };
    let admins = match admins_path {
        Some(path) => load_vault(path, &key).map_err(|e| e.to_string())?,
        None => Vec::new(),
    };
    Ok((users, admins))
}

/// One lock file per bound port; a pre-existing lock means another instance
/// owns the port.
fn create_lock_files(config: &Config) -> Result<Vec<PathBuf>, String> {
    let ports = [
        config.metrics_port,
        config.console_port,
        config.bridge_port,
        config.bridge_json_port,
        config.management_port,
    ];
    let mut created = Vec::new();
    for port in ports.into_iter().filter(|p| *p > 0) {
        let path = PathBuf::from(format!("/tmp/pgexporter.{port}.lock"));
        if path.exists() {
            remove_shared_files(&None, &created);
            return Err(format!(
                "lock file {} exists; is another pgexporter running?",
                path.display()
            ));
        }
        std::fs::write(&path, format!("{}\n", std::process::id()))
            .map_err(|e| format!("cannot create {}: {e}", path.display()))?;
        created.push(path);
    }
    Ok(created)
}

fn remove_shared_files(pidfile: &Option<PathBuf>, lock_files: &[PathBuf]) {
    if let Some(path) = pidfile {
        let _ = std::fs::remove_file(path);
    }
    for path in lock_files {
        let _ = std::fs::remove_file(path);
    }
}

async fn wait_for_shutdown(ctx: &SharedContext) -> Result<(), String> {
    let mut sighup =
        signal(SignalKind::hangup()).map_err(|e| format!("cannot install SIGHUP handler: {e}"))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| format!("cannot install SIGTERM handler: {e}"))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| format!("cannot install SIGINT handler: {e}"))?;
    let mut shutdown_rx = ctx.shutdown_signal();

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading");
                match control::perform_reload(ctx).await {
                    Ok(outcome) if outcome.restart => {
                        warn!(fields = ?outcome.restart_fields, "reload needs a restart for some fields");
                    }
                    Ok(_) => {}
                    Err(reason) => error!(%reason, "reload failed, keeping the running configuration"),
                }
            }
            _ = sigterm.recv() => { ctx.trigger_shutdown(); }
            _ = sigint.recv() => { ctx.trigger_shutdown(); }
            _ = shutdown_rx.changed() => break,
        }
    }
    Ok(())
}
