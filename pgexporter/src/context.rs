//! Shared runtime state threaded from the supervisor into every worker task.
//!
//! Configuration, registry and vault snapshots are immutable `Arc`s behind
//! atomic swap cells: workers load a snapshot once and never observe a
//! mid-reload mix. Server states live behind an async lock because probing
//! mutates them; the caches carry their own lock word.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{watch, RwLock};

use crate::cache::CacheHandle;
use crate::collector::{probe_server, ServerState};
use crate::config::Config;
use crate::logging::LogCounters;
use crate::registry::{Registry, UserMetricsSource};
use crate::users::{find, User};

/// File-system paths remembered for reloads.
#[derive(Debug, Clone, Default)]
pub struct RuntimePaths {
    pub config: PathBuf,
    pub users: Option<PathBuf>,
    pub admins: Option<PathBuf>,
    pub metrics: Option<UserMetricsSource>,
}

pub struct Context {
    pub paths: RuntimePaths,
    pub config: ArcSwap<Config>,
    pub registry: ArcSwap<Registry>,
    pub users: ArcSwap<Vec<User>>,
    pub admins: ArcSwap<Vec<User>>,
    pub servers: RwLock<Vec<ServerState>>,
    pub metrics_cache: CacheHandle,
    pub bridge_cache: CacheHandle,
    pub counters: Arc<LogCounters>,
    shutdown_tx: watch::Sender<bool>,
    config_tx: watch::Sender<u64>,
}

pub type SharedContext = Arc<Context>;

impl Context {
    pub fn new(
        paths: RuntimePaths,
        config: Config,
        registry: Registry,
        users: Vec<User>,
        admins: Vec<User>,
        counters: Arc<LogCounters>,
    ) -> Context {
        let metrics_cache =
            CacheHandle::new(config.metrics_cache_max_age, config.metrics_cache_max_size);
        let bridge_cache =
            CacheHandle::new(config.bridge_cache_max_age, config.bridge_cache_max_size);
        let servers = build_server_states(&config, &users);
        let (shutdown_tx, _) = watch::channel(false);
        let (config_tx, _) = watch::channel(0);

        Context {
            paths,
            config: ArcSwap::from_pointee(config),
            registry: ArcSwap::from_pointee(registry),
            users: ArcSwap::from_pointee(users),
            admins: ArcSwap::from_pointee(admins),
            servers: RwLock::new(servers),
            metrics_cache,
            bridge_cache,
            counters,
            shutdown_tx,
            config_tx,
        }
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.load_full()
    }

    /// Receiver that flips to `true` once shutdown is requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Receiver bumped after every applied reload or conf_set.
    pub fn config_watch(&self) -> watch::Receiver<u64> {
        self.config_tx.subscribe()
    }

    pub fn bump_config(&self) {
        self.config_tx.send_modify(|gen| *gen += 1);
    }

    /// Probes every not-yet-probed server; auth failures leave the server
    /// marked down until the next reload.
    pub async fn ensure_probed(&self) {
        let auth_timeout = self.config().authentication_timeout;
        let mut servers = self.servers.write().await;
        for state in servers.iter_mut() {
            if !state.probed {
                probe_server(state, auth_timeout).await;
            }
        }
    }

    pub async fn snapshot_servers(&self) -> Vec<ServerState> {
        self.servers.read().await.clone()
    }

    /// Replaces the server states (connections reset, probes redone lazily).
    pub async fn reset_servers(&self, config: &Config, users: &[User]) {
        let mut servers = self.servers.write().await;
        *servers = build_server_states(config, users);
    }
}

/// One runtime state per configured section, with the scrape password looked
/// up in the users vault by the configured user name.
pub fn build_server_states(config: &Config, users: &[User]) -> Vec<ServerState> {
    config
        .servers
        .iter()
        .map(|server| {
            let password = find(users, &server.user).map(|u| u.password.clone());
            ServerState::new(server.clone(), password)
        })
        .collect()
}
