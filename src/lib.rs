//! Pharmacy POS offline subsystem.
//!
//! Keeps the point of sale usable while the server is unreachable: reference
//! data and queued sales live in a local SQLite store, connectivity is
//! tracked by a periodic health probe, queued sales are replayed when the
//! connection returns, and page/asset requests are answered from a versioned
//! response cache.

pub mod api;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod logging;
pub mod sales;
pub mod store;
pub mod sync;

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{ServerClient, TransportError};
use crate::cache::{CacheLayer, CachePolicy, CacheStorage};
use crate::config::OfflineConfig;
use crate::connectivity::{ConnectivityMonitor, ProbeHandle};
use crate::store::LocalStore;
use crate::sync::SyncCoordinator;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to build server client: {0}")]
    Transport(#[from] TransportError),
}

/// Every long-lived component of the subsystem, wired together.
pub struct OfflineRuntime {
    pub config: OfflineConfig,
    pub store: Arc<LocalStore>,
    pub connectivity: ConnectivityMonitor,
    pub coordinator: Arc<SyncCoordinator>,
    /// `None` when the cache database could not be opened.
    pub cache: Option<Arc<CacheLayer>>,
    probe: Option<ProbeHandle>,
    reconnect: Option<JoinHandle<()>>,
}

impl OfflineRuntime {
    /// Open storage, take an initial connectivity reading, prepare the
    /// response cache and start the background probe and reconnect listener.
    ///
    /// Unusable local storage does not fail startup: sales then go straight
    /// to the server, offline queueing reports storage unavailable and
    /// requests are not intercepted by the cache.
    pub async fn start(config: OfflineConfig) -> Result<Self, StartupError> {
        let client = Arc::new(ServerClient::new(&config)?);

        let db_path = config.database_path();
        let store = Arc::new(LocalStore::open(&db_path));
        if !store.is_available() {
            warn!(path = %db_path.display(), "Local store unavailable, offline queueing disabled");
        }

        let online = client.check_health().await;
        info!(server = client.base_url(), online, "Initial connectivity");
        let connectivity = ConnectivityMonitor::new(online);

        let coordinator = Arc::new(SyncCoordinator::new(
            store.clone(),
            client.clone(),
            connectivity.clone(),
        ));

        let cache = match CacheStorage::open(&db_path) {
            Ok(storage) => {
                let cache = Arc::new(CacheLayer::new(
                    Arc::new(storage),
                    client.clone(),
                    CachePolicy::from_config(&config),
                ));
                prepare_cache(&cache, online).await;
                Some(cache)
            }
            Err(e) => {
                warn!(path = %db_path.display(), error = %e, "Response cache unavailable");
                None
            }
        };

        let probe = connectivity.spawn_probe(client, config.probe_interval());
        let reconnect = sync::start_reconnect_listener(coordinator.clone(), config.reconnect_delay());

        Ok(Self {
            config,
            store,
            connectivity,
            coordinator,
            cache,
            probe: Some(probe),
            reconnect: Some(reconnect),
        })
    }

    /// Stop background tasks and flush pending cache writes.
    pub async fn shutdown(mut self) {
        if let Some(probe) = self.probe.take() {
            probe.stop();
        }
        if let Some(reconnect) = self.reconnect.take() {
            reconnect.abort();
        }
        if let Some(cache) = &self.cache {
            cache.settle().await;
        }
        info!("Offline runtime stopped");
    }
}

async fn prepare_cache(cache: &CacheLayer, online: bool) {
    if online {
        let report = cache.install().await;
        info!(
            cached = report.cached,
            failed = report.failed.len(),
            "Precache finished"
        );
    }
    let deleted = cache.activate().await;
    if !deleted.is_empty() {
        info!(count = deleted.len(), "Removed stale caches");
    }
}
