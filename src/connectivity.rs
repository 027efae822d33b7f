//! Online/offline state tracking.
//!
//! The monitor holds the current connectivity flag and forwards every raw
//! transition to subscribers as a [`ConnectivityEvent`]. State is fed either
//! directly through [`ConnectivityMonitor::set_online`] or by a periodic
//! health probe against the server.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Text of the non-blocking banner shown while offline.
pub const OFFLINE_BANNER: &str =
    "Offline Mode: You are offline. New sales will be queued and synced when your connection returns.";

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    BecameOnline,
    BecameOffline,
}

/// Something that can tell whether the server is reachable right now.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check_health(&self) -> bool;
}

struct MonitorInner {
    online: AtomicBool,
    events: broadcast::Sender<ConnectivityEvent>,
}

/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(MonitorInner {
                online: AtomicBool::new(initially_online),
                events,
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Record the current state. Returns the emitted event when this call
    /// changed the state, `None` when it was already in that state.
    pub fn set_online(&self, online: bool) -> Option<ConnectivityEvent> {
        let previous = self.inner.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return None;
        }

        let event = if online {
            info!("Back online");
            ConnectivityEvent::BecameOnline
        } else {
            warn!("Gone offline");
            ConnectivityEvent::BecameOffline
        };
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
        Some(event)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.inner.events.subscribe()
    }

    /// Banner text while offline, `None` while online.
    pub fn banner(&self) -> Option<&'static str> {
        if self.is_online() {
            None
        } else {
            Some(OFFLINE_BANNER)
        }
    }

    /// Poll `probe` every `interval` and feed the result into the monitor.
    pub fn spawn_probe(&self, probe: Arc<dyn HealthProbe>, interval: Duration) -> ProbeHandle {
        let monitor = self.clone();

        let task = tokio::spawn(async move {
            info!(
                interval_ms = interval.as_millis() as u64,
                "Connectivity probe started"
            );
            loop {
                tokio::time::sleep(interval).await;
                let reachable = probe.check_health().await;
                monitor.set_online(reachable);
            }
        });

        ProbeHandle { task }
    }
}

pub struct ProbeHandle {
    task: JoinHandle<()>,
}

impl ProbeHandle {
    pub fn stop(self) {
        self.task.abort();
        info!("Connectivity probe stopped");
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
