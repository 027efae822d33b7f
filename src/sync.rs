//! Offline sale queueing and replay.
//!
//! [`SyncCoordinator::queue_or_send`] submits a sale straight to
//! `/sales/new` while online and parks it in the local queue while offline.
//! [`SyncCoordinator::drain_queue`] replays parked sales to `/sales/sync`,
//! oldest first. A rejected entry is skipped and stays queued; a transport
//! failure ends the pass, since connectivity is presumed lost.
//!
//! At most one drain runs at a time. A trigger arriving mid-drain is dropped;
//! the next natural trigger (reconnect, background sync) picks up the rest.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::TransportError;
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::sales::{PendingSale, SalePayload};
use crate::store::{LocalStore, StoreError, LAST_SYNC_KEY};

/// Tag of the platform background-sync trigger that replays the queue.
pub const BACKGROUND_SYNC_TAG: &str = "sync-sales";

const EVENT_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaleEndpoint {
    /// Interactive submission while online.
    New,
    /// Replay of a queued offline sale; no anti-forgery token required.
    Sync,
}

impl SaleEndpoint {
    pub fn path(self) -> &'static str {
        match self {
            SaleEndpoint::New => "/sales/new",
            SaleEndpoint::Sync => "/sales/sync",
        }
    }
}

/// A completed HTTP exchange, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: Value,
}

impl RemoteResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait SaleTransport: Send + Sync {
    /// `Err` only when no response was received at all.
    async fn submit(
        &self,
        endpoint: SaleEndpoint,
        sale: &SalePayload,
    ) -> Result<RemoteResponse, TransportError>;
}

// ---------------------------------------------------------------------------
// Results and events
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("local storage is unavailable; sale cannot be queued offline")]
    StorageUnavailable,
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable => SyncError::StorageUnavailable,
            other => SyncError::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaleOutcome {
    /// Stored locally for later replay.
    QueuedOffline { queued_at: i64 },
    /// Sent to `/sales/new`; the server's answer is passed through.
    Sent(RemoteResponse),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    AlreadySyncing,
    StorageUnavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub queued_at: i64,
    pub status: u16,
    pub body: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub attempted: usize,
    pub synced: usize,
    pub rejected: Vec<Rejection>,
    pub corrupt: usize,
    /// The pass stopped early on a transport failure.
    pub aborted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    Skipped(SkipReason),
    Completed(DrainReport),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A drain pass synced at least one sale.
    Completed { synced: usize, message: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub storage_available: bool,
    pub pending_sales: Option<usize>,
    pub last_sync: Option<String>,
}

/// Clears the in-progress flag however the drain pass ends.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    transport: Arc<dyn SaleTransport>,
    connectivity: ConnectivityMonitor,
    syncing: AtomicBool,
    last_queued_at: Mutex<i64>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<LocalStore>,
        transport: Arc<dyn SaleTransport>,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            transport,
            connectivity,
            syncing: AtomicBool::new(false),
            last_queued_at: Mutex::new(0),
            events,
        }
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Next queue key: the current time in ms, bumped past the last key
    /// handed out so two sales in the same millisecond never collide.
    fn next_queue_key(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut last = self
            .last_queued_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let key = now.max(*last + 1);
        *last = key;
        key
    }

    /// Submit a sale now, or queue it when offline.
    pub async fn queue_or_send(&self, sale: SalePayload) -> Result<SaleOutcome, SyncError> {
        if !self.connectivity.is_online() {
            if !self.store.is_available() {
                warn!("Offline with no local storage; sale cannot be queued");
                return Err(SyncError::StorageUnavailable);
            }
            let pending = PendingSale::new(sale, self.next_queue_key());
            let queued_at = self.store.queue_sale(&pending).await?;
            info!(queued_at, "Sale queued for sync when online");
            return Ok(SaleOutcome::QueuedOffline { queued_at });
        }

        let response = self
            .transport
            .submit(SaleEndpoint::New, &sale)
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to save sale");
                e
            })?;
        Ok(SaleOutcome::Sent(response))
    }

    /// Replay every unsynced queued sale. Never returns an error; failures
    /// are reported through the outcome and the log.
    pub async fn drain_queue(&self) -> DrainOutcome {
        if !self.connectivity.is_online() {
            return DrainOutcome::Skipped(SkipReason::Offline);
        }
        if !self.store.is_available() {
            return DrainOutcome::Skipped(SkipReason::StorageUnavailable);
        }
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Drain already in progress, trigger dropped");
            return DrainOutcome::Skipped(SkipReason::AlreadySyncing);
        }
        let _guard = SyncingGuard(&self.syncing);

        info!("Starting offline data sync");

        let scan = match self.store.queued_sales().await {
            Ok(scan) => scan,
            Err(e) => {
                warn!(error = %e, "Sync failed: could not read queued sales");
                return DrainOutcome::Failed(e.to_string());
            }
        };

        let mut report = DrainReport {
            corrupt: scan.corrupt.len(),
            ..DrainReport::default()
        };
        for key in &scan.corrupt {
            warn!(key = %key, "Skipping malformed queued sale");
        }

        if scan.pending.is_empty() {
            debug!("No queued sales to sync");
            return DrainOutcome::Completed(report);
        }

        let total = scan.pending.len();
        info!(total, "Syncing queued sales");

        for sale in scan.pending {
            report.attempted += 1;
            match self.transport.submit(SaleEndpoint::Sync, &sale.sale).await {
                Ok(resp) if resp.is_success() => {
                    match self.store.mark_sale_synced(sale.queued_at).await {
                        Ok(true) => {
                            report.synced += 1;
                            info!(
                                queued_at = sale.queued_at,
                                "Synced sale {}/{}",
                                report.synced,
                                total
                            );
                        }
                        Ok(false) => {
                            warn!(
                                queued_at = sale.queued_at,
                                "Queued sale disappeared before it could be marked synced"
                            );
                        }
                        Err(e) => {
                            warn!(
                                queued_at = sale.queued_at,
                                error = %e,
                                "Sale accepted by server but could not be marked synced"
                            );
                        }
                    }
                }
                Ok(resp) => {
                    warn!(
                        queued_at = sale.queued_at,
                        status = resp.status,
                        body = %resp.body,
                        "Failed to sync sale"
                    );
                    report.rejected.push(Rejection {
                        queued_at: sale.queued_at,
                        status: resp.status,
                        body: resp.body,
                    });
                }
                Err(e) => {
                    warn!(
                        queued_at = sale.queued_at,
                        error = %e,
                        "Sync error, stopping pass"
                    );
                    report.aborted = true;
                    break;
                }
            }
        }

        if report.synced > 0 {
            let finished = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            if let Err(e) = self
                .store
                .set_metadata(LAST_SYNC_KEY, Value::String(finished))
                .await
            {
                warn!(error = %e, "Could not record last sync time");
            }

            let message = format!("{} offline sales synced successfully!", report.synced);
            info!("{message}");
            let _ = self.events.send(SyncEvent::Completed {
                synced: report.synced,
                message,
            });
        }

        DrainOutcome::Completed(report)
    }

    /// Platform background-sync trigger. Only [`BACKGROUND_SYNC_TAG`] is
    /// handled; other tags return `None`.
    pub async fn on_background_sync(&self, tag: &str) -> Option<DrainOutcome> {
        if tag != BACKGROUND_SYNC_TAG {
            debug!(tag, "Ignoring unknown background sync tag");
            return None;
        }
        Some(self.drain_queue().await)
    }

    /// Completion time of the last pass that synced anything.
    pub async fn last_sync(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let raw = self.store.get_metadata(LAST_SYNC_KEY).await?;
        Ok(raw
            .as_ref()
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    pub async fn status(&self) -> SyncStatus {
        let storage_available = self.store.is_available();
        let pending_sales = self.store.pending_count().await.ok();
        let last_sync = self
            .last_sync()
            .await
            .ok()
            .flatten()
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true));
        SyncStatus {
            is_online: self.connectivity.is_online(),
            is_syncing: self.is_syncing(),
            storage_available,
            pending_sales,
            last_sync,
        }
    }
}

/// Drain after `delay` at startup (when online) and after every
/// became-online transition.
pub fn start_reconnect_listener(coordinator: Arc<SyncCoordinator>, delay: Duration) -> JoinHandle<()> {
    let mut events = coordinator.connectivity().subscribe();

    tokio::spawn(async move {
        if coordinator.connectivity().is_online() {
            tokio::time::sleep(delay).await;
            log_outcome("startup", &coordinator.drain_queue().await);
        }

        loop {
            match events.recv().await {
                Ok(ConnectivityEvent::BecameOnline) => {
                    tokio::time::sleep(delay).await;
                    log_outcome("reconnect", &coordinator.drain_queue().await);
                }
                Ok(ConnectivityEvent::BecameOffline) => {
                    if let Some(banner) = coordinator.connectivity().banner() {
                        warn!("{banner}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Connectivity events lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_outcome(trigger: &str, outcome: &DrainOutcome) {
    match outcome {
        DrainOutcome::Completed(report) if report.attempted > 0 || report.corrupt > 0 => {
            info!(
                trigger,
                attempted = report.attempted,
                synced = report.synced,
                rejected = report.rejected.len(),
                corrupt = report.corrupt,
                aborted = report.aborted,
                "Sync pass finished"
            );
        }
        DrainOutcome::Completed(_) => {}
        DrainOutcome::Skipped(reason) => debug!(trigger, ?reason, "Sync pass skipped"),
        DrainOutcome::Failed(e) => warn!(trigger, error = %e, "Sync pass failed"),
    }
}
