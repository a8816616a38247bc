//! Background Sync Scheduler
//!
//! Drives push cycles: a periodic timer, a debounced trigger after each
//! reconnect, a debounced trigger after local edits, and manual "sync now"
//! requests. At most one push is in flight;
//! a push requested meanwhile is dropped, not queued.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use super::connectivity::{ConnectivityEvent, ConnectivityMonitor, ConnectivityProbe};
use super::models::{SyncConfig, SyncMetadata};
use super::store::CloudStore;
use crate::state::{ChangeHook, SnapshotStore};

/// `lastError` recorded when a push is attempted offline
pub const OFFLINE_ERROR: &str = "offline";
/// `lastError` recorded when credentials are absent
pub const NOT_CONFIGURED_ERROR: &str = "not configured";

/// Scheduler timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub push_interval: Duration,
    pub reconnect_debounce: Duration,
    /// Quiet period after a local change before it is pushed
    pub change_debounce: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            push_interval: Duration::from_secs(5 * 60),
            reconnect_debounce: Duration::from_secs(1),
            change_debounce: Duration::from_secs(2),
        }
    }
}

impl From<&SyncConfig> for SchedulerConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            push_interval: config.push_interval(),
            reconnect_debounce: config.reconnect_debounce(),
            change_debounce: config.change_debounce(),
        }
    }
}

/// Why a push did not reach the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotConfigured,
    Offline,
    InFlight,
}

/// Result of one push cycle
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Synced(DateTime<Utc>),
    Skipped(SkipReason),
    Failed(String),
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

/// Marks `is_syncing` for its lifetime; cleared on every exit path
struct SyncingGuard {
    metadata: Arc<StdMutex<SyncMetadata>>,
}

impl SyncingGuard {
    fn begin(metadata: &Arc<StdMutex<SyncMetadata>>) -> Self {
        lock(metadata).is_syncing = true;
        Self {
            metadata: Arc::clone(metadata),
        }
    }
}

impl Drop for SyncingGuard {
    fn drop(&mut self) {
        lock(&self.metadata).is_syncing = false;
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Push scheduler for one device
#[derive(Clone)]
pub struct SyncScheduler {
    cloud: Arc<StdRwLock<Arc<CloudStore>>>,
    state: Arc<dyn SnapshotStore>,
    monitor: Arc<ConnectivityMonitor>,
    metadata: Arc<StdMutex<SyncMetadata>>,
    /// Single-flight guard: held for the duration of a push
    flight: Arc<Mutex<()>>,
    config: Arc<StdMutex<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    tasks: Arc<StdMutex<Vec<JoinHandle<()>>>>,
    debounce: Arc<StdMutex<Option<JoinHandle<()>>>>,
    /// Signalled by the state store on every local mutation
    changes: Arc<Notify>,
    change_pending: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl SyncScheduler {
    pub fn new(
        cloud: Arc<CloudStore>,
        state: Arc<dyn SnapshotStore>,
        monitor: Arc<ConnectivityMonitor>,
        config: SchedulerConfig,
    ) -> Self {
        let last_sync = state.last_sync().unwrap_or_else(|e| {
            log::warn!("Could not read stored sync timestamp: {}", e);
            None
        });

        let metadata = SyncMetadata {
            last_sync,
            is_online: monitor.is_online(),
            is_syncing: false,
            last_error: if cloud.is_configured() {
                None
            } else {
                Some(NOT_CONFIGURED_ERROR.to_string())
            },
        };

        Self {
            cloud: Arc::new(StdRwLock::new(cloud)),
            state,
            monitor,
            metadata: Arc::new(StdMutex::new(metadata)),
            flight: Arc::new(Mutex::new(())),
            config: Arc::new(StdMutex::new(config)),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Arc::new(StdMutex::new(Vec::new())),
            debounce: Arc::new(StdMutex::new(None)),
            changes: Arc::new(Notify::new()),
            change_pending: Arc::new(StdMutex::new(None)),
        }
    }

    /// Record a local mutation; pushed once edits pause for `change_debounce`
    pub fn notify_local_change(&self) {
        self.changes.notify_one();
    }

    /// Hook for [`SnapshotStore::set_change_hook`]
    pub fn change_hook(&self) -> ChangeHook {
        let changes = Arc::clone(&self.changes);
        Arc::new(move || changes.notify_one())
    }

    /// Adapter pushes currently go to
    pub fn current_cloud(&self) -> Arc<CloudStore> {
        Arc::clone(&self.cloud.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Current status, with `is_online` read from the monitor
    pub fn status(&self) -> SyncMetadata {
        let mut status = lock(&self.metadata).clone();
        status.is_online = self.monitor.is_online();
        status
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        lock(&self.metadata).last_sync
    }

    /// Move the local sync point, e.g. after adopting a remote snapshot
    pub fn set_last_sync(&self, at: Option<DateTime<Utc>>) {
        lock(&self.metadata).last_sync = at;
        if let Err(e) = self.state.record_last_sync(at) {
            log::error!("Failed to persist sync timestamp: {}", e);
        }
    }

    /// Attempt one synchronization cycle
    pub async fn push(&self) -> PushOutcome {
        if !self.current_cloud().is_configured() {
            log::debug!("Push skipped: sync not configured");
            return PushOutcome::Skipped(SkipReason::NotConfigured);
        }

        if !self.monitor.is_online() {
            let mut metadata = lock(&self.metadata);
            metadata.is_online = false;
            metadata.last_error = Some(OFFLINE_ERROR.to_string());
            log::info!("Push skipped: offline");
            return PushOutcome::Skipped(SkipReason::Offline);
        }

        let _flight = match self.flight.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::debug!("Push dropped: another push is in flight");
                return PushOutcome::Skipped(SkipReason::InFlight);
            }
        };

        // Re-read under the guard: a rebind may have completed meanwhile
        let cloud = self.current_cloud();
        if !cloud.is_configured() {
            return PushOutcome::Skipped(SkipReason::NotConfigured);
        }

        let _syncing = SyncingGuard::begin(&self.metadata);

        let snapshot = match self.state.export_snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let reason = format!("Failed to capture local state: {}", e);
                log::error!("{}", reason);
                lock(&self.metadata).last_error = Some(reason.clone());
                return PushOutcome::Failed(reason);
            }
        };

        match cloud.try_save(&snapshot).await {
            Ok(saved_at) => {
                {
                    let mut metadata = lock(&self.metadata);
                    metadata.last_sync = Some(saved_at);
                    metadata.last_error = None;
                }
                if let Err(e) = self.state.record_last_sync(Some(saved_at)) {
                    log::error!("Failed to persist sync timestamp: {}", e);
                }
                PushOutcome::Synced(saved_at)
            }
            Err(e) => {
                let reason = e.to_string();
                log::error!("Push failed: {}", reason);
                lock(&self.metadata).last_error = Some(reason.clone());
                PushOutcome::Failed(reason)
            }
        }
    }

    /// Request a push now without waiting for it
    pub fn trigger_now(&self) -> JoinHandle<PushOutcome> {
        log::info!("Manual sync requested");
        self.spawn_push("Manual")
    }

    /// Swap the cloud adapter once any in-flight push has drained
    pub async fn rebind(&self, cloud: Arc<CloudStore>) {
        let _drained = self.flight.lock().await;
        let configured = cloud.is_configured();
        *self.cloud.write().unwrap_or_else(|e| e.into_inner()) = cloud;

        let mut metadata = lock(&self.metadata);
        metadata.is_syncing = false;
        metadata.last_error = if configured {
            None
        } else {
            Some(NOT_CONFIGURED_ERROR.to_string())
        };
        log::info!("Scheduler rebound (configured={})", configured);
    }

    pub fn config(&self) -> SchedulerConfig {
        *lock(&self.config)
    }

    /// Replace timing; takes effect on the next `start`
    pub fn set_config(&self, config: SchedulerConfig) {
        *lock(&self.config) = config;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Arm the periodic trigger (fires once immediately), the reconnect
    /// trigger and the local change trigger
    pub fn start(&self) -> Result<(), SchedulerError> {
        let config = self.config();
        if config.push_interval.is_zero() {
            return Err(SchedulerError::InvalidInterval(
                "push interval must be greater than zero".to_string(),
            ));
        }

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        // Subscribe before spawning so no transition is missed
        let events = self.monitor.subscribe();

        let periodic = tokio::spawn(Self::periodic_loop(self.clone(), config.push_interval));
        let reconnect = tokio::spawn(Self::reconnect_loop(self.clone(), events, config.reconnect_debounce));
        let changes = tokio::spawn(Self::change_loop(self.clone(), config.change_debounce));

        let mut tasks = lock(&self.tasks);
        tasks.push(periodic);
        tasks.push(reconnect);
        tasks.push(changes);

        log::info!(
            "Sync scheduler started (interval: {:?}, reconnect debounce: {:?}, change debounce: {:?})",
            config.push_interval,
            config.reconnect_debounce,
            config.change_debounce
        );
        Ok(())
    }

    /// Cancel all triggers. A push already running is detached from them and
    /// completes on its own; `rebind` waits for it.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if let Some(pending) = lock(&self.debounce).take() {
            pending.abort();
        }
        if let Some(pending) = lock(&self.change_pending).take() {
            pending.abort();
        }

        log::info!("Sync scheduler stopped");
        Ok(())
    }

    async fn periodic_loop(scheduler: SyncScheduler, every: Duration) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if !scheduler.is_running() {
                log::info!("Scheduler loop: stopping (running flag is false)");
                break;
            }

            log::debug!("Periodic sync triggered");
            scheduler.spawn_push("Periodic");
        }
    }

    /// Run a push outside the trigger task so stopping triggers never
    /// cancels a write the server may already have committed
    fn spawn_push(&self, trigger: &'static str) -> JoinHandle<PushOutcome> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let outcome = scheduler.push().await;
            match &outcome {
                PushOutcome::Synced(at) => log::info!("{} sync completed at {}", trigger, at.to_rfc3339()),
                PushOutcome::Failed(reason) => log::warn!("{} sync failed: {}", trigger, reason),
                PushOutcome::Skipped(reason) => log::debug!("{} sync skipped: {:?}", trigger, reason),
            }
            outcome
        })
    }

    async fn change_loop(scheduler: SyncScheduler, debounce: Duration) {
        let changes = Arc::clone(&scheduler.changes);
        loop {
            changes.notified().await;
            Self::arm(&scheduler.change_pending, &scheduler, debounce, "Local change");
        }
    }

    async fn reconnect_loop(
        scheduler: SyncScheduler,
        mut events: broadcast::Receiver<ConnectivityEvent>,
        debounce: Duration,
    ) {
        loop {
            match events.recv().await {
                Ok(ConnectivityEvent::Online) => scheduler.schedule_reconnect_push(debounce),
                Ok(ConnectivityEvent::Offline) => {
                    lock(&scheduler.metadata).is_online = false;
                    if let Some(pending) = lock(&scheduler.debounce).take() {
                        pending.abort();
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Missed {} connectivity events", skipped);
                    if scheduler.monitor.is_online() {
                        scheduler.schedule_reconnect_push(debounce);
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    fn schedule_reconnect_push(&self, debounce: Duration) {
        lock(&self.metadata).is_online = true;
        Self::arm(&self.debounce, self, debounce, "Reconnect");
    }

    /// (Re)arm a debounced push in `slot`. Only the wait is cancellable; a
    /// push that has started runs to completion.
    fn arm(
        slot: &StdMutex<Option<JoinHandle<()>>>,
        scheduler: &SyncScheduler,
        debounce: Duration,
        trigger: &'static str,
    ) {
        let scheduler = scheduler.clone();
        let pending = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            scheduler.spawn_push(trigger);
        });

        if let Some(previous) = lock(slot).replace(pending) {
            previous.abort();
        }
    }
}

/// Probes whichever adapter is currently bound. While unconfigured there is
/// nothing to probe and the last known state is kept.
#[async_trait]
impl ConnectivityProbe for SyncScheduler {
    async fn probe(&self) -> bool {
        let cloud = self.current_cloud();
        if !cloud.is_configured() {
            return self.monitor.is_online();
        }
        cloud.check_connection().await
    }
}
