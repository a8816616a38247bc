//! Sync Manager - wires the engine together
//!
//! Owns the configure state machine (`Unconfigured <-> Configured`): every
//! credential change cancels the listener, drains an in-flight push, rebinds
//! the cloud adapter, then re-subscribes and restarts the scheduler.
//! Remote changes go through the reconciliation policy before they replace
//! local state; writes carrying this device's id never do.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::connectivity::ConnectivityMonitor;
use super::listener::{ChangeListener, Subscription};
use super::models::{
    ApplicationSnapshot, ConfigError, DeviceIdentity, RemoteChange, SyncConfig, SyncMetadata, SyncState,
};
use super::reconcile::reconcile;
use super::scheduler::{PushOutcome, SchedulerConfig, SchedulerError, SyncScheduler};
use super::store::{CloudStore, SyncError};
use crate::backup::{self, BackupError};
use crate::db::{Database, DbError, SYNC_CONFIG_KEY};
use crate::state::SnapshotStore;

/// Current adapter binding and listener
struct Binding {
    config: Option<SyncConfig>,
    listen_interval: Duration,
    subscription: Subscription,
    started: bool,
}

/// Sync manager - main orchestrator
#[derive(Clone)]
pub struct SyncManager {
    state: Arc<dyn SnapshotStore>,
    db: Option<Arc<Database>>,
    device: DeviceIdentity,
    monitor: Arc<ConnectivityMonitor>,
    scheduler: SyncScheduler,
    binding: Arc<Mutex<Binding>>,
}

impl SyncManager {
    /// Unconfigured manager over an arbitrary state store; nothing is persisted
    pub fn new(state: Arc<dyn SnapshotStore>, device: DeviceIdentity, monitor: Arc<ConnectivityMonitor>) -> Self {
        let cloud = Arc::new(CloudStore::unconfigured(device.clone()));
        Self::assemble(state, None, device, monitor, cloud, None)
    }

    /// Manager backed by the local database: device identity, local snapshot
    /// and persisted configuration (with `BODEGA_SYNC_*` overrides)
    pub fn open(db: Arc<Database>, monitor: Arc<ConnectivityMonitor>) -> Result<Self, SyncManagerError> {
        let device = db.device_identity()?;
        let config = load_config(&db)?;

        let cloud = match &config {
            Some(config) => CloudStore::from_config(config, device.clone()),
            None => {
                log::warn!("Cloud sync not configured; running local-only");
                CloudStore::unconfigured(device.clone())
            }
        };

        let state: Arc<dyn SnapshotStore> = db.clone();
        Ok(Self::assemble(state, Some(db), device, monitor, Arc::new(cloud), config))
    }

    fn assemble(
        state: Arc<dyn SnapshotStore>,
        db: Option<Arc<Database>>,
        device: DeviceIdentity,
        monitor: Arc<ConnectivityMonitor>,
        cloud: Arc<CloudStore>,
        config: Option<SyncConfig>,
    ) -> Self {
        // Only a config that produced a live adapter counts as configured
        let config = config.filter(|_| cloud.is_configured());
        let timing = config.as_ref().map(SchedulerConfig::from).unwrap_or_default();
        let listen_interval = config
            .as_ref()
            .map(SyncConfig::listen_interval)
            .unwrap_or_else(|| SyncConfig::default().listen_interval());

        let scheduler = SyncScheduler::new(cloud, Arc::clone(&state), Arc::clone(&monitor), timing);
        state.set_change_hook(scheduler.change_hook());

        Self {
            state,
            db,
            device,
            monitor,
            scheduler,
            binding: Arc::new(Mutex::new(Binding {
                config,
                listen_interval,
                subscription: Subscription::inert(),
                started: false,
            })),
        }
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub async fn sync_state(&self) -> SyncState {
        if self.binding.lock().await.config.is_some() {
            SyncState::Configured
        } else {
            SyncState::Unconfigured
        }
    }

    pub async fn config(&self) -> Option<SyncConfig> {
        self.binding.lock().await.config.clone()
    }

    pub fn status(&self) -> SyncMetadata {
        self.scheduler.status()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the engine: catch up with the remote document, subscribe to
    /// changes and arm the scheduler. While unconfigured only the intent is
    /// recorded; a later `configure` brings sync up.
    pub async fn start(&self) -> Result<(), SyncManagerError> {
        let mut binding = self.binding.lock().await;
        if binding.started {
            return Err(SchedulerError::AlreadyRunning.into());
        }
        binding.started = true;

        if binding.config.is_none() {
            log::warn!("Sync engine started without cloud configuration");
            return Ok(());
        }
        self.bring_up(&mut binding).await
    }

    /// Cancel the listener and the scheduler triggers
    pub async fn shutdown(&self) {
        let mut binding = self.binding.lock().await;
        binding.started = false;
        binding.subscription.cancel();
        if self.scheduler.is_running() {
            let _ = self.scheduler.stop();
        }
        log::info!("Sync engine stopped");
    }

    /// Bind new credentials (`Unconfigured -> Configured`, or re-configure)
    pub async fn configure(&self, config: SyncConfig) -> Result<SyncState, SyncManagerError> {
        config.validate()?;
        let cloud = CloudStore::from_config(&config, self.device.clone());
        self.configure_with(config, cloud).await
    }

    /// Bind new credentials over an explicitly built adapter
    pub async fn configure_with(&self, config: SyncConfig, cloud: CloudStore) -> Result<SyncState, SyncManagerError> {
        config.validate()?;
        if !cloud.is_configured() {
            return Err(SyncManagerError::NotConfigured);
        }
        if let Some(db) = &self.db {
            db.set_setting(SYNC_CONFIG_KEY, &config)?;
        }

        log::info!(
            "Configuring cloud sync (project {}, document {})",
            config.project_id,
            cloud.document_id()
        );
        self.rebind(Some(config), Arc::new(cloud)).await
    }

    /// Remove credentials (`Configured -> Unconfigured`)
    pub async fn unconfigure(&self) -> Result<SyncState, SyncManagerError> {
        if let Some(db) = &self.db {
            db.delete_setting(SYNC_CONFIG_KEY)?;
        }
        log::info!("Removing cloud sync configuration");
        self.rebind(None, Arc::new(CloudStore::unconfigured(self.device.clone()))).await
    }

    async fn rebind(&self, config: Option<SyncConfig>, cloud: Arc<CloudStore>) -> Result<SyncState, SyncManagerError> {
        let mut binding = self.binding.lock().await;

        binding.subscription.cancel();
        if self.scheduler.is_running() {
            self.scheduler.stop()?;
        }
        self.scheduler.rebind(cloud).await;

        if let Some(config) = &config {
            self.scheduler.set_config(SchedulerConfig::from(config));
            binding.listen_interval = config.listen_interval();
        }
        binding.config = config;

        if binding.config.is_none() {
            return Ok(SyncState::Unconfigured);
        }
        if binding.started {
            self.bring_up(&mut binding).await?;
        }
        Ok(SyncState::Configured)
    }

    async fn bring_up(&self, binding: &mut Binding) -> Result<(), SyncManagerError> {
        let cloud = self.scheduler.current_cloud();

        // Adopt a newer remote snapshot before the first push can overwrite it
        if self.monitor.is_online() {
            match cloud.load_document().await {
                Ok(Some(document)) => {
                    self.apply(document.into_change())?;
                }
                Ok(None) => log::info!("No remote document yet; first push will create it"),
                Err(e) => log::warn!("Initial catch-up failed: {}", e),
            }
        }

        let listener = ChangeListener::new(cloud, binding.listen_interval);
        let reconciler = self.reconciler();
        binding.subscription = listener.subscribe(move |change| {
            if let Err(e) = reconciler.apply(change) {
                log::error!("Failed to apply remote change: {}", e);
            }
        });

        self.scheduler.start()?;
        Ok(())
    }

    /// Run a remote change through the reconciliation policy; returns
    /// whether it replaced local state
    pub fn apply(&self, change: RemoteChange) -> Result<bool, SyncManagerError> {
        Ok(self.reconciler().apply(change)?)
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler {
            state: Arc::clone(&self.state),
            scheduler: self.scheduler.clone(),
            device: self.device.clone(),
        }
    }

    // ========================================================================
    // Manual operations
    // ========================================================================

    /// Run one push cycle now and wait for it
    pub async fn push_now(&self) -> PushOutcome {
        self.scheduler.push().await
    }

    /// Request a push without waiting
    pub fn trigger_now(&self) -> JoinHandle<PushOutcome> {
        self.scheduler.trigger_now()
    }

    /// Fetch the remote document. Reconciled unless `force`, which adopts it
    /// regardless of timestamps. Returns whether local state was replaced.
    pub async fn pull(&self, force: bool) -> Result<bool, SyncManagerError> {
        let cloud = self.scheduler.current_cloud();
        if !cloud.is_configured() {
            return Err(SyncManagerError::NotConfigured);
        }

        let document = match cloud.load_document().await? {
            Some(document) => document,
            None => {
                log::info!("Nothing to pull: no remote document {}", cloud.document_id());
                return Ok(false);
            }
        };

        let change = document.into_change();
        if !force {
            return self.apply(change);
        }

        log::info!("Force-adopting remote snapshot ({} records)", change.snapshot.record_count());
        self.reconciler().adopt(change)?;
        Ok(true)
    }

    /// Periodically probe the bound adapter and feed the monitor
    pub fn spawn_probe(&self, every: Duration) -> JoinHandle<()> {
        self.monitor.spawn_probe(Arc::new(self.scheduler.clone()), every)
    }

    pub fn snapshot(&self) -> Result<ApplicationSnapshot, SyncManagerError> {
        Ok(self.state.export_snapshot()?)
    }

    pub fn backup_to_dir(&self, dir: &Path) -> Result<PathBuf, SyncManagerError> {
        Ok(backup::export_to_dir(self.state.as_ref(), dir)?)
    }

    /// Replace local state with a backup; the restored state is pushed like
    /// any other local edit
    pub fn restore_file(&self, path: &Path) -> Result<ApplicationSnapshot, SyncManagerError> {
        let snapshot = backup::restore_file(path, self.state.as_ref())?;
        self.scheduler.notify_local_change();
        Ok(snapshot)
    }
}

/// Applies remote changes to local state; handed to the listener callback
#[derive(Clone)]
struct Reconciler {
    state: Arc<dyn SnapshotStore>,
    scheduler: SyncScheduler,
    device: DeviceIdentity,
}

impl Reconciler {
    fn apply(&self, change: RemoteChange) -> Result<bool, DbError> {
        let local = self.scheduler.last_sync();

        // Our own write carries nothing newer than local state, even when its
        // ack never arrived; only the sync point catches up.
        if change.device_id.as_deref() == Some(self.device.as_str()) {
            if reconcile(local, change.last_sync) {
                log::info!("Own write confirmed remotely at {:?}", change.last_sync);
                self.scheduler.set_last_sync(change.last_sync);
            } else {
                log::debug!("Ignoring echo of our own write");
            }
            return Ok(false);
        }

        if !reconcile(local, change.last_sync) {
            log::debug!("Keeping local state (local {:?}, remote {:?})", local, change.last_sync);
            return Ok(false);
        }

        log::info!(
            "Adopting remote snapshot from {} ({} records, lastSync {:?})",
            change.device_id.as_deref().unwrap_or("unknown device"),
            change.snapshot.record_count(),
            change.last_sync
        );
        self.adopt(change)?;
        Ok(true)
    }

    /// Replace local state wholesale and move the sync point with it
    fn adopt(&self, change: RemoteChange) -> Result<(), DbError> {
        self.state.import_snapshot(change.snapshot)?;
        self.scheduler.set_last_sync(change.last_sync);
        Ok(())
    }
}

/// Persisted configuration with environment overrides; `None` when the
/// required credentials are still missing
pub fn load_config(db: &Database) -> Result<Option<SyncConfig>, DbError> {
    let stored: Option<SyncConfig> = db.get_setting(SYNC_CONFIG_KEY)?;
    let config = stored.unwrap_or_default().apply_env();

    match config.validate() {
        Ok(()) => Ok(Some(config)),
        Err(e) => {
            log::debug!("No usable sync configuration: {}", e);
            Ok(None)
        }
    }
}

/// Sync manager errors
#[derive(Debug, thiserror::Error)]
pub enum SyncManagerError {
    #[error("Sync is not configured")]
    NotConfigured,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),
}
