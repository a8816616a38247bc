//! # Bodega Sync
//!
//! Local-first cloud synchronization for the bodega point-of-sale app: the
//! store keeps working offline, and whenever a connection exists its state
//! converges with every other device through one cloud document.

pub mod backup;
pub mod cli;
pub mod db;
pub mod state;
pub mod sync;

use db::{Database, DbError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sync::{ConnectivityMonitor, SyncManager, SyncManagerError};

/// How often the daemon checks that the cloud is reachable
pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Startup errors
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Could not determine the application data directory")]
    NoDataDir,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error(transparent)]
    Sync(#[from] SyncManagerError),
}

/// Load `.env` and initialize the logger (`RUST_LOG` overrides `info`)
pub fn init_environment() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Platform data directory, created if missing
pub fn data_dir() -> Result<PathBuf, AppError> {
    let dirs = directories::ProjectDirs::from("com", "bodeguita", "bodega-sync").ok_or(AppError::NoDataDir)?;
    let data_dir = dirs.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;
    Ok(data_dir)
}

/// Open the local database under `data_dir` (or the platform default)
pub fn open_database(data_dir: Option<PathBuf>) -> Result<Arc<Database>, AppError> {
    let dir = match data_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            dir
        }
        None => self::data_dir()?,
    };

    let db_path = dir.join("bodega.db");
    log::info!("Database path: {:?}", db_path);
    Ok(Arc::new(Database::new(db_path)?))
}

/// Open the engine over the local database
pub fn open_manager(db: Arc<Database>) -> Result<SyncManager, AppError> {
    let monitor = Arc::new(ConnectivityMonitor::new());
    Ok(SyncManager::open(db, monitor)?)
}

/// Run the sync engine until Ctrl-C
pub async fn run_daemon(manager: SyncManager) -> Result<(), AppError> {
    manager.start().await?;
    let probe = manager.spawn_probe(PROBE_INTERVAL);

    log::info!("Sync engine running for device {} (Ctrl-C to stop)", manager.device());
    tokio::signal::ctrl_c().await?;

    log::info!("Shutting down");
    probe.abort();
    manager.shutdown().await;
    Ok(())
}
