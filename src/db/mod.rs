//! Database module for bodega-sync
//!
//! SQLite storage for everything that must survive a restart: the device
//! identity, the sync configuration, the last successful sync time and the
//! local application snapshot.

use crate::state::{ChangeHook, SnapshotStore};
use crate::sync::models::{ApplicationSnapshot, DeviceIdentity};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

/// Settings key of the persisted device identity
pub const DEVICE_ID_KEY: &str = "device-id";
/// Settings key of the cloud configuration
pub const SYNC_CONFIG_KEY: &str = "sync-config";
/// Settings key of the last successful sync timestamp
pub const LAST_SYNC_KEY: &str = "sync-last-sync";

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
    on_change: Arc<RwLock<Option<ChangeHook>>>,
}

impl Database {
    /// Open (or create) the database file
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#)?;
        Self::initialize_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
            on_change: Arc::new(RwLock::new(None)),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every pooled connection to `:memory:` is a separate database, so the
    /// pool is pinned to a single connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder()
            .max_size(1)
            .build(manager)?;

        let conn = pool.get()?;
        Self::initialize_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
            on_change: Arc::new(RwLock::new(None)),
        })
    }

    fn initialize_schema(conn: &Connection) -> DbResult<()> {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        Ok(())
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = serde_json::to_string(value)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, json, Utc::now().to_rfc3339()],
        )?;

        Ok(())
    }

    /// Remove a setting; returns whether it existed
    pub fn delete_setting(&self, key: &str) -> DbResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute("DELETE FROM settings WHERE key = ?1", [key])?;
        Ok(affected > 0)
    }

    // =========================================================================
    // DEVICE IDENTITY
    // =========================================================================

    /// Load the device identity, generating and persisting it on first run
    pub fn device_identity(&self) -> DbResult<DeviceIdentity> {
        if let Some(existing) = self.get_setting::<DeviceIdentity>(DEVICE_ID_KEY)? {
            return Ok(existing);
        }

        let identity = DeviceIdentity::generate();
        let conn = self.get_conn()?;
        let json = serde_json::to_string(&identity)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        // Never overwrite an identity written by a concurrent first run
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![DEVICE_ID_KEY, json, Utc::now().to_rfc3339()],
        )?;
        drop(conn);

        let stored = self
            .get_setting::<DeviceIdentity>(DEVICE_ID_KEY)?
            .unwrap_or(identity);
        log::info!("Device identity: {}", stored);
        Ok(stored)
    }

    // =========================================================================
    // SYNC TIMESTAMP
    // =========================================================================

    pub fn last_sync(&self) -> DbResult<Option<DateTime<Utc>>> {
        self.get_setting(LAST_SYNC_KEY)
    }

    pub fn set_last_sync(&self, at: Option<DateTime<Utc>>) -> DbResult<()> {
        match at {
            Some(at) => self.set_setting(LAST_SYNC_KEY, &at),
            None => self.delete_setting(LAST_SYNC_KEY).map(|_| ()),
        }
    }

    // =========================================================================
    // APPLICATION SNAPSHOT
    // =========================================================================

    /// Load the stored snapshot, if any
    pub fn load_snapshot(&self) -> DbResult<Option<ApplicationSnapshot>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT data FROM app_snapshot WHERE id = 1",
            [],
            |row| row.get(0),
        );

        match result {
            Ok(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| DbError::Serialization(e.to_string())),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store a snapshot written by the local domain layer and report the change
    pub fn save_snapshot(&self, snapshot: &ApplicationSnapshot) -> DbResult<()> {
        self.write_snapshot(snapshot)?;

        let hook = self.on_change.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    fn write_snapshot(&self, snapshot: &ApplicationSnapshot) -> DbResult<()> {
        let json = serde_json::to_string(snapshot)
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        let conn = self.get_conn()?;

        conn.execute(
            "INSERT INTO app_snapshot (id, data, record_count, updated_at)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                record_count = excluded.record_count,
                updated_at = excluded.updated_at",
            params![json, snapshot.record_count() as i64, Utc::now().to_rfc3339()],
        )?;

        log::debug!("Stored local snapshot ({} records)", snapshot.record_count());
        Ok(())
    }
}

impl SnapshotStore for Database {
    fn export_snapshot(&self) -> DbResult<ApplicationSnapshot> {
        Ok(self.load_snapshot()?.unwrap_or_default())
    }

    fn import_snapshot(&self, snapshot: ApplicationSnapshot) -> DbResult<()> {
        self.write_snapshot(&snapshot)
    }

    fn last_sync(&self) -> DbResult<Option<DateTime<Utc>>> {
        Database::last_sync(self)
    }

    fn record_last_sync(&self, at: Option<DateTime<Utc>>) -> DbResult<()> {
        self.set_last_sync(at)
    }

    fn set_change_hook(&self, hook: ChangeHook) {
        *self.on_change.write().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }
}
