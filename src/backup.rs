//! Backup/Restore Codec
//!
//! Manual safety net: the whole application state as one pretty-printed JSON
//! file, and the inverse import. A restore replaces local state wholesale
//! through the same path a newer remote snapshot takes.

use chrono::{NaiveDate, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::db::DbError;
use crate::state::SnapshotStore;
use crate::sync::models::ApplicationSnapshot;

/// Collections a backup must carry (possibly empty) to be restorable
pub const REQUIRED_COLLECTIONS: [&str; 3] = ["products", "sales", "customers"];

/// Backup errors
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Invalid backup file: {0}")]
    Format(String),

    #[error("Backup is missing required collection: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] DbError),
}

/// Serialize a snapshot as a backup document
pub fn encode(snapshot: &ApplicationSnapshot) -> Result<Vec<u8>, BackupError> {
    let mut value = serde_json::to_value(snapshot).map_err(|e| BackupError::Format(e.to_string()))?;
    if let Value::Object(map) = &mut value {
        map.insert("exportDate".to_string(), Value::String(Utc::now().to_rfc3339()));
    }
    serde_json::to_vec_pretty(&value).map_err(|e| BackupError::Format(e.to_string()))
}

/// `backup-bodeguita-YYYY-MM-DD.json`
pub fn suggested_filename(date: NaiveDate) -> String {
    format!("backup-bodeguita-{}.json", date.format("%Y-%m-%d"))
}

fn parse(bytes: &[u8]) -> Result<Value, BackupError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| BackupError::Format(e.to_string()))?;
    if !value.is_object() {
        return Err(BackupError::Format("expected a JSON object".to_string()));
    }
    Ok(value)
}

fn into_snapshot(value: Value) -> Result<ApplicationSnapshot, BackupError> {
    serde_json::from_value(value).map_err(|e| BackupError::Format(e.to_string()))
}

/// Parse a backup document. Missing collections default to empty; use
/// [`validate`] (or [`restore`]) when the file must be complete.
pub fn decode(bytes: &[u8]) -> Result<ApplicationSnapshot, BackupError> {
    into_snapshot(parse(bytes)?)
}

/// First required collection that is absent or not an array
fn missing_collection(value: &Value) -> Option<&'static str> {
    REQUIRED_COLLECTIONS
        .iter()
        .copied()
        .find(|field| !value.get(*field).map(Value::is_array).unwrap_or(false))
}

/// True iff `products`, `sales` and `customers` are present arrays
pub fn validate(value: &Value) -> bool {
    missing_collection(value).is_none()
}

/// Decode, validate, then replace the local state. Nothing is written
/// unless every step before the import succeeds.
pub fn restore(bytes: &[u8], state: &dyn SnapshotStore) -> Result<ApplicationSnapshot, BackupError> {
    let value = parse(bytes)?;
    if let Some(field) = missing_collection(&value) {
        log::warn!("Rejected backup: '{}' missing or not a list", field);
        return Err(BackupError::Validation(field.to_string()));
    }

    let snapshot = into_snapshot(value)?;
    state.import_snapshot(snapshot.clone())?;
    log::info!("Restored backup ({} records)", snapshot.record_count());
    Ok(snapshot)
}

/// Write the current state to `dir` under today's backup file name
pub fn export_to_dir(state: &dyn SnapshotStore, dir: &Path) -> Result<PathBuf, BackupError> {
    let snapshot = state.export_snapshot()?;
    let bytes = encode(&snapshot)?;

    std::fs::create_dir_all(dir)?;
    let path = dir.join(suggested_filename(Utc::now().date_naive()));
    std::fs::write(&path, bytes)?;

    log::info!("Backup written to {} ({} records)", path.display(), snapshot.record_count());
    Ok(path)
}

/// Read a backup file and restore it
pub fn restore_file(path: &Path, state: &dyn SnapshotStore) -> Result<ApplicationSnapshot, BackupError> {
    let bytes = std::fs::read(path)?;
    restore(&bytes, state)
}
