//! Sync Data Models
//!
//! Defines the data exchanged between the local store and the cloud document.
//!
//! Data Categories:
//! - ApplicationSnapshot: every domain collection at one instant
//! - RemoteDocument: snapshot plus transport metadata (lastSync, deviceId)
//! - SyncMetadata: status surface owned by the scheduler
//! - SyncConfig: cloud credentials and engine tuning
//! - DeviceIdentity: the stable id of this installation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

// ============================================================================
// Application Snapshot
// ============================================================================

/// Full state of all domain collections at one instant.
///
/// Domain records are opaque JSON objects: pricing, inventory and register
/// logic live outside the sync engine. Every field has a default and is
/// always serialized, so a remote document or backup never carries an
/// absent collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSnapshot {
    #[serde(default, deserialize_with = "null_as_default")]
    pub products: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sales: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub customers: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub suppliers: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub coupons: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub combos: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub cash_registers: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub returns: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub stock_transfers: Vec<Value>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub settings: Map<String, Value>,

    /// Bolivar per dollar rate used by the price layer
    #[serde(default = "default_exchange_rate", deserialize_with = "exchange_rate_or_default")]
    pub exchange_rate: f64,

    /// When the rate was last refreshed (ISO string or epoch millis)
    #[serde(default)]
    pub exchange_rate_last_update: Option<Value>,

    /// Next sale number to assign
    #[serde(default = "default_sale_counter", deserialize_with = "sale_counter_or_default")]
    pub sale_counter: i64,

    #[serde(default, deserialize_with = "null_as_default")]
    pub favorite_products: Vec<Value>,
}

impl Default for ApplicationSnapshot {
    fn default() -> Self {
        Self {
            products: Vec::new(),
            sales: Vec::new(),
            customers: Vec::new(),
            suppliers: Vec::new(),
            coupons: Vec::new(),
            combos: Vec::new(),
            cash_registers: Vec::new(),
            returns: Vec::new(),
            stock_transfers: Vec::new(),
            settings: Map::new(),
            exchange_rate: default_exchange_rate(),
            exchange_rate_last_update: None,
            sale_counter: default_sale_counter(),
            favorite_products: Vec::new(),
        }
    }
}

impl ApplicationSnapshot {
    /// Total number of records across all collections
    pub fn record_count(&self) -> usize {
        self.products.len()
            + self.sales.len()
            + self.customers.len()
            + self.suppliers.len()
            + self.coupons.len()
            + self.combos.len()
            + self.cash_registers.len()
            + self.returns.len()
            + self.stock_transfers.len()
    }
}

fn default_exchange_rate() -> f64 {
    36.5
}

fn default_sale_counter() -> i64 {
    1
}

/// Treat an explicit `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn exchange_rate_or_default<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or_else(default_exchange_rate))
}

fn sale_counter_or_default<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<i64>::deserialize(deserializer)?.unwrap_or_else(default_sale_counter))
}

// ============================================================================
// Remote Document
// ============================================================================

/// Cloud representation: one document per document key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDocument {
    #[serde(flatten)]
    pub snapshot: ApplicationSnapshot,

    /// Server-observed time of the write
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,

    /// Device that performed the write
    #[serde(default)]
    pub device_id: Option<String>,
}

impl RemoteDocument {
    /// Split off the transport metadata.
    pub fn into_change(self) -> RemoteChange {
        RemoteChange {
            snapshot: self.snapshot,
            last_sync: self.last_sync,
            device_id: self.device_id,
        }
    }
}

/// A remote change as handed to listeners: a clean snapshot with the
/// stripped metadata alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub snapshot: ApplicationSnapshot,
    pub last_sync: Option<DateTime<Utc>>,
    pub device_id: Option<String>,
}

// ============================================================================
// Sync Metadata
// ============================================================================

/// Status surface polled by the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub last_sync: Option<DateTime<Utc>>,
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_error: Option<String>,
}

impl Default for SyncMetadata {
    fn default() -> Self {
        Self {
            last_sync: None,
            is_online: true,
            is_syncing: false,
            last_error: None,
        }
    }
}

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Unconfigured,
    Configured,
}

// ============================================================================
// Device Identity
// ============================================================================

/// Stable identifier of this installation, `device-<millis>-<random>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Generate a fresh identity. Callers persist it; see `Database::device_identity`.
    pub fn generate() -> Self {
        let random = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("device-{}-{}", Utc::now().timestamp_millis(), &random[..9]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for DeviceIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Sync Configuration
// ============================================================================

pub const DEFAULT_BASE_URL: &str = "https://firestore.googleapis.com/v1";
pub const DEFAULT_COLLECTION: &str = "bodeguitas";

/// Cloud credentials and engine tuning.
///
/// Persisted as JSON in the settings table. Only `access_key` and
/// `project_id` are required; without them sync is disabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,

    /// Shared document key; several devices with the same user id converge
    /// on one document. Defaults to the device id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_push_interval_secs")]
    pub push_interval_secs: u64,
    #[serde(default = "default_reconnect_debounce_ms")]
    pub reconnect_debounce_ms: u64,
    /// Quiet period after a local edit before it is pushed
    #[serde(default = "default_change_debounce_ms")]
    pub change_debounce_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_listen_interval_secs")]
    pub listen_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            project_id: String::new(),
            auth_domain: None,
            storage_bucket: None,
            sender_id: None,
            app_id: None,
            user_id: None,
            collection: default_collection(),
            base_url: default_base_url(),
            push_interval_secs: default_push_interval_secs(),
            reconnect_debounce_ms: default_reconnect_debounce_ms(),
            change_debounce_ms: default_change_debounce_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            listen_interval_secs: default_listen_interval_secs(),
        }
    }
}

fn default_collection() -> String {
    DEFAULT_COLLECTION.to_string()
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_push_interval_secs() -> u64 {
    5 * 60
}

fn default_reconnect_debounce_ms() -> u64 {
    1000
}

fn default_change_debounce_ms() -> u64 {
    2000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_listen_interval_secs() -> u64 {
    5
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl SyncConfig {
    pub fn new(access_key: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    /// Check required credentials and tuning bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.access_key.trim().is_empty() {
            return Err(ConfigError::Missing("accessKey"));
        }
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::Missing("projectId"));
        }
        if self.push_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "pushIntervalSecs",
                reason: "must be at least 1 second".to_string(),
            });
        }
        if self.listen_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "listenIntervalSecs",
                reason: "must be at least 1 second".to_string(),
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "requestTimeoutSecs",
                reason: "must be at least 1 second".to_string(),
            });
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.validate().is_ok()
    }

    /// Overlay `BODEGA_SYNC_*` environment variables (after `dotenvy` has
    /// loaded any `.env` file).
    pub fn apply_env(mut self) -> Self {
        let var = |name: &str| {
            std::env::var(format!("BODEGA_SYNC_{}", name))
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = var("ACCESS_KEY") {
            self.access_key = v;
        }
        if let Some(v) = var("PROJECT_ID") {
            self.project_id = v;
        }
        if let Some(v) = var("USER_ID") {
            self.user_id = Some(v);
        }
        if let Some(v) = var("COLLECTION") {
            self.collection = v;
        }
        if let Some(v) = var("BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = var("PUSH_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.push_interval_secs = v;
        }
        if let Some(v) = var("CHANGE_DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
            self.change_debounce_ms = v;
        }
        self
    }

    pub fn auth_domain(&self) -> String {
        self.auth_domain
            .clone()
            .unwrap_or_else(|| format!("{}.firebaseapp.com", self.project_id))
    }

    pub fn storage_bucket(&self) -> String {
        self.storage_bucket
            .clone()
            .unwrap_or_else(|| format!("{}.appspot.com", self.project_id))
    }

    /// Remote document key for this device
    pub fn document_id(&self, device: &DeviceIdentity) -> String {
        self.user_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| device.as_str().to_string())
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.push_interval_secs)
    }

    pub fn reconnect_debounce(&self) -> Duration {
        Duration::from_millis(self.reconnect_debounce_ms)
    }

    pub fn change_debounce(&self) -> Duration {
        Duration::from_millis(self.change_debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn listen_interval(&self) -> Duration {
        Duration::from_secs(self.listen_interval_secs)
    }
}

// ============================================================================
// Tests
// ============================================================================
