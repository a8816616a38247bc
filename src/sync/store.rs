//! Cloud Store Adapter
//!
//! Persists and fetches the remote document for this device. Owns the
//! transport client explicitly (no global handle) and converts every
//! failure into a logged `false`/`None` at the public boundary. Calls are
//! bounded by the configured request timeout.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::api::{DocumentStore, FirestoreClient, SyncApiError};
use super::connectivity::ConnectivityProbe;
use super::models::{ApplicationSnapshot, DeviceIdentity, RemoteDocument, SyncConfig};

/// Errors from a single cloud round trip
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Sync is not configured")]
    NotConfigured,

    #[error(transparent)]
    Transport(#[from] SyncApiError),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),
}

impl SyncError {
    /// True when no server answered. An HTTP error status (rejected
    /// credentials, rate limiting, server faults) still proves the network
    /// path works.
    pub fn is_unreachable(&self) -> bool {
        match self {
            SyncError::NotConfigured | SyncError::Timeout(_) => true,
            SyncError::Transport(SyncApiError::Request(e)) => e.is_connect() || e.is_timeout() || e.is_request(),
            SyncError::Transport(SyncApiError::InvalidUrl(_)) => true,
            SyncError::Transport(_) | SyncError::InvalidDocument(_) => false,
        }
    }
}

/// A fetched remote document with the server revision it was read at
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub revision: Option<String>,
    pub document: RemoteDocument,
}

/// Adapter between the engine and the remote document store
pub struct CloudStore {
    backend: Option<Arc<dyn DocumentStore>>,
    device: DeviceIdentity,
    document_id: String,
    timeout: Duration,
}

impl CloudStore {
    /// Build the adapter from configuration. Missing credentials yield an
    /// unconfigured adapter; this is reported, not fatal.
    pub fn from_config(config: &SyncConfig, device: DeviceIdentity) -> Self {
        if let Err(e) = config.validate() {
            log::warn!("Cloud sync disabled: {}", e);
            return Self::unconfigured(device);
        }

        match FirestoreClient::new(config) {
            Ok(client) => Self::with_backend(
                Arc::new(client),
                device.clone(),
                config.document_id(&device),
                config.request_timeout(),
            ),
            Err(e) => {
                log::error!("Failed to create cloud client: {}", e);
                Self::unconfigured(device)
            }
        }
    }

    /// Adapter with no backend; every operation is a no-op
    pub fn unconfigured(device: DeviceIdentity) -> Self {
        let document_id = device.as_str().to_string();
        Self {
            backend: None,
            device,
            document_id,
            timeout: Duration::from_secs(30),
        }
    }

    /// Adapter over an explicit backend (fakes in tests, custom transports)
    pub fn with_backend(
        backend: Arc<dyn DocumentStore>,
        device: DeviceIdentity,
        document_id: String,
        timeout: Duration,
    ) -> Self {
        Self {
            backend: Some(backend),
            device,
            document_id,
            timeout,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.backend.is_some()
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    fn backend(&self) -> Result<&Arc<dyn DocumentStore>, SyncError> {
        self.backend.as_ref().ok_or(SyncError::NotConfigured)
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, SyncError>
    where
        F: std::future::Future<Output = Result<T, SyncApiError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(SyncError::Timeout(self.timeout)),
        }
    }

    /// Upsert the remote document; returns the server-stamped `lastSync`
    pub async fn try_save(&self, snapshot: &ApplicationSnapshot) -> Result<DateTime<Utc>, SyncError> {
        let backend = self.backend()?;

        let mut fields = match serde_json::to_value(snapshot) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(SyncError::InvalidDocument("snapshot is not an object".to_string())),
            Err(e) => return Err(SyncError::InvalidDocument(e.to_string())),
        };
        fields.insert("deviceId".to_string(), Value::String(self.device.to_string()));

        let saved_at = self.bounded(backend.put_document(&self.document_id, fields)).await?;
        log::info!(
            "Saved snapshot to cloud document {} ({} records, lastSync {})",
            self.document_id,
            snapshot.record_count(),
            saved_at.to_rfc3339()
        );
        Ok(saved_at)
    }

    /// Upsert the remote document; failures are logged and reported as `false`
    pub async fn save(&self, snapshot: &ApplicationSnapshot) -> bool {
        if !self.is_configured() {
            return false;
        }
        match self.try_save(snapshot).await {
            Ok(_) => true,
            Err(e) => {
                log::error!("Failed to save to cloud: {}", e);
                false
            }
        }
    }

    /// Fetch the remote document with its server revision
    pub async fn fetch(&self) -> Result<Option<FetchedDocument>, SyncError> {
        let backend = self.backend()?;

        let stored = match self.bounded(backend.get_document(&self.document_id)).await? {
            Some(stored) => stored,
            None => return Ok(None),
        };

        let document: RemoteDocument = serde_json::from_value(Value::Object(stored.fields))
            .map_err(|e| SyncError::InvalidDocument(e.to_string()))?;

        Ok(Some(FetchedDocument {
            revision: stored.update_time,
            document,
        }))
    }

    /// Fetch the remote document including its transport metadata
    pub async fn load_document(&self) -> Result<Option<RemoteDocument>, SyncError> {
        Ok(self.fetch().await?.map(|fetched| fetched.document))
    }

    /// Fetch the remote snapshot with transport metadata stripped.
    /// `None` when absent, unconfigured, or on any failure (logged).
    pub async fn load(&self) -> Option<ApplicationSnapshot> {
        if !self.is_configured() {
            return None;
        }
        match self.load_document().await {
            Ok(Some(document)) => Some(document.snapshot),
            Ok(None) => {
                log::info!("No cloud document {} yet", self.document_id);
                None
            }
            Err(e) => {
                log::error!("Failed to load from cloud: {}", e);
                None
            }
        }
    }

    /// Whether the store answers a read. Errors returned by the server
    /// count as reachable; only connect failures and timeouts do not.
    pub async fn check_connection(&self) -> bool {
        let backend = match self.backend() {
            Ok(backend) => backend,
            Err(_) => return false,
        };
        match self.bounded(backend.get_document(&self.document_id)).await {
            Ok(_) => true,
            Err(e) if e.is_unreachable() => {
                log::debug!("Cloud store unreachable: {}", e);
                false
            }
            Err(e) => {
                log::warn!("Cloud store reachable but rejected the request: {}", e);
                true
            }
        }
    }
}

#[async_trait]
impl ConnectivityProbe for CloudStore {
    async fn probe(&self) -> bool {
        self.check_connection().await
    }
}
