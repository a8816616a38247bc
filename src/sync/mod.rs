//! Sync Module - Cloud Synchronization of the Local Store
//!
//! Keeps every device's application state converged on one cloud document:
//! - Periodic, reconnect-triggered, edit-triggered and manual pushes of the
//!   full snapshot
//! - Polling change listener for writes from other devices
//! - Last-write-wins reconciliation on the server commit timestamp
//!
//! Architecture:
//! - Local-first: the app works offline, sync is best effort
//! - Single-flight: one push at a time, concurrent requests are dropped
//! - Whole-snapshot: remote state replaces local state, no field merging

pub mod api;
pub mod connectivity;
pub mod listener;
pub mod manager;
pub mod models;
pub mod reconcile;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use models::{
    ApplicationSnapshot, RemoteDocument, RemoteChange,
    SyncMetadata, SyncState, SyncConfig, ConfigError,
    DeviceIdentity,
};

pub use api::{DocumentStore, FirestoreClient, StoredDocument, SyncApiError};
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, ConnectivityProbe};
pub use listener::{ChangeListener, Subscription};
pub use manager::{SyncManager, SyncManagerError};
pub use reconcile::reconcile;
pub use scheduler::{PushOutcome, SkipReason, SchedulerConfig, SchedulerError, SyncScheduler};
pub use store::{CloudStore, FetchedDocument, SyncError};
