//! Local application state seam
//!
//! The domain layer owns the live state. The sync engine only needs to
//! capture it read-only for a push and to replace it wholesale when a newer
//! remote snapshot or a restored backup arrives. Local mutations are
//! reported through a change hook so they can be pushed promptly.

use crate::db::DbResult;
use crate::sync::models::ApplicationSnapshot;
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};

/// Called after every local mutation of the application state
pub type ChangeHook = Arc<dyn Fn() + Send + Sync>;

/// Export/import access to the application state
pub trait SnapshotStore: Send + Sync {
    /// Capture the current state
    fn export_snapshot(&self) -> DbResult<ApplicationSnapshot>;

    /// Replace the whole state with `snapshot`
    fn import_snapshot(&self, snapshot: ApplicationSnapshot) -> DbResult<()>;

    /// Sync point the local state corresponds to, if remembered across restarts
    fn last_sync(&self) -> DbResult<Option<DateTime<Utc>>> {
        Ok(None)
    }

    /// Remember the sync point the local state now corresponds to
    fn record_last_sync(&self, _at: Option<DateTime<Utc>>) -> DbResult<()> {
        Ok(())
    }

    /// Register the hook run after local mutations. Imports never run it.
    fn set_change_hook(&self, _hook: ChangeHook) {}
}

/// Process-local state, used by embedders without durable storage and by tests
#[derive(Default)]
pub struct MemoryState {
    inner: RwLock<ApplicationSnapshot>,
    on_change: RwLock<Option<ChangeHook>>,
}

impl MemoryState {
    pub fn new(snapshot: ApplicationSnapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
            on_change: RwLock::new(None),
        }
    }

    /// Apply a local mutation, as the domain layer would
    pub fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut ApplicationSnapshot),
    {
        {
            let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
            mutate(&mut guard);
        }

        let hook = self.on_change.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn current(&self) -> ApplicationSnapshot {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SnapshotStore for MemoryState {
    fn export_snapshot(&self) -> DbResult<ApplicationSnapshot> {
        Ok(self.current())
    }

    fn import_snapshot(&self, snapshot: ApplicationSnapshot) -> DbResult<()> {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
        Ok(())
    }

    fn set_change_hook(&self, hook: ChangeHook) {
        *self.on_change.write().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }
}
