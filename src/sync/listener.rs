//! Real-time Change Listener
//!
//! Watches the remote document and hands every change to a callback,
//! echoes of this device's own writes included (filtering those is the
//! reconciliation policy's job). The REST transport has no push channel, so
//! changes are detected by polling the document's server revision.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::models::RemoteChange;
use super::store::CloudStore;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Id of the subscription whose callback is running on this task
    static DELIVERING: u64;
}

/// Per-subscription delivery gate
struct Gate {
    id: u64,
    cancelled: AtomicBool,
    // Held for the duration of each callback
    delivering: StdMutex<()>,
}

impl Gate {
    fn deliver<F>(&self, change: RemoteChange, on_change: &F)
    where
        F: Fn(RemoteChange),
    {
        let _held = self.delivering.lock().unwrap_or_else(|e| e.into_inner());
        if self.cancelled.load(Ordering::SeqCst) {
            log::debug!("Subscription {}: discarding change received after cancel", self.id);
            return;
        }
        on_change(change);
    }
}

/// Cancellation handle returned by [`ChangeListener::subscribe`].
///
/// `cancel` is idempotent. Once it returns, no further callback starts, and
/// a callback already running on another task has finished. Dropping the
/// handle cancels the subscription.
pub struct Subscription {
    gate: Option<Arc<Gate>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    /// Subscription that never delivers (sync not configured)
    pub fn inert() -> Self {
        Self {
            gate: None,
            task: StdMutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.gate
            .as_ref()
            .map(|g| !g.cancelled.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn cancel(&self) {
        let gate = match &self.gate {
            Some(gate) => gate,
            None => return,
        };
        if gate.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }

        // Wait out a callback in progress, unless we are inside it
        let reentrant = DELIVERING.try_with(|id| *id == gate.id).unwrap_or(false);
        if !reentrant {
            drop(gate.delivering.lock().unwrap_or_else(|e| e.into_inner()));
        }
        log::info!("Change subscription {} cancelled", gate.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Polls the remote document and reports changes
pub struct ChangeListener {
    store: Arc<CloudStore>,
    poll_interval: Duration,
}

impl ChangeListener {
    pub fn new(store: Arc<CloudStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    /// Start delivering remote changes to `on_change`. The first observed
    /// state of the document is delivered as well.
    pub fn subscribe<F>(&self, on_change: F) -> Subscription
    where
        F: Fn(RemoteChange) + Send + Sync + 'static,
    {
        if !self.store.is_configured() {
            return Subscription::inert();
        }

        let gate = Arc::new(Gate {
            id: NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed),
            cancelled: AtomicBool::new(false),
            delivering: StdMutex::new(()),
        });

        let store = Arc::clone(&self.store);
        let poll_interval = self.poll_interval;
        let task_gate = Arc::clone(&gate);

        let handle = tokio::spawn(DELIVERING.scope(gate.id, async move {
            Self::poll_loop(store, poll_interval, task_gate, on_change).await;
        }));

        log::info!(
            "Change subscription {} started on document {} (every {:?})",
            gate.id,
            self.store.document_id(),
            poll_interval
        );

        Subscription {
            gate: Some(gate),
            task: StdMutex::new(Some(handle)),
        }
    }

    async fn poll_loop<F>(store: Arc<CloudStore>, poll_interval: Duration, gate: Arc<Gate>, on_change: F)
    where
        F: Fn(RemoteChange),
    {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_seen: Option<String> = None;

        loop {
            interval.tick().await;
            if gate.cancelled.load(Ordering::SeqCst) {
                break;
            }

            match store.fetch().await {
                Ok(Some(fetched)) => {
                    let marker = fetched
                        .revision
                        .clone()
                        .or_else(|| fetched.document.last_sync.map(|t| t.to_rfc3339()));

                    if marker.is_some() && marker == last_seen {
                        continue;
                    }
                    last_seen = marker;

                    log::debug!(
                        "Remote change on {} (writer {:?})",
                        store.document_id(),
                        fetched.document.device_id
                    );
                    gate.deliver(fetched.document.into_change(), &on_change);
                }
                Ok(None) => {}
                Err(e) => log::warn!("Change listener poll failed: {}", e),
            }
        }
    }
}
