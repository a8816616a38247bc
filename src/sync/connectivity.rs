//! Connectivity Monitor
//!
//! Tracks online/offline state from whatever signal the platform provides
//! and broadcasts transitions. Without any signal the monitor stays
//! optimistically online.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Online/offline transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

/// Active reachability check
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

pub struct ConnectivityMonitor {
    online: AtomicBool,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    /// Monitor with no platform signal yet: assumed online
    pub fn new() -> Self {
        Self::with_state(true)
    }

    pub fn with_state(online: bool) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            online: AtomicBool::new(online),
            events,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Record a platform signal. Emits an event only on a transition;
    /// returns whether the state changed.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return false;
        }

        let event = if online {
            log::info!("Network: ONLINE");
            ConnectivityEvent::Online
        } else {
            log::warn!("Network: OFFLINE");
            ConnectivityEvent::Offline
        };

        // No receivers is fine
        let _ = self.events.send(event);
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    /// Periodically probe reachability and feed the result back in
    pub fn spawn_probe(
        self: &Arc<Self>,
        probe: Arc<dyn ConnectivityProbe>,
        every: Duration,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let reachable = probe.probe().await;
                log::debug!("Connectivity probe: reachable={}", reachable);
                monitor.set_online(reachable);
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_defaults_to_online() {
        assert!(ConnectivityMonitor::new().is_online());
        assert!(!ConnectivityMonitor::with_state(false).is_online());
    }

    #[tokio::test]
    async fn test_emits_only_on_transition() {
        let monitor = ConnectivityMonitor::new();
        let mut events = monitor.subscribe();

        assert!(!monitor.set_online(true));
        assert!(monitor.set_online(false));
        assert!(!monitor.set_online(false));
        assert!(monitor.set_online(true));

        assert_eq!(events.recv().await.unwrap(), ConnectivityEvent::Offline);
        assert_eq!(events.recv().await.unwrap(), ConnectivityEvent::Online);
        assert!(events.try_recv().is_err());
    }

    struct FlakyProbe {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConnectivityProbe for FlakyProbe {
        async fn probe(&self) -> bool {
            // unreachable on the first call only
            self.calls.fetch_add(1, Ordering::SeqCst) > 0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_drives_state() {
        let monitor = Arc::new(ConnectivityMonitor::new());
        let mut events = monitor.subscribe();
        let probe = Arc::new(FlakyProbe { calls: AtomicUsize::new(0) });

        let handle = monitor.spawn_probe(probe.clone(), Duration::from_secs(10));

        assert_eq!(events.recv().await.unwrap(), ConnectivityEvent::Offline);
        assert_eq!(events.recv().await.unwrap(), ConnectivityEvent::Online);
        assert!(monitor.is_online());
        assert!(probe.calls.load(Ordering::SeqCst) >= 2);

        handle.abort();
    }
}
