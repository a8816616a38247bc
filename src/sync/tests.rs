//! Integration Tests for Sync Module
//!
//! End-to-end flows over an in-process document store:
//! - Single-flight and offline behaviour of the scheduler
//! - Reconnect, local change and periodic triggers (paused clock)
//! - Two devices converging on one document
//! - Configure state machine, including writes whose ack never arrived

#[cfg(test)]
mod integration_tests {
    use super::super::*;
    use crate::db::Database;
    use crate::state::{MemoryState, SnapshotStore};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::{json, Map, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Notify;

    // ========================================================================
    // Fake cloud
    // ========================================================================

    /// Document store with a monotonic server clock
    #[derive(Default)]
    struct FakeCloud {
        documents: Mutex<HashMap<String, (Map<String, Value>, i64)>>,
        clock: AtomicI64,
        started: AtomicUsize,
        completed: AtomicUsize,
        fail: AtomicBool,
        gated: AtomicBool,
        /// Commit the write, then hold the response until released
        stall_ack: AtomicBool,
        release: Notify,
    }

    impl FakeCloud {
        fn gated() -> Self {
            let cloud = Self::default();
            cloud.gated.store(true, Ordering::SeqCst);
            cloud
        }

        fn started(&self) -> usize {
            self.started.load(Ordering::SeqCst)
        }

        fn completed(&self) -> usize {
            self.completed.load(Ordering::SeqCst)
        }

        fn document(&self, id: &str) -> Option<Map<String, Value>> {
            self.documents.lock().unwrap().get(id).map(|(fields, _)| fields.clone())
        }
    }

    fn server_time(tick: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_735_689_600 + tick, 0).unwrap()
    }

    #[async_trait]
    impl DocumentStore for FakeCloud {
        async fn put_document(
            &self,
            document_id: &str,
            mut fields: Map<String, Value>,
        ) -> Result<DateTime<Utc>, SyncApiError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if self.gated.load(Ordering::SeqCst) {
                self.release.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(SyncApiError::NetworkError("connection reset".to_string()));
            }

            let tick = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
            let now = server_time(tick);
            fields.insert("lastSync".to_string(), json!(now.to_rfc3339()));
            self.documents
                .lock()
                .unwrap()
                .insert(document_id.to_string(), (fields, tick));

            self.completed.fetch_add(1, Ordering::SeqCst);
            if self.stall_ack.load(Ordering::SeqCst) {
                self.release.notified().await;
            }
            Ok(now)
        }

        async fn get_document(&self, document_id: &str) -> Result<Option<StoredDocument>, SyncApiError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SyncApiError::NetworkError("connection reset".to_string()));
            }
            Ok(self
                .documents
                .lock()
                .unwrap()
                .get(document_id)
                .map(|(fields, revision)| StoredDocument {
                    fields: fields.clone(),
                    update_time: Some(format!("rev-{}", revision)),
                }))
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    const SHOP: &str = "shop-1";

    fn device(name: &str) -> DeviceIdentity {
        DeviceIdentity::from(format!("device-1735689600000-{}", name))
    }

    fn shop_config() -> SyncConfig {
        let mut config = SyncConfig::new("test-key", "bodeguita-test");
        config.user_id = Some(SHOP.to_string());
        config.push_interval_secs = 300;
        config.reconnect_debounce_ms = 1000;
        config.listen_interval_secs = 5;
        config
    }

    fn cloud_for(backend: &Arc<FakeCloud>, device: &DeviceIdentity) -> CloudStore {
        CloudStore::with_backend(backend.clone(), device.clone(), SHOP.to_string(), Duration::from_secs(30))
    }

    fn scheduler_over(
        backend: &Arc<FakeCloud>,
        state: Arc<MemoryState>,
        monitor: Arc<ConnectivityMonitor>,
        config: SchedulerConfig,
    ) -> SyncScheduler {
        let cloud = Arc::new(cloud_for(backend, &device("solo")));
        SyncScheduler::new(cloud, state, monitor, config)
    }

    fn with_product(id: &str) -> ApplicationSnapshot {
        let mut snapshot = ApplicationSnapshot::default();
        snapshot.products.push(json!({"id": id, "name": "Café", "price": 3.5, "stock": 10}));
        snapshot
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    // ========================================================================
    // Scheduler
    // ========================================================================

    #[tokio::test]
    async fn test_push_while_syncing_is_dropped() {
        let backend = Arc::new(FakeCloud::gated());
        let scheduler = scheduler_over(
            &backend,
            Arc::new(MemoryState::new(with_product("p1"))),
            Arc::new(ConnectivityMonitor::new()),
            SchedulerConfig::default(),
        );

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.push().await })
        };
        while backend.started() == 0 {
            tokio::task::yield_now().await;
        }

        let during = scheduler.status();
        assert!(during.is_syncing);

        assert_eq!(scheduler.push().await, PushOutcome::Skipped(SkipReason::InFlight));
        assert_eq!(scheduler.status(), during, "dropped push must not touch metadata");
        assert_eq!(backend.started(), 1, "dropped push must not reach the store");

        backend.release.notify_one();
        let outcome = first.await.unwrap();
        assert_eq!(outcome, PushOutcome::Synced(server_time(1)));

        let after = scheduler.status();
        assert!(!after.is_syncing);
        assert_eq!(after.last_sync, Some(server_time(1)));
        assert!(after.last_error.is_none());
    }

    #[tokio::test]
    async fn test_push_while_offline_records_error() {
        let backend = Arc::new(FakeCloud::default());
        let scheduler = scheduler_over(
            &backend,
            Arc::new(MemoryState::default()),
            Arc::new(ConnectivityMonitor::with_state(false)),
            SchedulerConfig::default(),
        );

        assert_eq!(scheduler.push().await, PushOutcome::Skipped(SkipReason::Offline));

        let status = scheduler.status();
        assert_eq!(status.last_error.as_deref(), Some(scheduler::OFFLINE_ERROR));
        assert!(!status.is_online);
        assert!(!status.is_syncing);
        assert_eq!(backend.started(), 0);
    }

    #[tokio::test]
    async fn test_failed_push_records_reason() {
        let backend = Arc::new(FakeCloud::default());
        backend.fail.store(true, Ordering::SeqCst);
        let scheduler = scheduler_over(
            &backend,
            Arc::new(MemoryState::default()),
            Arc::new(ConnectivityMonitor::new()),
            SchedulerConfig::default(),
        );

        let outcome = scheduler.push().await;
        assert!(matches!(outcome, PushOutcome::Failed(ref reason) if reason.contains("connection reset")));

        let status = scheduler.status();
        assert!(!status.is_syncing);
        assert!(status.last_sync.is_none());
        assert!(status.last_error.unwrap().contains("connection reset"));

        backend.fail.store(false, Ordering::SeqCst);
        assert!(matches!(scheduler.push().await, PushOutcome::Synced(_)));
        assert!(scheduler.status().last_error.is_none());
    }

    #[tokio::test]
    async fn test_aborted_push_clears_syncing() {
        let backend = Arc::new(FakeCloud::gated());
        let scheduler = scheduler_over(
            &backend,
            Arc::new(MemoryState::default()),
            Arc::new(ConnectivityMonitor::new()),
            SchedulerConfig::default(),
        );

        let task = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.push().await })
        };
        while backend.started() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(scheduler.status().is_syncing);

        task.abort();
        let _ = task.await;
        assert!(!scheduler.status().is_syncing);

        // The guard is released too, so the next push goes through
        backend.gated.store(false, Ordering::SeqCst);
        assert!(matches!(scheduler.push().await, PushOutcome::Synced(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_pushes_once_after_debounce() {
        let backend = Arc::new(FakeCloud::default());
        let monitor = Arc::new(ConnectivityMonitor::with_state(false));
        let scheduler = scheduler_over(
            &backend,
            Arc::new(MemoryState::new(with_product("p1"))),
            monitor.clone(),
            SchedulerConfig {
                push_interval: Duration::from_secs(3600),
                ..SchedulerConfig::default()
            },
        );

        scheduler.start().unwrap();
        settle().await;
        assert_eq!(backend.started(), 0, "initial tick while offline must not push");

        assert!(monitor.set_online(true));
        assert_eq!(backend.started(), 0, "no push inside set_online");
        settle().await;
        assert_eq!(backend.started(), 0, "no push before the debounce elapses");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(backend.started(), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(backend.completed(), 1, "exactly one push between 1s and 2s");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.completed(), 1);

        scheduler.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_flapping_collapses() {
        let backend = Arc::new(FakeCloud::default());
        let monitor = Arc::new(ConnectivityMonitor::with_state(false));
        let scheduler = scheduler_over(
            &backend,
            Arc::new(MemoryState::default()),
            monitor.clone(),
            SchedulerConfig {
                push_interval: Duration::from_secs(3600),
                ..SchedulerConfig::default()
            },
        );
        scheduler.start().unwrap();
        settle().await;

        monitor.set_online(true);
        settle().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        monitor.set_online(false);
        settle().await;
        monitor.set_online(true);
        settle().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        monitor.set_online(true);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.completed(), 1);

        scheduler.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_push() {
        let backend = Arc::new(FakeCloud::default());
        let scheduler = scheduler_over(
            &backend,
            Arc::new(MemoryState::default()),
            Arc::new(ConnectivityMonitor::new()),
            SchedulerConfig {
                push_interval: Duration::from_secs(60),
                ..SchedulerConfig::default()
            },
        );

        scheduler.start().unwrap();
        settle().await;
        assert_eq!(backend.completed(), 1, "periodic trigger fires immediately");

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(backend.completed(), 2);

        scheduler.stop().unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(backend.completed(), 2, "no pushes after stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_changes_collapse_into_one_push() {
        let backend = Arc::new(FakeCloud::default());
        let state = Arc::new(MemoryState::default());
        let scheduler = scheduler_over(
            &backend,
            state.clone(),
            Arc::new(ConnectivityMonitor::new()),
            SchedulerConfig {
                push_interval: Duration::from_secs(3600),
                ..SchedulerConfig::default()
            },
        );
        state.set_change_hook(scheduler.change_hook());

        scheduler.start().unwrap();
        settle().await;
        assert_eq!(backend.completed(), 1, "initial periodic push");

        for counter in 2..=4 {
            state.update(|s| s.sale_counter = counter);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(backend.completed(), 1, "no push while edits keep arriving");

        tokio::time::sleep(Duration::from_millis(600)).await;
        settle().await;
        assert_eq!(backend.completed(), 2, "one push once edits pause");
        assert_eq!(backend.document(SHOP).unwrap()["saleCounter"], json!(4));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.completed(), 2);

        scheduler.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_change_push() {
        let backend = Arc::new(FakeCloud::default());
        let scheduler = scheduler_over(
            &backend,
            Arc::new(MemoryState::default()),
            Arc::new(ConnectivityMonitor::new()),
            SchedulerConfig {
                push_interval: Duration::from_secs(3600),
                ..SchedulerConfig::default()
            },
        );
        scheduler.start().unwrap();
        settle().await;
        assert_eq!(backend.completed(), 1);

        scheduler.notify_local_change();
        settle().await;
        scheduler.stop().unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.completed(), 1);
    }

    // ========================================================================
    // Reconciliation across devices
    // ========================================================================

    fn manager_on(backend: &Arc<FakeCloud>, name: &str, state: Arc<MemoryState>) -> (SyncManager, CloudStore) {
        let device = device(name);
        let cloud = cloud_for(backend, &device);
        let manager = SyncManager::new(state, device, Arc::new(ConnectivityMonitor::new()));
        (manager, cloud)
    }

    #[tokio::test]
    async fn test_device_with_older_sync_adopts_remote() {
        let backend = Arc::new(FakeCloud::default());

        let state_a = Arc::new(MemoryState::new(with_product("from-a")));
        let (device_a, cloud_a) = manager_on(&backend, "aaaaaaaaa", state_a.clone());
        device_a.configure_with(shop_config(), cloud_a).await.unwrap();
        let pushed_at = match device_a.push_now().await {
            PushOutcome::Synced(at) => at,
            other => panic!("unexpected outcome: {:?}", other),
        };

        let mut stale = with_product("from-b");
        stale.sale_counter = 99;
        let state_b = Arc::new(MemoryState::new(stale));
        let (device_b, cloud_b) = manager_on(&backend, "bbbbbbbbb", state_b.clone());
        device_b.configure_with(shop_config(), cloud_b).await.unwrap();
        device_b.scheduler().set_last_sync(Some(pushed_at - chrono::Duration::minutes(10)));

        assert!(device_b.pull(false).await.unwrap());
        assert_eq!(state_b.current(), state_a.current(), "remote replaces local wholesale");
        assert_eq!(device_b.status().last_sync, Some(pushed_at));

        // Same document again is now an equal timestamp
        assert!(!device_b.pull(false).await.unwrap());
    }

    #[tokio::test]
    async fn test_echo_is_ignored() {
        let backend = Arc::new(FakeCloud::default());
        let state = Arc::new(MemoryState::new(with_product("mine")));
        let (manager, cloud) = manager_on(&backend, "ccccccccc", state.clone());
        manager.configure_with(shop_config(), cloud).await.unwrap();

        let pushed_at = match manager.push_now().await {
            PushOutcome::Synced(at) => at,
            other => panic!("unexpected outcome: {:?}", other),
        };

        // Local edit after the push, then our own write comes back
        state.update(|s| s.sale_counter = 7);
        let echo = RemoteChange {
            snapshot: with_product("mine"),
            last_sync: Some(pushed_at),
            device_id: Some(manager.device().to_string()),
        };

        assert!(!manager.apply(echo).unwrap());
        assert_eq!(state.current().sale_counter, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_devices_converge_through_listener() {
        let backend = Arc::new(FakeCloud::default());

        let state_a = Arc::new(MemoryState::new(with_product("p1")));
        let (device_a, cloud_a) = manager_on(&backend, "aaaaaaaaa", state_a.clone());
        device_a.start().await.unwrap();
        device_a.configure_with(shop_config(), cloud_a).await.unwrap();
        settle().await;
        assert_eq!(backend.completed(), 1);

        // B starts with nothing and catches up before its first push
        let state_b = Arc::new(MemoryState::default());
        let (device_b, cloud_b) = manager_on(&backend, "bbbbbbbbb", state_b.clone());
        device_b.start().await.unwrap();
        device_b.configure_with(shop_config(), cloud_b).await.unwrap();
        while backend.completed() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(state_b.current(), with_product("p1"));

        // A records a sale; B sees it on its next poll
        state_a.update(|s| {
            s.sales.push(json!({"id": "s1", "total": 7.0}));
            s.sale_counter = 2;
        });
        assert!(matches!(device_a.push_now().await, PushOutcome::Synced(_)));

        // The edit also schedules a debounced push; wait past it and one poll
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(state_b.current(), state_a.current());
        assert_eq!(device_b.status().last_sync, device_a.status().last_sync);

        let document = backend.document(SHOP).unwrap();
        assert_eq!(document["deviceId"], json!(device_a.device().to_string()));

        device_a.shutdown().await;
        device_b.shutdown().await;
    }

    // ========================================================================
    // Configure state machine
    // ========================================================================

    #[tokio::test]
    async fn test_configure_state_machine() {
        let backend = Arc::new(FakeCloud::default());
        let state = Arc::new(MemoryState::new(with_product("p1")));
        let (manager, cloud) = manager_on(&backend, "ddddddddd", state);

        assert_eq!(manager.sync_state().await, SyncState::Unconfigured);
        assert_eq!(manager.push_now().await, PushOutcome::Skipped(SkipReason::NotConfigured));
        assert!(matches!(manager.pull(false).await, Err(SyncManagerError::NotConfigured)));

        let incomplete = SyncConfig::new("", "bodeguita-test");
        assert!(matches!(
            manager.configure(incomplete).await,
            Err(SyncManagerError::Config(ConfigError::Missing("accessKey")))
        ));
        assert_eq!(manager.sync_state().await, SyncState::Unconfigured);

        assert_eq!(manager.configure_with(shop_config(), cloud).await.unwrap(), SyncState::Configured);
        assert!(matches!(manager.push_now().await, PushOutcome::Synced(_)));
        assert_eq!(backend.completed(), 1);

        assert_eq!(manager.unconfigure().await.unwrap(), SyncState::Unconfigured);
        let status = manager.status();
        assert_eq!(status.last_error.as_deref(), Some(scheduler::NOT_CONFIGURED_ERROR));
        assert!(!status.is_syncing);
        assert!(status.last_sync.is_some(), "last sync survives unconfigure");
        assert_eq!(manager.push_now().await, PushOutcome::Skipped(SkipReason::NotConfigured));
        assert_eq!(backend.completed(), 1);

        let cloud = cloud_for(&backend, manager.device());
        assert_eq!(manager.configure_with(shop_config(), cloud).await.unwrap(), SyncState::Configured);
        assert!(manager.status().last_error.is_none());
        assert!(matches!(manager.push_now().await, PushOutcome::Synced(_)));
        assert_eq!(backend.completed(), 2);
    }

    #[tokio::test]
    async fn test_unconfigure_drains_in_flight_push() {
        let backend = Arc::new(FakeCloud::gated());
        let (manager, cloud) = manager_on(&backend, "eeeeeeeee", Arc::new(MemoryState::default()));
        manager.configure_with(shop_config(), cloud).await.unwrap();

        let push = manager.trigger_now();
        while backend.started() == 0 {
            tokio::task::yield_now().await;
        }

        let unconfigure = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.unconfigure().await })
        };
        settle().await;
        assert!(!unconfigure.is_finished(), "rebind waits for the in-flight push");

        backend.release.notify_one();
        assert!(matches!(push.await.unwrap(), PushOutcome::Synced(_)));
        assert_eq!(unconfigure.await.unwrap().unwrap(), SyncState::Unconfigured);
        assert!(!manager.status().is_syncing);
    }

    #[tokio::test]
    async fn test_reconfigure_during_periodic_push_keeps_local_edits() {
        let backend = Arc::new(FakeCloud::default());
        backend.stall_ack.store(true, Ordering::SeqCst);
        let state = Arc::new(MemoryState::new(with_product("p1")));
        let (manager, cloud) = manager_on(&backend, "fffffffff", state.clone());

        manager.start().await.unwrap();
        manager.configure_with(shop_config(), cloud).await.unwrap();
        while backend.completed() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(manager.status().is_syncing, "periodic push waits for its ack");

        // Edit made after the in-flight snapshot was captured
        state.update(|s| s.sale_counter = 42);

        let reconfigure = {
            let manager = manager.clone();
            let cloud = cloud_for(&backend, manager.device());
            tokio::spawn(async move { manager.configure_with(shop_config(), cloud).await })
        };
        settle().await;
        assert!(!reconfigure.is_finished(), "rebind waits for the periodic push");

        backend.stall_ack.store(false, Ordering::SeqCst);
        backend.release.notify_one();
        assert_eq!(reconfigure.await.unwrap().unwrap(), SyncState::Configured);

        // Catch-up saw our own earlier write and left the edit alone
        assert_eq!(state.current().sale_counter, 42);
        assert!(manager.status().last_sync >= Some(server_time(1)));

        while backend.completed() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(backend.document(SHOP).unwrap()["saleCounter"], json!(42));

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_write_after_timed_out_save_is_not_adopted() {
        let backend = Arc::new(FakeCloud::default());
        backend.stall_ack.store(true, Ordering::SeqCst);
        let state = Arc::new(MemoryState::new(with_product("p1")));
        let device = device("ggggggggg");
        let manager = SyncManager::new(state.clone(), device.clone(), Arc::new(ConnectivityMonitor::new()));
        let cloud = CloudStore::with_backend(backend.clone(), device, SHOP.to_string(), Duration::from_secs(1));
        manager.configure_with(shop_config(), cloud).await.unwrap();

        // The server commits but the response never arrives
        let outcome = manager.push_now().await;
        assert!(matches!(outcome, PushOutcome::Failed(ref reason) if reason.contains("timed out")));
        assert_eq!(backend.completed(), 1);
        assert!(manager.status().last_sync.is_none());

        state.update(|s| s.sale_counter = 42);

        assert!(!manager.pull(false).await.unwrap());
        assert_eq!(state.current().sale_counter, 42);
        assert_eq!(manager.status().last_sync, Some(server_time(1)));
    }

    #[tokio::test]
    async fn test_configuration_is_persisted() {
        let db = Arc::new(Database::in_memory().unwrap());
        let manager = SyncManager::open(db.clone(), Arc::new(ConnectivityMonitor::new())).unwrap();
        assert_eq!(manager.sync_state().await, SyncState::Unconfigured);

        let backend = Arc::new(FakeCloud::default());
        let cloud = cloud_for(&backend, manager.device());
        manager.configure_with(shop_config(), cloud).await.unwrap();
        assert_eq!(manager::load_config(&db).unwrap(), Some(shop_config()));

        assert!(matches!(manager.push_now().await, PushOutcome::Synced(_)));
        assert_eq!(db.last_sync().unwrap(), Some(server_time(1)));

        // A reopened manager keeps identity and sync point
        let reopened = SyncManager::open(db.clone(), Arc::new(ConnectivityMonitor::new())).unwrap();
        assert_eq!(reopened.device(), manager.device());
        assert_eq!(reopened.status().last_sync, Some(server_time(1)));

        manager.unconfigure().await.unwrap();
        assert!(manager::load_config(&db).unwrap().is_none());
    }
}
