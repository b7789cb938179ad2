//! Drain scenarios for the mutation queue, runner and daemon.
//!
//! Uses mock MutationDispatchers that can be configured to succeed or fail.

#[cfg(test)]
mod drain_tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::Semaphore;

    use crate::api::error::ApiError;
    use crate::api::types::HttpMethod;
    use crate::connectivity::{ConnectivityObserver, ConnectivityState};
    use crate::status::SyncStatus;
    use crate::storage::MemoryStore;
    use crate::sync::{
        trigger_channel, DrainSkip, MutationAction, MutationDispatcher, MutationQueue,
        QueueItem, QueueStatus, SyncDaemon, SyncRunner, SyncSettings,
    };

    // ── Mock Dispatchers ─────────────────────────────────────────────────

    /// Succeeds every call and tracks how many run concurrently.
    struct SuccessDispatcher {
        calls: AtomicU32,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl SuccessDispatcher {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn peak(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }
    }

    impl MutationDispatcher for SuccessDispatcher {
        async fn dispatch(&self, item: &QueueItem) -> Result<Value, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({ "ok": item.endpoint }))
        }
    }

    /// Fails every call with a server error.
    struct FailDispatcher {
        calls: AtomicU32,
        status: u16,
    }

    impl FailDispatcher {
        fn new() -> Self {
            Self::with_status(503)
        }

        fn with_status(status: u16) -> Self {
            Self {
                calls: AtomicU32::new(0),
                status,
            }
        }
    }

    impl MutationDispatcher for FailDispatcher {
        async fn dispatch(&self, _item: &QueueItem) -> Result<Value, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ApiError::from_status(self.status, None))
        }
    }

    /// Fails only the endpoints it was told to fail.
    struct SelectiveDispatcher {
        failing: Vec<String>,
        seen: Mutex<Vec<String>>,
    }

    impl MutationDispatcher for SelectiveDispatcher {
        async fn dispatch(&self, item: &QueueItem) -> Result<Value, ApiError> {
            self.seen.lock().unwrap().push(item.endpoint.clone());
            if self.failing.contains(&item.endpoint) {
                Err(ApiError::Network("connection reset".into()))
            } else {
                Ok(Value::Null)
            }
        }
    }

    /// Blocks every call until the test releases the gate.
    struct GatedDispatcher {
        gate: Semaphore,
        calls: AtomicU32,
    }

    impl MutationDispatcher for GatedDispatcher {
        async fn dispatch(&self, _item: &QueueItem) -> Result<Value, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.map_err(|e| ApiError::Unknown(e.to_string()))?;
            Ok(Value::Null)
        }
    }

    /// Behaves like the API client under force-offline.
    struct OfflineDispatcher;

    impl MutationDispatcher for OfflineDispatcher {
        async fn dispatch(&self, _item: &QueueItem) -> Result<Value, ApiError> {
            Err(ApiError::Offline)
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn fast_settings() -> SyncSettings {
        SyncSettings {
            batch_size: 5,
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            batch_delay: Duration::from_millis(1),
        }
    }

    fn setup<D: MutationDispatcher>(
        online: bool,
        dispatcher: Arc<D>,
    ) -> (
        Arc<ConnectivityObserver>,
        Arc<MutationQueue<MemoryStore>>,
        Arc<SyncRunner<MemoryStore, D>>,
    ) {
        let state = if online {
            ConnectivityState::online("wifi")
        } else {
            ConnectivityState::offline()
        };
        let connectivity = Arc::new(ConnectivityObserver::new(state));
        let queue = Arc::new(MutationQueue::new(
            Arc::new(MemoryStore::new()),
            connectivity.clone(),
        ));
        let runner = Arc::new(SyncRunner::new(
            queue.clone(),
            dispatcher,
            connectivity.clone(),
            fast_settings(),
        ));
        (connectivity, queue, runner)
    }

    async fn enqueue_n(queue: &MutationQueue<MemoryStore>, n: usize) -> Vec<String> {
        let mut ids = Vec::new();
        for i in 0..n {
            let id = queue
                .enqueue(
                    MutationAction::Create,
                    &format!("/api/addresses/{}/", i),
                    HttpMethod::Post,
                    json!({ "index": i }),
                )
                .await
                .unwrap();
            ids.push(id);
        }
        ids
    }

    // ── Tests ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_seven_items_drain_in_two_batches_when_online() {
        let dispatcher = Arc::new(SuccessDispatcher::new());
        let (connectivity, queue, runner) = setup(false, dispatcher.clone());
        enqueue_n(&queue, 7).await;
        assert_eq!(queue.pending_count().await, 7);

        let (trigger, trigger_rx) = trigger_channel();
        queue.set_drain_trigger(trigger);
        let mut daemon = SyncDaemon::new(runner.clone(), connectivity.subscribe(), trigger_rx)
            .with_poll_interval(Duration::from_secs(3600));
        let mut status_rx = daemon.subscribe_status();
        let mut pending_rx = queue.subscribe_pending();
        let _ = pending_rx.borrow_and_update();

        let handle = tokio::spawn(async move { daemon.run().await });

        connectivity.update(ConnectivityState::online("wifi"));

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                pending_rx.changed().await.unwrap();
                if *pending_rx.borrow_and_update() == 0 {
                    break;
                }
            }
        })
        .await
        .expect("pending count never reached 0");

        assert_eq!(dispatcher.calls(), 7);
        assert_eq!(dispatcher.peak(), 5, "a batch never exceeds the batch size");
        assert!(queue.get_all().await.is_empty());

        tokio::time::timeout(Duration::from_secs(5), async {
            while *status_rx.borrow_and_update() != SyncStatus::Synced {
                status_rx.changed().await.unwrap();
            }
        })
        .await
        .expect("status never became Synced");

        handle.abort();
    }

    #[tokio::test]
    async fn test_drain_report_counts_two_batches() {
        let dispatcher = Arc::new(SuccessDispatcher::new());
        let (_connectivity, queue, runner) = setup(true, dispatcher.clone());
        enqueue_n(&queue, 7).await;

        let report = runner.drain().await;
        assert_eq!(report.batches, 2);
        assert_eq!(report.attempted, 7);
        assert_eq!(report.succeeded, 7);
        assert_eq!(report.skipped, None);
        assert!(queue.get_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_failing_every_attempt_stays_failed() {
        let dispatcher = Arc::new(FailDispatcher::new());
        let (_connectivity, queue, runner) = setup(true, dispatcher.clone());
        let id = queue
            .enqueue(
                MutationAction::Update,
                "/api/profile/",
                HttpMethod::Patch,
                json!({ "firstName": "Amina" }),
            )
            .await
            .unwrap();

        let report = runner.drain().await;
        assert_eq!(report.failed, 1);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 3);

        let items = queue.get_all().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, id);
        assert_eq!(items[0].status, QueueStatus::Failed);
        assert_eq!(items[0].retry_count, runner.settings().max_attempts);
        assert!(items[0].last_error.as_deref().unwrap().contains("503"));
        assert_eq!(queue.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_rejected_payload_is_not_retried_within_pass() {
        let dispatcher = Arc::new(FailDispatcher::with_status(400));
        let (_connectivity, queue, runner) = setup(true, dispatcher.clone());
        queue
            .enqueue(
                MutationAction::Create,
                "/api/addresses/",
                HttpMethod::Post,
                json!({ "city": "Lyon" }),
            )
            .await
            .unwrap();

        let report = runner.drain().await;
        assert_eq!(report.failed, 1);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);

        let items = queue.get_all().await;
        assert_eq!(items[0].status, QueueStatus::Failed);
        assert_eq!(items[0].retry_count, 1);
        assert!(items[0].last_error.as_deref().unwrap().contains("400"));
    }

    #[tokio::test]
    async fn test_no_item_lost_or_duplicated() {
        let dispatcher = Arc::new(SelectiveDispatcher {
            failing: vec!["/api/addresses/1/".into(), "/api/addresses/4/".into()],
            seen: Mutex::new(Vec::new()),
        });
        let (_connectivity, queue, runner) = setup(true, dispatcher.clone());
        enqueue_n(&queue, 6).await;
        let before = queue.drainable().await.len();

        let report = runner.drain().await;
        assert_eq!(report.succeeded + report.failed, before);
        assert_eq!(report.succeeded, 4);

        let remaining = queue.get_all().await;
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|i| i.status == QueueStatus::Failed));

        // Failing endpoints were attempted max_attempts times, others once.
        let seen = dispatcher.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 4 + 2 * 3);
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_a_noop() {
        let dispatcher = Arc::new(GatedDispatcher {
            gate: Semaphore::new(0),
            calls: AtomicU32::new(0),
        });
        let (_connectivity, queue, runner) = setup(true, dispatcher.clone());
        enqueue_n(&queue, 1).await;

        let first = runner.drain();
        let second = async {
            tokio::task::yield_now().await;
            assert!(runner.is_draining());
            let report = runner.drain().await;
            dispatcher.gate.add_permits(8);
            report
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(second.skipped, Some(DrainSkip::AlreadyRunning));
        assert_eq!(second.attempted, 0);
        assert_eq!(first.succeeded, 1);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
        assert!(!runner.is_draining());
    }

    #[tokio::test]
    async fn test_force_offline_skips_drain() {
        let dispatcher = Arc::new(SuccessDispatcher::new());
        let (connectivity, queue, runner) = setup(true, dispatcher.clone());
        enqueue_n(&queue, 2).await;

        connectivity.force_offline(true);
        assert!(!connectivity.is_online());
        let report = runner.drain().await;
        assert_eq!(report.skipped, Some(DrainSkip::Offline));
        assert_eq!(dispatcher.calls(), 0);
        assert_eq!(queue.pending_count().await, 2);

        connectivity.force_offline(false);
        let report = runner.drain().await;
        assert_eq!(report.succeeded, 2);
    }

    #[tokio::test]
    async fn test_offline_dispatch_is_deferred_not_failed() {
        let (_connectivity, queue, runner) = setup(true, Arc::new(OfflineDispatcher));
        enqueue_n(&queue, 3).await;

        let report = runner.drain().await;
        assert_eq!(report.deferred, 3);
        assert_eq!(report.failed, 0);

        let items = queue.get_all().await;
        assert!(items
            .iter()
            .all(|i| i.status == QueueStatus::Pending && i.retry_count == 0));
    }

    #[tokio::test]
    async fn test_repeated_failures_end_in_dead_letters() {
        let dispatcher = Arc::new(FailDispatcher::new());
        let connectivity = Arc::new(ConnectivityObserver::new(ConnectivityState::online("wifi")));
        let queue = Arc::new(
            MutationQueue::new(Arc::new(MemoryStore::new()), connectivity.clone())
                .with_dead_letter_after(6),
        );
        let runner = SyncRunner::new(
            queue.clone(),
            dispatcher.clone(),
            connectivity,
            fast_settings(),
        );
        enqueue_n(&queue, 1).await;

        let first = runner.drain().await;
        assert_eq!(first.dead_lettered, 0);
        let second = runner.drain().await;
        assert_eq!(second.dead_lettered, 1);

        // Dead letters are no longer drained.
        let third = runner.drain().await;
        assert_eq!(third.attempted, 0);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 6);
        assert_eq!(queue.pending_count().await, 0);
        assert_eq!(queue.dead_letters().await[0].retry_count, 6);
    }

    #[tokio::test]
    async fn test_synced_mutations_are_broadcast() {
        let dispatcher = Arc::new(SuccessDispatcher::new());
        let (_connectivity, queue, runner) = setup(true, dispatcher);
        let mut synced_rx = runner.subscribe_synced();
        let id = enqueue_n(&queue, 1).await.remove(0);

        runner.drain().await;
        let synced = synced_rx.try_recv().unwrap();
        assert_eq!(synced.item.id, id);
        assert_eq!(synced.response, json!({ "ok": "/api/addresses/0/" }));
    }

    #[tokio::test]
    async fn test_interrupted_syncing_items_are_resumed() {
        let dispatcher = Arc::new(SuccessDispatcher::new());
        let (_connectivity, queue, runner) = setup(true, dispatcher.clone());
        let ids = enqueue_n(&queue, 2).await;
        queue.mark_syncing(&ids).await.unwrap();

        let report = runner.drain().await;
        assert_eq!(report.succeeded, 2);
        assert!(queue.get_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_daemon_reports_error_status_on_failures() {
        let dispatcher = Arc::new(FailDispatcher::new());
        let (connectivity, queue, runner) = setup(true, dispatcher);
        enqueue_n(&queue, 1).await;

        let (_trigger, trigger_rx) = trigger_channel();
        let mut daemon = SyncDaemon::new(runner, connectivity.subscribe(), trigger_rx);
        let status_rx = daemon.subscribe_status();

        daemon.sync_cycle().await;
        assert!(matches!(*status_rx.borrow(), SyncStatus::Error(_)));

        connectivity.force_offline(true);
        daemon.sync_cycle().await;
        assert_eq!(*status_rx.borrow(), SyncStatus::Offline);
    }
}
