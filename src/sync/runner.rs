//! Drain pass over the mutation queue.
//!
//! Items are sent in fixed-size batches. Inside a batch every item is
//! dispatched concurrently and independently (all-settled); batches run one
//! after another with a short pause in between.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::broadcast;

use super::queue::{DispatchOutcome, MutationDispatcher, MutationQueue, QueueItem};
use crate::api::error::{ApiError, ErrorKind};
use crate::connectivity::ConnectivityObserver;
use crate::storage::KeyValueStore;

/// Capacity of the synced-mutation broadcast channel.
const OUTCOME_CHANNEL_CAPACITY: usize = 64;

/// Tunables of a drain pass.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub batch_size: usize,
    /// Dispatch attempts per item per pass.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Pause between two batches.
    pub batch_delay: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            batch_delay: Duration::from_millis(500),
        }
    }
}

impl SyncSettings {
    /// Backoff after the `attempt`-th failure (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainSkip {
    AlreadyRunning,
    Offline,
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub batches: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub deferred: usize,
    pub skipped: Option<DrainSkip>,
}

impl DrainReport {
    fn skipped(reason: DrainSkip) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

/// A mutation the server confirmed, with the server's response body.
#[derive(Debug, Clone)]
pub struct SyncedMutation {
    pub item: QueueItem,
    pub response: Value,
}

/// Resets the drain flag when a pass ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncRunner<S, D> {
    queue: Arc<MutationQueue<S>>,
    dispatcher: Arc<D>,
    connectivity: Arc<ConnectivityObserver>,
    settings: SyncSettings,
    draining: AtomicBool,
    synced_tx: broadcast::Sender<SyncedMutation>,
}

impl<S: KeyValueStore, D: MutationDispatcher> SyncRunner<S, D> {
    pub fn new(
        queue: Arc<MutationQueue<S>>,
        dispatcher: Arc<D>,
        connectivity: Arc<ConnectivityObserver>,
        settings: SyncSettings,
    ) -> Self {
        let (synced_tx, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            queue,
            dispatcher,
            connectivity,
            settings: SyncSettings {
                batch_size: settings.batch_size.max(1),
                max_attempts: settings.max_attempts.max(1),
                ..settings
            },
            draining: AtomicBool::new(false),
            synced_tx,
        }
    }

    pub fn queue(&self) -> &Arc<MutationQueue<S>> {
        &self.queue
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Confirmed mutations with their response bodies (e.g. the updated cart).
    pub fn subscribe_synced(&self) -> broadcast::Receiver<SyncedMutation> {
        self.synced_tx.subscribe()
    }

    /// Attempt to flush every PENDING/FAILED item.
    ///
    /// Dropped (not queued) if a pass is already running or the device is
    /// offline.
    pub async fn drain(&self) -> DrainReport {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("Drain already in progress, skipping");
            return DrainReport::skipped(DrainSkip::AlreadyRunning);
        }
        let _guard = DrainGuard(&self.draining);

        if !self.connectivity.is_online() {
            log::debug!("Offline, drain skipped");
            return DrainReport::skipped(DrainSkip::Offline);
        }

        let items = self.queue.drainable().await;
        let mut report = DrainReport::default();

        if !items.is_empty() {
            log::info!(
                "Draining {} queued mutations (batch size {})",
                items.len(),
                self.settings.batch_size
            );
        }

        for (index, batch) in items.chunks(self.settings.batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.settings.batch_delay).await;
                if !self.connectivity.is_online() {
                    log::info!("Connectivity lost mid-drain, leaving remaining items queued");
                    break;
                }
            }
            self.process_batch(batch, &mut report).await;
        }

        if let Err(e) = self.queue.remove_succeeded().await {
            log::error!("Failed to sweep synced mutations: {}", e);
        }
        self.queue.notify_pending().await;

        if report.attempted > 0 {
            log::info!(
                "Drain complete: {} synced, {} failed, {} dead-lettered, {} deferred",
                report.succeeded,
                report.failed,
                report.dead_lettered,
                report.deferred
            );
        }
        report
    }

    async fn process_batch(&self, batch: &[QueueItem], report: &mut DrainReport) {
        let ids: Vec<String> = batch.iter().map(|item| item.id.clone()).collect();
        if let Err(e) = self.queue.mark_syncing(&ids).await {
            log::error!("Failed to mark batch as syncing: {}", e);
            return;
        }

        let results = join_all(batch.iter().map(|item| self.dispatch_with_retry(item))).await;

        report.batches += 1;
        report.attempted += batch.len();

        let mut outcomes = Vec::with_capacity(batch.len());
        for (item, (outcome, response)) in batch.iter().zip(results) {
            match &outcome {
                DispatchOutcome::Succeeded => {
                    report.succeeded += 1;
                    if let Some(response) = response {
                        let _ = self.synced_tx.send(SyncedMutation {
                            item: item.clone(),
                            response,
                        });
                    }
                }
                DispatchOutcome::Failed { .. } => report.failed += 1,
                DispatchOutcome::Deferred => report.deferred += 1,
            }
            outcomes.push((item.id.clone(), outcome));
        }

        match self.queue.record_outcomes(&outcomes).await {
            Ok(dead) => {
                for id in &dead {
                    log::error!("Mutation {} moved to dead letters", id);
                }
                report.dead_lettered += dead.len();
            }
            Err(e) => log::error!("Failed to record batch outcomes: {}", e),
        }
    }

    /// Dispatch one item, retrying with exponential backoff.
    async fn dispatch_with_retry(&self, item: &QueueItem) -> (DispatchOutcome, Option<Value>) {
        let mut attempt = 0;
        loop {
            match self.dispatcher.dispatch(item).await {
                Ok(response) => return (DispatchOutcome::Succeeded, Some(response)),
                Err(ApiError::Offline) => return (DispatchOutcome::Deferred, None),
                Err(e) => {
                    attempt += 1;
                    if e.kind() == ErrorKind::Validation {
                        // The same payload will be rejected again.
                        log::warn!(
                            "Mutation {} {} rejected by server: {}",
                            item.id,
                            item.endpoint,
                            e
                        );
                        return (
                            DispatchOutcome::Failed {
                                attempts: attempt,
                                error: e.to_string(),
                            },
                            None,
                        );
                    }
                    if attempt >= self.settings.max_attempts {
                        log::warn!(
                            "Mutation {} {} failed after {} attempts: {}",
                            item.id,
                            item.endpoint,
                            attempt,
                            e
                        );
                        return (
                            DispatchOutcome::Failed {
                                attempts: attempt,
                                error: e.to_string(),
                            },
                            None,
                        );
                    }
                    let delay = self.settings.backoff_delay(attempt);
                    log::debug!(
                        "Mutation {} attempt {}/{} failed ({}), retrying in {:?}",
                        item.id,
                        attempt,
                        self.settings.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
