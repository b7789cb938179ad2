//! Background sync for queued mutations.
//!
//! The daemon drains the mutation queue on a periodic tick, on a manual
//! trigger (the "sync now" action or an enqueue while online), and whenever
//! connectivity comes back.

pub mod queue;
pub mod runner;
#[cfg(test)]
mod tests;

pub use queue::{
    DispatchOutcome, MutationAction, MutationDispatcher, MutationQueue, QueueError, QueueItem,
    QueueStatus, SyncTrigger,
};
pub use runner::{DrainReport, DrainSkip, SyncRunner, SyncSettings, SyncedMutation};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::status::SyncStatus;
use crate::storage::KeyValueStore;

/// Default periodic drain interval (30 seconds).
pub const SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Create the manual trigger channel. Capacity 1: extra triggers while one
/// is pending collapse into it.
pub fn trigger_channel() -> (SyncTrigger, mpsc::Receiver<()>) {
    mpsc::channel(1)
}

/// The background sync daemon.
///
/// Runs in a tokio task. Owns nothing but a handle on the runner, so the
/// queue stays usable from the rest of the app while it runs.
pub struct SyncDaemon<S, D> {
    runner: Arc<SyncRunner<S, D>>,
    poll_interval: Duration,
    /// Manual sync triggers (sync-now, enqueue while online).
    sync_now_rx: mpsc::Receiver<()>,
    /// Composite online flag from the connectivity observer.
    online_rx: watch::Receiver<bool>,
    status_tx: watch::Sender<SyncStatus>,
    /// Whether the last observation was offline.
    was_offline: bool,
}

impl<S: KeyValueStore, D: MutationDispatcher> SyncDaemon<S, D> {
    pub fn new(
        runner: Arc<SyncRunner<S, D>>,
        online_rx: watch::Receiver<bool>,
        sync_now_rx: mpsc::Receiver<()>,
    ) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::Idle);
        let was_offline = !*online_rx.borrow();
        Self {
            runner,
            poll_interval: SYNC_INTERVAL,
            sync_now_rx,
            online_rx,
            status_tx,
            was_offline,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Main run loop. Call from a spawned tokio task.
    ///
    /// Uses `tokio::select!` to wait on the periodic tick, a manual trigger,
    /// or a connectivity change.
    pub async fn run(&mut self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        // The first tick fires immediately; a drain on start is still wanted.
        log::info!(
            "Sync daemon started (interval: {}s)",
            self.poll_interval.as_secs()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sync_cycle().await;
                }
                Some(()) = self.sync_now_rx.recv() => {
                    log::debug!("Manual sync triggered");
                    self.sync_cycle().await;
                }
                Ok(()) = self.online_rx.changed() => {
                    let online = *self.online_rx.borrow_and_update();
                    if online {
                        log::info!("Connectivity restored, draining queue");
                        self.sync_cycle().await;
                    } else {
                        self.mark_offline();
                    }
                }
            }
        }
    }

    /// Execute one drain pass and publish the resulting status.
    pub async fn sync_cycle(&mut self) {
        self.status_tx.send_replace(SyncStatus::Syncing);
        let report = self.runner.drain().await;

        let status = match report.skipped {
            Some(DrainSkip::Offline) => {
                self.mark_offline();
                return;
            }
            Some(DrainSkip::AlreadyRunning) => return,
            None if report.failed > 0 || report.dead_lettered > 0 => SyncStatus::Error(format!(
                "{} mutation(s) failed to sync",
                report.failed
            )),
            None => SyncStatus::Synced,
        };

        if self.was_offline {
            log::info!("Connectivity restored, sync resumed");
            self.was_offline = false;
        }
        self.status_tx.send_replace(status);
    }

    fn mark_offline(&mut self) {
        if !self.was_offline {
            log::info!("Network appears offline, pausing sync");
            self.was_offline = true;
        }
        self.status_tx.send_replace(SyncStatus::Offline);
    }
}
