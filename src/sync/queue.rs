//! Persistent queue of pending write operations.
//!
//! Mutations made while offline (or before the next drain) are appended to
//! a JSON list stored under [`QUEUE_STORAGE_KEY`] and removed once the
//! server confirms them. Every read-modify-write of that list holds the
//! queue's write lock, so concurrent enqueues cannot lose updates.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

use crate::api::error::ApiError;
use crate::api::types::HttpMethod;
use crate::connectivity::ConnectivityObserver;
use crate::crypto::utils::generate_id;
use crate::storage::{KeyValueStore, StorageError};

/// Storage key of the persisted queue blob.
pub const QUEUE_STORAGE_KEY: &str = "mutation_queue";

/// Where an unparseable queue blob is kept for inspection.
pub const QUEUE_CORRUPT_KEY: &str = "mutation_queue.corrupt";

/// Failed attempts after which an item is parked as a dead letter.
pub const DEFAULT_DEAD_LETTER_AFTER: u32 = 15;

/// Channel sender used to ask the sync daemon for an immediate drain.
pub type SyncTrigger = mpsc::Sender<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

impl std::str::FromStr for MutationAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(MutationAction::Create),
            "update" => Ok(MutationAction::Update),
            "delete" => Ok(MutationAction::Delete),
            other => Err(format!("unknown mutation action: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Pending,
    Syncing,
    Success,
    Failed,
    /// Gave up after too many failures; only drained again on explicit retry.
    DeadLetter,
}

impl QueueStatus {
    /// Counted by the pending badge.
    pub fn is_pending(self) -> bool {
        matches!(self, QueueStatus::Pending | QueueStatus::Failed)
    }
}

/// A single queued write operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub action: MutationAction,
    /// Path relative to the API base URL.
    pub endpoint: String,
    pub method: HttpMethod,
    pub payload: Value,
    pub status: QueueStatus,
    /// Failed dispatch attempts so far.
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

/// Result of dispatching one item during a drain pass.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Succeeded,
    /// All attempts of this pass failed.
    Failed { attempts: u32, error: String },
    /// Blocked by force-offline; not counted as an attempt.
    Deferred,
}

/// Trait abstracting the network dispatch of a queued mutation.
///
/// In production, `ApiClient` implements this by sending the item's method,
/// endpoint and payload. In tests, mock implementations control
/// success/failure behavior.
#[allow(async_fn_in_trait)]
pub trait MutationDispatcher {
    /// Returns the decoded response body on success.
    async fn dispatch(&self, item: &QueueItem) -> Result<Value, ApiError>;
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("Queue item not found: {0}")]
    NotFound(String),
    #[error("Queue item {0} is not a dead letter")]
    NotDeadLetter(String),
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Ordered, persisted list of mutations awaiting the server.
pub struct MutationQueue<S> {
    store: Arc<S>,
    connectivity: Arc<ConnectivityObserver>,
    write_lock: Mutex<()>,
    pending_tx: watch::Sender<usize>,
    drain_trigger: StdMutex<Option<SyncTrigger>>,
    dead_letter_after: u32,
}

impl<S: KeyValueStore> MutationQueue<S> {
    pub fn new(store: Arc<S>, connectivity: Arc<ConnectivityObserver>) -> Self {
        let (pending_tx, _) = watch::channel(0);
        Self {
            store,
            connectivity,
            write_lock: Mutex::new(()),
            pending_tx,
            drain_trigger: StdMutex::new(None),
            dead_letter_after: DEFAULT_DEAD_LETTER_AFTER,
        }
    }

    /// Override the dead-letter threshold (failed attempts). Minimum 1.
    pub fn with_dead_letter_after(mut self, attempts: u32) -> Self {
        self.dead_letter_after = attempts.max(1);
        self
    }

    pub fn dead_letter_after(&self) -> u32 {
        self.dead_letter_after
    }

    /// Install the daemon's trigger so enqueues while online drain at once.
    pub fn set_drain_trigger(&self, trigger: SyncTrigger) {
        if let Ok(mut slot) = self.drain_trigger.lock() {
            *slot = Some(trigger);
        }
    }

    /// Append a PENDING mutation and return its id.
    pub async fn enqueue(
        &self,
        action: MutationAction,
        endpoint: &str,
        method: HttpMethod,
        payload: Value,
    ) -> Result<String, QueueError> {
        let now = now_ms();
        let item = QueueItem {
            id: generate_id(),
            action,
            endpoint: endpoint.to_string(),
            method,
            payload,
            status: QueueStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        let id = item.id.clone();

        self.update(|items| items.push(item)).await?;
        log::info!("Queued {:?} {:?} {} ({})", action, method, endpoint, id);

        self.notify_pending().await;
        if self.connectivity.is_online() {
            self.request_drain();
        }
        Ok(id)
    }

    /// Every queued item, in enqueue order. Empty on absence or a corrupt blob.
    pub async fn get_all(&self) -> Vec<QueueItem> {
        match self.store.get_json::<Vec<QueueItem>>(QUEUE_STORAGE_KEY).await {
            Ok(Some(items)) => items,
            Ok(None) => Vec::new(),
            Err(e) => {
                log::error!("Failed to read mutation queue: {}", e);
                Vec::new()
            }
        }
    }

    /// Items with status PENDING or FAILED.
    pub async fn pending_count(&self) -> usize {
        self.get_all()
            .await
            .iter()
            .filter(|item| item.status.is_pending())
            .count()
    }

    /// Drop SUCCESS items. Returns how many were removed.
    pub async fn remove_succeeded(&self) -> Result<usize, QueueError> {
        self.update(|items| {
            let before = items.len();
            items.retain(|item| item.status != QueueStatus::Success);
            before - items.len()
        })
        .await
    }

    /// Items the next drain pass should send. SYNCING items left behind by an
    /// interrupted pass are picked up again.
    pub async fn drainable(&self) -> Vec<QueueItem> {
        self.get_all()
            .await
            .into_iter()
            .filter(|item| item.status.is_pending() || item.status == QueueStatus::Syncing)
            .collect()
    }

    pub(crate) async fn mark_syncing(&self, ids: &[String]) -> Result<(), QueueError> {
        let now = now_ms();
        self.update(|items| {
            for item in items.iter_mut().filter(|item| ids.contains(&item.id)) {
                item.status = QueueStatus::Syncing;
                item.updated_at = now;
            }
        })
        .await
    }

    /// Apply the outcomes of one batch in a single write. Returns the ids
    /// that were moved to DEAD_LETTER.
    pub(crate) async fn record_outcomes(
        &self,
        outcomes: &[(String, DispatchOutcome)],
    ) -> Result<Vec<String>, QueueError> {
        let now = now_ms();
        let threshold = self.dead_letter_after;
        self.update(|items| {
            let mut dead = Vec::new();
            for (id, outcome) in outcomes {
                let Some(item) = items.iter_mut().find(|item| &item.id == id) else {
                    // Discarded while in flight.
                    continue;
                };
                item.updated_at = now;
                match outcome {
                    DispatchOutcome::Succeeded => {
                        item.status = QueueStatus::Success;
                        item.last_error = None;
                    }
                    DispatchOutcome::Failed { attempts, error } => {
                        item.retry_count = item.retry_count.saturating_add(*attempts);
                        item.last_error = Some(error.clone());
                        if item.retry_count >= threshold {
                            item.status = QueueStatus::DeadLetter;
                            dead.push(item.id.clone());
                        } else {
                            item.status = QueueStatus::Failed;
                        }
                    }
                    DispatchOutcome::Deferred => {
                        item.status = if item.retry_count > 0 {
                            QueueStatus::Failed
                        } else {
                            QueueStatus::Pending
                        };
                    }
                }
            }
            dead
        })
        .await
    }

    pub async fn dead_letters(&self) -> Vec<QueueItem> {
        self.get_all()
            .await
            .into_iter()
            .filter(|item| item.status == QueueStatus::DeadLetter)
            .collect()
    }

    /// Move a dead letter back to PENDING with a fresh retry budget.
    pub async fn retry_dead_letter(&self, id: &str) -> Result<(), QueueError> {
        let now = now_ms();
        self.update(|items| {
            let item = items
                .iter_mut()
                .find(|item| item.id == id)
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            if item.status != QueueStatus::DeadLetter {
                return Err(QueueError::NotDeadLetter(id.to_string()));
            }
            item.status = QueueStatus::Pending;
            item.retry_count = 0;
            item.last_error = None;
            item.updated_at = now;
            Ok(())
        })
        .await??;
        log::info!("Dead letter {} requeued", id);
        self.notify_pending().await;
        Ok(())
    }

    /// Remove an item regardless of status.
    pub async fn discard(&self, id: &str) -> Result<QueueItem, QueueError> {
        let removed = self
            .update(|items| {
                let index = items
                    .iter()
                    .position(|item| item.id == id)
                    .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
                Ok::<_, QueueError>(items.remove(index))
            })
            .await??;
        log::warn!("Discarded queued mutation {} ({})", removed.endpoint, id);
        self.notify_pending().await;
        Ok(removed)
    }

    /// Queue-size listeners. Receives the pending count after every change
    /// and after every drain pass.
    pub fn subscribe_pending(&self) -> watch::Receiver<usize> {
        self.pending_tx.subscribe()
    }

    /// Publish the current pending count, even when unchanged.
    pub async fn notify_pending(&self) {
        let count = self.pending_count().await;
        self.pending_tx.send_replace(count);
    }

    fn request_drain(&self) {
        let trigger = match self.drain_trigger.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        if let Some(trigger) = trigger {
            // A full channel already holds a pending request.
            let _ = trigger.try_send(());
        }
    }

    /// Strict read for writers. Storage failures propagate so a write never
    /// replaces the list it could not read. A blob that reads fine but does
    /// not parse is moved to [`QUEUE_CORRUPT_KEY`] and the queue restarts
    /// empty.
    async fn load(&self) -> Result<Vec<QueueItem>, QueueError> {
        let Some(bytes) = self.store.get(QUEUE_STORAGE_KEY).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_slice(&bytes) {
            Ok(items) => Ok(items),
            Err(e) => {
                log::error!(
                    "Mutation queue blob is corrupt ({}), moving it to {}",
                    e,
                    QUEUE_CORRUPT_KEY
                );
                self.store.set(QUEUE_CORRUPT_KEY, &bytes).await?;
                Ok(Vec::new())
            }
        }
    }

    /// Drop every queued item, whatever its status. Returns how many were
    /// removed.
    pub async fn clear(&self) -> Result<usize, QueueError> {
        let removed = self.update(std::mem::take).await?.len();
        if removed > 0 {
            log::warn!("Cleared {} queued mutations", removed);
        }
        self.notify_pending().await;
        Ok(removed)
    }

    /// Serialized read-modify-write of the persisted list.
    async fn update<R>(
        &self,
        f: impl FnOnce(&mut Vec<QueueItem>) -> R,
    ) -> Result<R, QueueError> {
        let _guard = self.write_lock.lock().await;
        let mut items = self.load().await?;
        let result = f(&mut items);
        self.store.set_json(QUEUE_STORAGE_KEY, &items).await?;
        Ok(result)
    }
}
