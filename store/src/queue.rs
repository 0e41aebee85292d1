//! Durable FIFO outbox of mutations waiting for the server.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use huddle_protocol::Clock;
use huddle_protocol::SyncKind;
use huddle_protocol::SyncQueueItem;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::storage::StorageHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Oldest items are evicted beyond this many entries.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Budget stamped on newly enqueued items.
    #[serde(default = "default_item_max_retries")]
    pub item_max_retries: u32,
}

fn default_capacity() -> usize {
    50
}
fn default_item_max_retries() -> u32 {
    huddle_protocol::sync::DEFAULT_ITEM_MAX_RETRIES
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            item_max_retries: default_item_max_retries(),
        }
    }
}

/// Why one item was not delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFailure<E> {
    /// The send was attempted and failed; the item spends one retry.
    Rejected(E),
    /// Nothing was attempted. The pass stops and every remaining item keeps
    /// its budget.
    Deferred(E),
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Items the server accepted.
    pub success: usize,
    /// Items that failed for the last time and were removed.
    pub failed: usize,
    /// Items that failed but keep part of their budget.
    pub retained: usize,
    /// Items left untouched because the pass was deferred.
    pub deferred: usize,
    /// The terminally failed items, in drain order.
    pub dropped: Vec<SyncQueueItem>,
}

impl DrainReport {
    pub fn attempted(&self) -> usize {
        self.success + self.failed + self.retained
    }
}

/// Handle to the persisted queue. Cheap to clone.
///
/// Only one drain may run at a time; callers enforce that.
#[derive(Clone)]
pub struct SyncQueue {
    storage: Arc<StorageHandle>,
    clock: Arc<dyn Clock>,
    key: String,
    config: QueueConfig,
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("key", &self.key)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyncQueue {
    pub fn new(
        storage: Arc<StorageHandle>,
        clock: Arc<dyn Clock>,
        key: impl Into<String>,
        config: QueueConfig,
    ) -> Self {
        Self {
            storage,
            clock,
            key: key.into(),
            config,
        }
    }

    pub fn item_max_retries(&self) -> u32 {
        self.config.item_max_retries
    }

    /// Append a new mutation with a generated id.
    pub fn enqueue(&self, kind: SyncKind, payload: serde_json::Value) -> SyncQueueItem {
        let now = self.clock.now_ms();
        let id = format!("{kind}_{now}_{}", uuid::Uuid::new_v4().simple());
        let mut item = SyncQueueItem::new(id, kind, payload, now);
        item.max_retries = self.config.item_max_retries;
        self.enqueue_item(item.clone());
        item
    }

    /// Append `item`, replacing any queued item with the same id in place.
    pub fn enqueue_item(&self, item: SyncQueueItem) {
        let capacity = self.config.capacity;
        self.storage
            .update::<Vec<SyncQueueItem>, _>(&self.key, |slot| {
                let items = slot.get_or_insert_with(Vec::new);
                match items.iter_mut().find(|queued| queued.id == item.id) {
                    Some(queued) => *queued = item,
                    None => items.push(item),
                }
                let overflow = items.len().saturating_sub(capacity);
                for evicted in items.drain(..overflow) {
                    warn!(
                        id = %evicted.id,
                        kind = %evicted.kind,
                        "sync queue full, evicting oldest unsynced item"
                    );
                }
            });
    }

    /// Snapshot of the queued items, oldest first.
    pub fn pending(&self) -> Vec<SyncQueueItem> {
        self.storage
            .read::<Vec<SyncQueueItem>>(&self.key)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    pub fn clear(&self) {
        self.storage.remove(&self.key);
    }

    /// Send every item queued at the start of the pass, oldest first.
    ///
    /// Items enqueued while the pass runs wait for the next one. Each
    /// outcome is committed with its own read-modify-write, so a concurrent
    /// enqueue is never lost. A [`SendFailure::Deferred`] ends the pass early.
    pub async fn drain<F, Fut, E>(&self, mut send: F) -> DrainReport
    where
        F: FnMut(SyncQueueItem) -> Fut,
        Fut: Future<Output = Result<(), SendFailure<E>>>,
        E: Display,
    {
        let snapshot = self.pending();
        let mut report = DrainReport::default();
        if snapshot.is_empty() {
            return report;
        }
        debug!(items = snapshot.len(), "draining sync queue");

        let total = snapshot.len();
        for (index, item) in snapshot.into_iter().enumerate() {
            let id = item.id.clone();
            match send(item).await {
                Ok(()) => {
                    self.remove_item(&id);
                    report.success += 1;
                }
                Err(SendFailure::Deferred(e)) => {
                    report.deferred = total - index;
                    warn!(
                        id = %id,
                        deferred = report.deferred,
                        error = %e,
                        "sync deferred, leaving the rest of the queue untouched"
                    );
                    break;
                }
                Err(SendFailure::Rejected(e)) => match self.record_failure(&id) {
                    Some(FailureOutcome::Dropped(item)) => {
                        error!(
                            id = %item.id,
                            kind = %item.kind,
                            attempts = item.retry_count,
                            error = %e,
                            "sync item failed permanently"
                        );
                        report.failed += 1;
                        report.dropped.push(item);
                    }
                    Some(FailureOutcome::Retained { retry_count }) => {
                        debug!(id = %id, retry_count, error = %e, "sync item will retry");
                        report.retained += 1;
                    }
                    None => debug!(id = %id, "sync item vanished during drain"),
                },
            }
        }

        info!(
            success = report.success,
            failed = report.failed,
            retained = report.retained,
            deferred = report.deferred,
            "sync queue drained"
        );
        report
    }

    fn remove_item(&self, id: &str) {
        self.storage
            .update::<Vec<SyncQueueItem>, _>(&self.key, |slot| {
                if let Some(items) = slot.as_mut() {
                    items.retain(|item| item.id != id);
                }
            });
    }

    fn record_failure(&self, id: &str) -> Option<FailureOutcome> {
        self.storage
            .update::<Vec<SyncQueueItem>, _>(&self.key, |slot| {
                let items = slot.as_mut()?;
                let index = items.iter().position(|item| item.id == id)?;
                let item = &mut items[index];
                item.retry_count = item.retry_count.saturating_add(1);
                if item.is_exhausted() {
                    Some(FailureOutcome::Dropped(items.remove(index)))
                } else {
                    Some(FailureOutcome::Retained {
                        retry_count: item.retry_count,
                    })
                }
            })
    }
}

enum FailureOutcome {
    Dropped(SyncQueueItem),
    Retained { retry_count: u32 },
}
