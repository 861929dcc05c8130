//! Durable ordered queue of local mutations awaiting transmission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use satchel_common::{ContentId, Error, Result};
use satchel_storage::BlobStore;

/// Blob key holding the serialized queue journal.
const JOURNAL_KEY: &str = "queue/journal";

/// Kind of local mutation. The payload shape depends on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    /// Learner progress advanced (e.g., lesson position, score).
    ProgressUpdate,
    /// A bookmark was set or cleared.
    BookmarkSet,
    /// A free-form note was saved against the content.
    NoteSaved,
}

/// Delivery status of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueStatus {
    /// Waiting for delivery.
    Pending,
    /// Currently being submitted.
    InFlight,
    /// Server reported a base-state conflict; held for explicit resolution.
    Conflict,
    /// Rejected as invalid or past the retry ceiling; excluded from drains
    /// but kept visible in reports.
    FailedTerminal,
}

/// One pending local mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// Locally generated id; creation order is the queue order.
    pub id: Uuid,
    /// Target entity of the mutation.
    pub content_id: ContentId,
    pub kind: MutationKind,
    /// Mutation body, shaped per `kind`.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Delivery attempts so far.
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub status: QueueStatus,
    /// Last delivery error, for reports.
    pub last_error: Option<String>,
}

impl SyncQueueItem {
    /// Build a fresh pending mutation.
    pub fn new(content_id: ContentId, kind: MutationKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            content_id,
            kind,
            payload,
            created_at: Utc::now(),
            attempt_count: 0,
            last_attempt_at: None,
            status: QueueStatus::Pending,
            last_error: None,
        }
    }
}

/// Ordered, durable list of local mutations.
///
/// Items are appended in creation order and that order survives restart.
/// Status and attempt counts are mutated only by the sync engine; items
/// leave the queue only on server acknowledgement or explicit discard.
pub struct SyncQueue {
    store: Arc<dyn BlobStore>,
    items: RwLock<Vec<SyncQueueItem>>,
}

impl SyncQueue {
    /// Open the queue, loading any persisted journal from the blob store.
    ///
    /// Items journaled as `InFlight` were interrupted mid-delivery; they
    /// come back `Pending` so a later drain picks them up again.
    pub async fn open(store: Arc<dyn BlobStore>) -> Result<Self> {
        let mut items: Vec<SyncQueueItem> = match store.read(JOURNAL_KEY).await? {
            Some(raw) => serde_json::from_slice(&raw)
                .map_err(|e| Error::Serialization(format!("queue journal: {e}")))?,
            None => Vec::new(),
        };
        let mut recovered = 0;
        for item in items.iter_mut() {
            if item.status == QueueStatus::InFlight {
                item.status = QueueStatus::Pending;
                recovered += 1;
            }
        }
        if recovered > 0 {
            debug!(recovered, "interrupted deliveries reset to pending");
        }
        debug!(count = items.len(), "sync queue opened");
        Ok(Self {
            store,
            items: RwLock::new(items),
        })
    }

    async fn persist(&self, items: &[SyncQueueItem]) -> Result<()> {
        let raw =
            serde_json::to_vec_pretty(items).map_err(|e| Error::Serialization(e.to_string()))?;
        self.store.write(JOURNAL_KEY, raw).await
    }

    /// Append a new pending mutation. Purely local; never blocks on
    /// network state.
    pub async fn enqueue(
        &self,
        content_id: ContentId,
        kind: MutationKind,
        payload: serde_json::Value,
    ) -> Result<Uuid> {
        let item = SyncQueueItem::new(content_id, kind, payload);
        let id = item.id;

        let mut items = self.items.write().await;
        items.push(item);
        self.persist(&items).await?;
        debug!(item = %id, "mutation enqueued");
        Ok(id)
    }

    /// Snapshot of all items in creation order.
    pub async fn items(&self) -> Vec<SyncQueueItem> {
        self.items.read().await.clone()
    }

    /// Items still eligible for delivery, in creation order.
    pub async fn pending(&self) -> Vec<SyncQueueItem> {
        self.items
            .read()
            .await
            .iter()
            .filter(|i| i.status == QueueStatus::Pending)
            .cloned()
            .collect()
    }

    /// Items held in the conflict sub-state.
    pub async fn conflicted(&self) -> Vec<SyncQueueItem> {
        self.items
            .read()
            .await
            .iter()
            .filter(|i| i.status == QueueStatus::Conflict)
            .cloned()
            .collect()
    }

    /// Terminally failed items, kept for visibility.
    pub async fn terminal_failures(&self) -> Vec<SyncQueueItem> {
        self.items
            .read()
            .await
            .iter()
            .filter(|i| i.status == QueueStatus::FailedTerminal)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Apply a status/attempt mutation to one item and persist.
    ///
    /// Returns `false` if the item no longer exists.
    pub(crate) async fn update<F>(&self, id: Uuid, f: F) -> Result<bool>
    where
        F: FnOnce(&mut SyncQueueItem),
    {
        let mut items = self.items.write().await;
        let Some(item) = items.iter_mut().find(|i| i.id == id) else {
            return Ok(false);
        };
        f(item);
        self.persist(&items).await?;
        Ok(true)
    }

    /// Remove an acknowledged or explicitly discarded item.
    pub(crate) async fn remove(&self, id: Uuid) -> Result<bool> {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|i| i.id != id);
        if items.len() == before {
            return Ok(false);
        }
        self.persist(&items).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satchel_storage::MemoryStore;
    use serde_json::json;

    fn cid(s: &str) -> ContentId {
        ContentId::new(s).unwrap()
    }

    async fn open_memory() -> SyncQueue {
        SyncQueue::open(Arc::new(MemoryStore::new())).await.unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_preserves_creation_order() {
        let queue = open_memory().await;
        let a = queue
            .enqueue(cid("c1"), MutationKind::ProgressUpdate, json!({"lesson": 1}))
            .await
            .unwrap();
        let b = queue
            .enqueue(cid("c2"), MutationKind::BookmarkSet, json!({"page": 4}))
            .await
            .unwrap();
        let c = queue
            .enqueue(cid("c1"), MutationKind::ProgressUpdate, json!({"lesson": 2}))
            .await
            .unwrap();

        let ids: Vec<Uuid> = queue.items().await.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![a, b, c]);
    }

    #[tokio::test]
    async fn test_new_items_are_pending() {
        let queue = open_memory().await;
        queue
            .enqueue(cid("c1"), MutationKind::NoteSaved, json!({"text": "hi"}))
            .await
            .unwrap();

        let items = queue.items().await;
        assert_eq!(items[0].status, QueueStatus::Pending);
        assert_eq!(items[0].attempt_count, 0);
        assert!(items[0].last_attempt_at.is_none());
    }

    #[tokio::test]
    async fn test_update_and_remove() {
        let queue = open_memory().await;
        let id = queue
            .enqueue(cid("c1"), MutationKind::ProgressUpdate, json!({}))
            .await
            .unwrap();

        assert!(queue
            .update(id, |i| {
                i.status = QueueStatus::Conflict;
                i.attempt_count += 1;
            })
            .await
            .unwrap());
        assert_eq!(queue.conflicted().await.len(), 1);

        assert!(queue.remove(id).await.unwrap());
        assert!(queue.is_empty().await);
        // Absent item: normal return, not an error.
        assert!(!queue.remove(id).await.unwrap());
        assert!(!queue.update(id, |_| {}).await.unwrap());
    }

    #[tokio::test]
    async fn test_journal_survives_reopen() {
        let store = Arc::new(MemoryStore::new());
        let first_id;
        {
            let queue = SyncQueue::open(store.clone()).await.unwrap();
            first_id = queue
                .enqueue(cid("c1"), MutationKind::ProgressUpdate, json!({"lesson": 3}))
                .await
                .unwrap();
            queue
                .enqueue(cid("c2"), MutationKind::BookmarkSet, json!({"page": 9}))
                .await
                .unwrap();
        }

        let queue = SyncQueue::open(store).await.unwrap();
        let items = queue.items().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, first_id);
        assert_eq!(items[0].payload, json!({"lesson": 3}));
    }

    #[tokio::test]
    async fn test_status_filters() {
        let queue = open_memory().await;
        let a = queue
            .enqueue(cid("c1"), MutationKind::ProgressUpdate, json!({}))
            .await
            .unwrap();
        let b = queue
            .enqueue(cid("c2"), MutationKind::ProgressUpdate, json!({}))
            .await
            .unwrap();
        queue
            .enqueue(cid("c3"), MutationKind::ProgressUpdate, json!({}))
            .await
            .unwrap();

        queue
            .update(a, |i| i.status = QueueStatus::FailedTerminal)
            .await
            .unwrap();
        queue
            .update(b, |i| i.status = QueueStatus::Conflict)
            .await
            .unwrap();

        assert_eq!(queue.pending().await.len(), 1);
        assert_eq!(queue.conflicted().await.len(), 1);
        assert_eq!(queue.terminal_failures().await.len(), 1);
        assert_eq!(queue.len().await, 3);
    }

    #[tokio::test]
    async fn test_interrupted_delivery_recovers_as_pending() {
        let store = Arc::new(MemoryStore::new());
        let id;
        {
            let queue = SyncQueue::open(store.clone()).await.unwrap();
            id = queue
                .enqueue(cid("c1"), MutationKind::ProgressUpdate, json!({"lesson": 1}))
                .await
                .unwrap();
            // Crash between marking in-flight and recording the outcome.
            queue
                .update(id, |i| {
                    i.status = QueueStatus::InFlight;
                    i.attempt_count += 1;
                })
                .await
                .unwrap();
        }

        let queue = SyncQueue::open(store).await.unwrap();
        let pending = queue.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].status, QueueStatus::Pending);
        // Attempt history is preserved for backoff.
        assert_eq!(pending[0].attempt_count, 1);
    }
}
