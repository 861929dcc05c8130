//! Derived storage and sync statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::ManifestEntry;
use crate::queue::{QueueStatus, SyncQueueItem};

/// Point-in-time statistics derived from the manifest and sync queue.
/// Not separately persisted; recomputed on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Sum of package sizes over all manifest entries.
    pub storage_used: u64,
    pub content_count: usize,
    pub pending_mutations: usize,
    pub conflicted_mutations: usize,
    pub terminal_failures: usize,
    /// Timestamp of the most recent successful full queue drain.
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl Stats {
    /// Derive stats from current state.
    pub fn derive(
        manifest: &[ManifestEntry],
        queue: &[SyncQueueItem],
        last_sync_time: Option<DateTime<Utc>>,
    ) -> Self {
        let count = |status: QueueStatus| queue.iter().filter(|i| i.status == status).count();
        Self {
            storage_used: manifest.iter().map(|e| e.size_in_bytes).sum(),
            content_count: manifest.len(),
            pending_mutations: count(QueueStatus::Pending) + count(QueueStatus::InFlight),
            conflicted_mutations: count(QueueStatus::Conflict),
            terminal_failures: count(QueueStatus::FailedTerminal),
            last_sync_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MutationKind;
    use satchel_common::ContentId;
    use uuid::Uuid;

    fn entry(id: &str, size: u64) -> ManifestEntry {
        ManifestEntry {
            content_id: ContentId::new(id).unwrap(),
            title: id.to_string(),
            subject: "history".to_string(),
            version: 1,
            size_in_bytes: size,
            downloaded_at: Utc::now(),
        }
    }

    fn item(status: QueueStatus) -> SyncQueueItem {
        SyncQueueItem {
            id: Uuid::new_v4(),
            content_id: ContentId::new("c1").unwrap(),
            kind: MutationKind::ProgressUpdate,
            payload: serde_json::json!({}),
            created_at: Utc::now(),
            attempt_count: 0,
            last_attempt_at: None,
            status,
            last_error: None,
        }
    }

    #[test]
    fn test_derive_empty() {
        let stats = Stats::derive(&[], &[], None);
        assert_eq!(stats.storage_used, 0);
        assert_eq!(stats.content_count, 0);
        assert!(stats.last_sync_time.is_none());
    }

    #[test]
    fn test_derive_tallies() {
        let manifest = vec![entry("a", 200_000), entry("b", 50_000)];
        let queue = vec![
            item(QueueStatus::Pending),
            item(QueueStatus::InFlight),
            item(QueueStatus::Conflict),
            item(QueueStatus::FailedTerminal),
        ];
        let now = Utc::now();
        let stats = Stats::derive(&manifest, &queue, Some(now));

        assert_eq!(stats.storage_used, 250_000);
        assert_eq!(stats.content_count, 2);
        assert_eq!(stats.pending_mutations, 2);
        assert_eq!(stats.conflicted_mutations, 1);
        assert_eq!(stats.terminal_failures, 1);
        assert_eq!(stats.last_sync_time, Some(now));
    }
}
