//! Manifest store: the local authoritative index of downloaded content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use satchel_common::{ContentId, Error, Result, Version};
use satchel_storage::BlobStore;

/// Blob key holding the serialized manifest index.
const INDEX_KEY: &str = "manifest/index";

/// One record per downloaded content item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub content_id: ContentId,
    /// Display metadata, not used for logic.
    pub title: String,
    pub subject: String,
    /// Server-assigned version of the locally stored package.
    pub version: Version,
    /// Size of the locally stored package bytes.
    pub size_in_bytes: u64,
    /// Timestamp of the last successful commit.
    pub downloaded_at: DateTime<Utc>,
}

/// Local index of downloaded content and its versions.
///
/// Invariants:
/// - at most one entry per content id
/// - `version` never rolls back for a given id
/// - an entry exists iff its package blob exists in the store
pub struct ManifestStore {
    store: Arc<dyn BlobStore>,
    entries: RwLock<BTreeMap<String, ManifestEntry>>,
}

impl ManifestStore {
    /// Open the manifest, loading any persisted index from the blob store.
    pub async fn open(store: Arc<dyn BlobStore>) -> Result<Self> {
        let entries = match store.read(INDEX_KEY).await? {
            Some(raw) => serde_json::from_slice(&raw)
                .map_err(|e| Error::Serialization(format!("manifest index: {e}")))?,
            None => BTreeMap::new(),
        };
        debug!(count = entries.len(), "manifest opened");
        Ok(Self {
            store,
            entries: RwLock::new(entries),
        })
    }

    fn package_key(id: &ContentId) -> String {
        format!("content/{id}")
    }

    async fn persist(&self, entries: &BTreeMap<String, ManifestEntry>) -> Result<()> {
        let raw = serde_json::to_vec_pretty(entries)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        self.store.write(INDEX_KEY, raw).await
    }

    /// Look up an entry. Absence is a normal return, not an error.
    pub async fn get(&self, id: &ContentId) -> Option<ManifestEntry> {
        self.entries.read().await.get(id.as_str()).cloned()
    }

    /// All entries, ordered by content id.
    pub async fn list(&self) -> Vec<ManifestEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    /// All manifested content ids.
    pub async fn content_ids(&self) -> Vec<ContentId> {
        self.entries
            .read()
            .await
            .values()
            .map(|e| e.content_id.clone())
            .collect()
    }

    /// Sum of `size_in_bytes` over all entries.
    pub async fn storage_used(&self) -> u64 {
        self.entries
            .read()
            .await
            .values()
            .map(|e| e.size_in_bytes)
            .sum()
    }

    /// Commit a package and its entry as one logical unit.
    ///
    /// The blob is written first and the entry recorded second; if
    /// recording fails the blob is deleted again, so no orphan survives in
    /// either direction. Re-committing an identical version is idempotent.
    ///
    /// # Errors
    /// - `VersionRegression` if `entry.version` is older than the stored one
    pub async fn commit(&self, entry: ManifestEntry, bytes: Vec<u8>) -> Result<()> {
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.get(entry.content_id.as_str()) {
            if entry.version < existing.version {
                return Err(Error::VersionRegression {
                    content_id: entry.content_id.clone(),
                    stored: existing.version,
                    offered: entry.version,
                });
            }
        }

        let key = Self::package_key(&entry.content_id);
        self.store.write(&key, bytes).await?;

        let previous = entries.insert(entry.content_id.as_str().to_string(), entry.clone());
        if let Err(e) = self.persist(&entries).await {
            // Roll back so the entry⇔blob invariant holds.
            match previous {
                Some(prev) => {
                    entries.insert(prev.content_id.as_str().to_string(), prev);
                }
                None => {
                    entries.remove(entry.content_id.as_str());
                    if let Err(del) = self.store.delete(&key).await {
                        warn!(content_id = %entry.content_id, error = %del,
                              "failed to delete package blob while rolling back commit");
                    }
                }
            }
            return Err(e);
        }

        debug!(content_id = %entry.content_id, version = entry.version, "manifest commit");
        Ok(())
    }

    /// Remove an entry and its package blob as one logical unit.
    ///
    /// If blob deletion fails, the metadata removal is rolled back so the
    /// invariant is never violated. Removing an absent id returns
    /// `Ok(false)`.
    pub async fn remove(&self, id: &ContentId) -> Result<bool> {
        let mut entries = self.entries.write().await;

        let Some(entry) = entries.remove(id.as_str()) else {
            return Ok(false);
        };
        self.persist(&entries).await.inspect_err(|_| {
            entries.insert(id.as_str().to_string(), entry.clone());
        })?;

        if let Err(e) = self.store.delete(&Self::package_key(id)).await {
            entries.insert(id.as_str().to_string(), entry);
            self.persist(&entries).await?;
            return Err(e);
        }

        debug!(content_id = %id, "manifest remove");
        Ok(true)
    }

    /// Read the locally stored package bytes for an entry.
    pub async fn read_package(&self, id: &ContentId) -> Result<Option<Vec<u8>>> {
        self.store.read(&Self::package_key(id)).await
    }
}
