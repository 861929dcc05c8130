//! In-memory blob store for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::adapter::BlobStore;
use satchel_common::{Error, Result};

/// In-memory blob store.
///
/// Useful for testing and development. All data is stored in memory and
/// lost on drop. `fail_next_delete` arms a one-shot delete failure so
/// callers can exercise their rollback paths.
pub struct MemoryStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    fail_next_delete: AtomicBool,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            blobs: Arc::new(RwLock::new(HashMap::new())),
            fail_next_delete: AtomicBool::new(false),
        }
    }

    /// Arm a one-shot failure for the next `delete` call.
    pub fn fail_next_delete(&self) {
        self.fail_next_delete.store(true, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().unwrap().get(key).cloned())
    }

    async fn write(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.blobs.write().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        if self.fail_next_delete.swap(false, Ordering::SeqCst) {
            return Err(Error::Storage(format!("injected delete failure for {key}")));
        }
        Ok(self.blobs.write().unwrap().remove(key).is_some())
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.blobs.read().unwrap().contains_key(key))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.blobs.read().unwrap().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
