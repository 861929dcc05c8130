//! Blob store trait definition.

use async_trait::async_trait;

use satchel_common::Result;

/// Durable key-value blob store.
///
/// Keys are flat UTF-8 strings; implementations may map `/` in a key to
/// internal hierarchy but must treat the full key as the identity.
/// All writes must be durable (surviving process restart) on return.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Get the store name (e.g., "memory", "local").
    fn name(&self) -> &str;

    /// Read a blob.
    ///
    /// # Postconditions
    /// - Returns `None` for an absent key; absence is not an error.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a blob, replacing any existing value.
    ///
    /// # Postconditions
    /// - The write is durable on return
    /// - A concurrent crash never leaves a torn value at `key`
    async fn write(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// Delete a blob.
    ///
    /// # Postconditions
    /// - Returns `true` if a value was removed, `false` if the key was
    ///   absent. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Check whether a key holds a value.
    async fn contains(&self, key: &str) -> Result<bool>;

    /// List all keys currently holding a value.
    async fn keys(&self) -> Result<Vec<String>>;
}
