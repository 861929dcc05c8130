//! Remote collaborator boundary.
//!
//! The engine never owns a transport; it is handed a [`RemoteContent`]
//! implementation. Transport failures surface as `Err(Error::Network)`,
//! while application-level rejections of a mutation come back inside
//! [`SubmitOutcome`] so the sync engine can tell the two apart.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

use satchel_common::{ContentId, Result, Version};

use crate::queue::SyncQueueItem;

/// Package metadata resolved before any bytes are transferred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageMeta {
    pub content_id: ContentId,
    /// Display metadata, not used for logic.
    pub title: String,
    pub subject: String,
    /// Server-assigned version of this package.
    pub version: Version,
    /// Declared transfer size; verified after the stream completes.
    pub size_in_bytes: u64,
    /// Optional CRC32 of the package body.
    pub checksum: Option<u32>,
}

/// Byte stream type for package transfers.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// A resolved package ready to be streamed.
pub struct PackageDownload {
    pub meta: PackageMeta,
    pub stream: ByteStream,
}

impl std::fmt::Debug for PackageDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageDownload")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// Application-level response to a submitted mutation.
///
/// Transport failures are `Err(Error::Network)` on the call itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Mutation accepted and applied.
    Ack,
    /// Target entity has changed remotely since the mutation was recorded.
    Conflict(String),
    /// Mutation rejected as invalid; retrying cannot help.
    Invalid(String),
}

/// Remote content and mutation API consumed by the engine.
#[async_trait]
pub trait RemoteContent: Send + Sync {
    /// Resolve a package's metadata and open its byte stream.
    ///
    /// # Errors
    /// - Unknown content id
    /// - Network failures
    async fn fetch_package(&self, id: &ContentId) -> Result<PackageDownload>;

    /// Fetch current published versions for a set of content ids in one
    /// batched call.
    ///
    /// Ids unknown to the server (e.g., deleted server-side) are simply
    /// absent from the returned map.
    async fn fetch_current_versions(
        &self,
        ids: &[ContentId],
    ) -> Result<HashMap<ContentId, Version>>;

    /// Submit one queued mutation.
    async fn submit_mutation(&self, item: &SyncQueueItem) -> Result<SubmitOutcome>;
}
