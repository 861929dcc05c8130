//! Directory-backed remote for the CLI.
//!
//! Each content item lives at `<library>/<id>/` holding a `meta.json`
//! (title, subject, version) and a `package.bin`. Delivered mutations are
//! appended to `<library>/mutations.log` as JSON lines.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use satchel_common::{ContentId, Error, Result, Version};
use satchel_engine::{
    PackageDownload, PackageMeta, RemoteContent, SubmitOutcome, SyncQueueItem,
};

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
struct LibraryMeta {
    title: String,
    subject: String,
    version: Version,
}

pub struct DirRemote {
    root: PathBuf,
}

impl DirRemote {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    async fn read_meta(&self, id: &ContentId) -> Result<Option<LibraryMeta>> {
        let path = self.root.join(id.as_str()).join("meta.json");
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Network(format!("library unreadable: {e}"))),
        };
        let meta = serde_json::from_slice(&raw)
            .map_err(|e| Error::Serialization(format!("{}: {e}", path.display())))?;
        Ok(Some(meta))
    }
}

#[async_trait]
impl RemoteContent for DirRemote {
    async fn fetch_package(&self, id: &ContentId) -> Result<PackageDownload> {
        let meta = self
            .read_meta(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{id} is not in the library")))?;

        let path = self.root.join(id.as_str()).join("package.bin");
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::Network(format!("library unreadable: {e}")))?;

        let package_meta = PackageMeta {
            content_id: id.clone(),
            title: meta.title,
            subject: meta.subject,
            version: meta.version,
            size_in_bytes: bytes.len() as u64,
            checksum: Some(crc32fast::hash(&bytes)),
        };
        debug!(content_id = %id, size = bytes.len(), "resolved library package");

        let chunks: Vec<Result<Bytes>> = bytes
            .chunks(CHUNK_SIZE)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(PackageDownload {
            meta: package_meta,
            stream: Box::pin(futures::stream::iter(chunks)),
        })
    }

    async fn fetch_current_versions(
        &self,
        ids: &[ContentId],
    ) -> Result<HashMap<ContentId, Version>> {
        let mut versions = HashMap::new();
        for id in ids {
            if let Some(meta) = self.read_meta(id).await? {
                versions.insert(id.clone(), meta.version);
            }
        }
        Ok(versions)
    }

    async fn submit_mutation(&self, item: &SyncQueueItem) -> Result<SubmitOutcome> {
        if self.read_meta(&item.content_id).await?.is_none() {
            return Ok(SubmitOutcome::Invalid(format!(
                "{} is not in the library",
                item.content_id
            )));
        }

        let mut line = serde_json::to_vec(item)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        line.push(b'\n');

        let path = self.root.join("mutations.log");
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::Network(format!("library unwritable: {e}")))?;
        file.write_all(&line)
            .await
            .map_err(|e| Error::Network(format!("library unwritable: {e}")))?;
        Ok(SubmitOutcome::Ack)
    }
}
