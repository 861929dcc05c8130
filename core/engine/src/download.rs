//! Download manager: streaming package fetch with progress reporting,
//! per-content coalescing, cancellation and atomic commit.

use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use satchel_common::{ContentId, Error, Result, Version};

use crate::manifest::{ManifestEntry, ManifestStore};
use crate::remote::{PackageMeta, RemoteContent};

/// Progress event for one download. Terminal states are `Completed`,
/// `Failed` and `Cancelled`; `Transferring` percentages are 0–100 and
/// never decrease.
#[derive(Debug, Clone)]
pub enum DownloadProgress {
    /// Remote metadata is being resolved; no bytes transferred yet.
    Resolving,
    /// Metadata resolved; the transfer target is known.
    Started { version: Version, size_in_bytes: u64 },
    Transferring { percent: u8 },
    Completed(ManifestEntry),
    Failed(String),
    Cancelled,
}

impl DownloadProgress {
    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadProgress::Completed(_) | DownloadProgress::Failed(_) | DownloadProgress::Cancelled
        )
    }
}

/// Live view of a download. Late subscribers observe the latest event.
pub type ProgressStream = watch::Receiver<DownloadProgress>;

struct ActiveDownload {
    progress: ProgressStream,
    cancel: CancellationToken,
}

/// Fetches content packages, validates them and commits them into the
/// manifest store.
///
/// Downloads for distinct ids run concurrently up to a cap; concurrent
/// calls for the same id are coalesced onto the in-flight transfer.
pub struct DownloadManager {
    remote: Arc<dyn RemoteContent>,
    manifest: Arc<ManifestStore>,
    limiter: Arc<Semaphore>,
    active: Mutex<HashMap<String, ActiveDownload>>,
}

impl DownloadManager {
    pub fn new(
        remote: Arc<dyn RemoteContent>,
        manifest: Arc<ManifestStore>,
        concurrent_downloads: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            manifest,
            limiter: Arc::new(Semaphore::new(concurrent_downloads.max(1))),
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Start (or attach to) a download for a content item.
    ///
    /// Returns a progress stream terminating in `Completed`, `Failed` or
    /// `Cancelled`. All failures, including version regressions and
    /// integrity errors, surface as terminal events on the stream; the
    /// manifest is never corrupted by a failed transfer.
    ///
    /// `force` re-transfers a package whose version already matches the
    /// local copy (repair); truly older remote versions are always
    /// rejected.
    pub async fn download(self: &Arc<Self>, id: &ContentId, force: bool) -> ProgressStream {
        let mut active = self.active.lock().await;

        // Coalesce: attach to the in-flight transfer instead of starting
        // a duplicate.
        if let Some(existing) = active.get(id.as_str()) {
            debug!(content_id = %id, "attaching to in-flight download");
            return existing.progress.clone();
        }

        let (tx, rx) = watch::channel(DownloadProgress::Resolving);
        let cancel = CancellationToken::new();
        active.insert(
            id.as_str().to_string(),
            ActiveDownload {
                progress: rx.clone(),
                cancel: cancel.clone(),
            },
        );
        drop(active);

        let manager = self.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let permit = tokio::select! {
                _ = cancel.cancelled() => None,
                permit = manager.limiter.clone().acquire_owned() => permit.ok(),
            };

            // Cancellation is honored while queued and between chunks; a
            // transfer past verification always commits whole.
            let terminal = match permit {
                None => DownloadProgress::Cancelled,
                Some(_permit) => match manager.run_transfer(&id, force, &tx, &cancel).await {
                    Ok(Some(entry)) => DownloadProgress::Completed(entry),
                    Ok(None) => DownloadProgress::Cancelled,
                    Err(e) => {
                        warn!(content_id = %id, error = %e, "download failed");
                        DownloadProgress::Failed(e.to_string())
                    }
                },
            };

            tx.send_replace(terminal);
            manager.active.lock().await.remove(id.as_str());
        });

        rx
    }

    /// Cancel an in-flight download. Partially transferred bytes are
    /// discarded; no manifest entry is committed. Returns `false` if no
    /// transfer was in flight.
    pub async fn cancel(&self, id: &ContentId) -> bool {
        let active = self.active.lock().await;
        match active.get(id.as_str()) {
            Some(download) => {
                download.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids with a transfer currently in flight.
    pub async fn in_flight(&self) -> Vec<String> {
        self.active.lock().await.keys().cloned().collect()
    }

    /// Resolve, stream, verify and commit one package.
    ///
    /// `Ok(None)` means the transfer observed cancellation mid-stream.
    async fn run_transfer(
        &self,
        id: &ContentId,
        force: bool,
        tx: &watch::Sender<DownloadProgress>,
        cancel: &CancellationToken,
    ) -> Result<Option<ManifestEntry>> {
        let package = self.remote.fetch_package(id).await?;
        let meta = package.meta.clone();

        if let Some(local) = self.manifest.get(id).await {
            if meta.version < local.version {
                return Err(Error::VersionRegression {
                    content_id: id.clone(),
                    stored: local.version,
                    offered: meta.version,
                });
            }
            if meta.version == local.version && !force {
                // Already at this version; idempotent success.
                tx.send_replace(DownloadProgress::Started {
                    version: local.version,
                    size_in_bytes: local.size_in_bytes,
                });
                return Ok(Some(local));
            }
        }

        tx.send_replace(DownloadProgress::Started {
            version: meta.version,
            size_in_bytes: meta.size_in_bytes,
        });
        let mut stream = package.stream;
        let mut bytes: Vec<u8> = Vec::with_capacity(meta.size_in_bytes as usize);
        let mut percent: u8 = 0;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            bytes.extend_from_slice(&chunk);

            let transferred = bytes.len() as u64;
            let now = if meta.size_in_bytes == 0 {
                100
            } else {
                ((transferred.saturating_mul(100) / meta.size_in_bytes).min(100)) as u8
            };
            if now > percent {
                percent = now;
                tx.send_replace(DownloadProgress::Transferring { percent });
            }
        }

        verify(&meta, &bytes)?;

        let entry = ManifestEntry {
            content_id: meta.content_id.clone(),
            title: meta.title.clone(),
            subject: meta.subject.clone(),
            version: meta.version,
            size_in_bytes: bytes.len() as u64,
            downloaded_at: Utc::now(),
        };
        self.manifest.commit(entry.clone(), bytes).await?;

        info!(content_id = %id, version = meta.version, size = entry.size_in_bytes,
              "download committed");
        tx.send_replace(DownloadProgress::Transferring { percent: 100 });
        Ok(Some(entry))
    }
}

/// Check the transferred bytes against the declared size and checksum.
fn verify(meta: &PackageMeta, bytes: &[u8]) -> Result<()> {
    if bytes.len() as u64 != meta.size_in_bytes {
        return Err(Error::Integrity(format!(
            "size mismatch for {}: declared {}, received {}",
            meta.content_id,
            meta.size_in_bytes,
            bytes.len()
        )));
    }
    if let Some(declared) = meta.checksum {
        let actual = crc32fast::hash(bytes);
        if actual != declared {
            return Err(Error::Integrity(format!(
                "checksum mismatch for {}: declared {declared:08x}, computed {actual:08x}",
                meta.content_id
            )));
        }
    }
    Ok(())
}

/// Wait for a progress stream's terminal event.
pub async fn wait_terminal(mut progress: ProgressStream) -> DownloadProgress {
    loop {
        let current = progress.borrow().clone();
        if current.is_terminal() {
            return current;
        }
        if progress.changed().await.is_err() {
            return progress.borrow().clone();
        }
    }
}
