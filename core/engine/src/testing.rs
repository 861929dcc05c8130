//! Scriptable remote test double shared by the engine tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use satchel_common::{ContentId, Error, Result, Version};

use crate::queue::SyncQueueItem;
use crate::remote::{ByteStream, PackageDownload, PackageMeta, RemoteContent, SubmitOutcome};

/// Scripted response for one `submit_mutation` call.
#[derive(Debug, Clone)]
pub enum Scripted {
    Ack,
    Conflict(String),
    Invalid(String),
    Network(String),
}

struct MockPackage {
    meta: PackageMeta,
    bytes: Vec<u8>,
    /// Yield a network error after the first chunk.
    stream_error: bool,
    /// Sleep this long before each chunk, to keep transfers in flight.
    chunk_delay: Duration,
}

/// Scriptable in-memory remote.
///
/// Packages are published with `publish`; submit outcomes are scripted per
/// content id and consumed FIFO (an exhausted script acks). Every call is
/// journaled so tests can assert call counts and submission order.
pub struct MockRemote {
    packages: Mutex<HashMap<String, MockPackage>>,
    versions: Mutex<HashMap<ContentId, Version>>,
    submit_scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    submit_delay: Mutex<Duration>,
    fail_version_fetch: Mutex<bool>,
    pub chunk_size: usize,
    fetch_log: Mutex<Vec<ContentId>>,
    submit_log: Mutex<Vec<SyncQueueItem>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            packages: Mutex::new(HashMap::new()),
            versions: Mutex::new(HashMap::new()),
            submit_scripts: Mutex::new(HashMap::new()),
            submit_delay: Mutex::new(Duration::ZERO),
            fail_version_fetch: Mutex::new(false),
            chunk_size: 4,
            fetch_log: Mutex::new(Vec::new()),
            submit_log: Mutex::new(Vec::new()),
        }
    }

    /// Publish a package at a version, with correct declared size/checksum.
    pub fn publish(&self, id: &str, version: Version, bytes: Vec<u8>) {
        let content_id = ContentId::new(id).unwrap();
        let meta = PackageMeta {
            content_id: content_id.clone(),
            title: format!("Title {id}"),
            subject: "science".to_string(),
            version,
            size_in_bytes: bytes.len() as u64,
            checksum: Some(crc32fast::hash(&bytes)),
        };
        self.packages.lock().unwrap().insert(
            id.to_string(),
            MockPackage {
                meta,
                bytes,
                stream_error: false,
                chunk_delay: Duration::ZERO,
            },
        );
        self.versions.lock().unwrap().insert(content_id, version);
    }

    /// Advance only the advertised version, without changing the package.
    pub fn set_current_version(&self, id: &str, version: Version) {
        self.versions
            .lock()
            .unwrap()
            .insert(ContentId::new(id).unwrap(), version);
    }

    /// Remove an id from the version listing (deleted server-side).
    pub fn unlist(&self, id: &str) {
        self.versions
            .lock()
            .unwrap()
            .remove(&ContentId::new(id).unwrap());
    }

    /// Corrupt the declared transfer size of a published package.
    pub fn set_declared_size(&self, id: &str, size: u64) {
        self.packages
            .lock()
            .unwrap()
            .get_mut(id)
            .unwrap()
            .meta
            .size_in_bytes = size;
    }

    /// Corrupt the declared checksum of a published package.
    pub fn set_declared_checksum(&self, id: &str, checksum: u32) {
        self.packages
            .lock()
            .unwrap()
            .get_mut(id)
            .unwrap()
            .meta
            .checksum = Some(checksum);
    }

    /// Make the package's byte stream fail after its first chunk.
    pub fn set_stream_error(&self, id: &str) {
        self.packages
            .lock()
            .unwrap()
            .get_mut(id)
            .unwrap()
            .stream_error = true;
    }

    /// Slow the package stream down so a transfer stays in flight.
    pub fn set_chunk_delay(&self, id: &str, delay: Duration) {
        self.packages
            .lock()
            .unwrap()
            .get_mut(id)
            .unwrap()
            .chunk_delay = delay;
    }

    /// Slow every `submit_mutation` call down so a drain stays in flight.
    pub fn set_submit_delay(&self, delay: Duration) {
        *self.submit_delay.lock().unwrap() = delay;
    }

    /// Fail the next (and all further) `fetch_current_versions` calls.
    pub fn fail_version_fetch(&self, fail: bool) {
        *self.fail_version_fetch.lock().unwrap() = fail;
    }

    /// Queue scripted outcomes for submissions targeting one content id.
    pub fn script_submit(&self, id: &str, outcomes: Vec<Scripted>) {
        self.submit_scripts
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Number of package fetches performed.
    pub fn fetch_count(&self, id: &str) -> usize {
        self.fetch_log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == id)
            .count()
    }

    /// All submission attempts, in call order.
    pub fn submissions(&self) -> Vec<SyncQueueItem> {
        self.submit_log.lock().unwrap().clone()
    }

    /// Submission attempts for one content id, in call order.
    pub fn submissions_for(&self, id: &str) -> Vec<SyncQueueItem> {
        self.submit_log
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.content_id.as_str() == id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RemoteContent for MockRemote {
    async fn fetch_package(&self, id: &ContentId) -> Result<PackageDownload> {
        self.fetch_log.lock().unwrap().push(id.clone());

        let (meta, chunks) = {
            let packages = self.packages.lock().unwrap();
            let package = packages
                .get(id.as_str())
                .ok_or_else(|| Error::NotFound(format!("no such package: {id}")))?;

            let mut chunks: Vec<Result<Bytes>> = package
                .bytes
                .chunks(self.chunk_size.max(1))
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            if package.stream_error {
                chunks.truncate(1);
                chunks.push(Err(Error::Network("connection reset".to_string())));
            }
            let delay = package.chunk_delay;
            let chunks = chunks.into_iter().map(move |c| (c, delay));
            (package.meta.clone(), chunks.collect::<Vec<_>>())
        };

        let stream: ByteStream = Box::pin(futures::stream::iter(chunks).then(
            |(chunk, delay)| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                chunk
            },
        ));

        Ok(PackageDownload { meta, stream })
    }

    async fn fetch_current_versions(
        &self,
        ids: &[ContentId],
    ) -> Result<HashMap<ContentId, Version>> {
        if *self.fail_version_fetch.lock().unwrap() {
            return Err(Error::Network("version endpoint unreachable".to_string()));
        }
        let versions = self.versions.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| versions.get(id).map(|v| (id.clone(), *v)))
            .collect())
    }

    async fn submit_mutation(&self, item: &SyncQueueItem) -> Result<SubmitOutcome> {
        let delay = *self.submit_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.submit_log.lock().unwrap().push(item.clone());

        let scripted = self
            .submit_scripts
            .lock()
            .unwrap()
            .get_mut(item.content_id.as_str())
            .and_then(|q| q.pop_front());

        match scripted {
            None | Some(Scripted::Ack) => Ok(SubmitOutcome::Ack),
            Some(Scripted::Conflict(msg)) => Ok(SubmitOutcome::Conflict(msg)),
            Some(Scripted::Invalid(msg)) => Ok(SubmitOutcome::Invalid(msg)),
            Some(Scripted::Network(msg)) => Err(Error::Network(msg)),
        }
    }
}
