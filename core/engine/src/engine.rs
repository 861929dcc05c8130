//! Sync engine: drains the mutation queue, checks for content updates and
//! exposes the engine's command/query surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use satchel_common::{ContentId, Error, Result};
use satchel_storage::BlobStore;

use crate::download::{DownloadManager, ProgressStream};
use crate::manifest::{ManifestEntry, ManifestStore};
use crate::monitor::NetworkMonitor;
use crate::queue::{MutationKind, QueueStatus, SyncQueue, SyncQueueItem};
use crate::remote::{RemoteContent, SubmitOutcome};
use crate::retry::RetryConfig;
use crate::snapshot::EngineSnapshot;
use crate::stats::Stats;

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retry/backoff policy and delivery ceiling for queued mutations.
    pub retry: RetryConfig,
    /// Concurrency cap for package downloads.
    pub concurrent_downloads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            concurrent_downloads: 3,
        }
    }
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainOutcome {
    /// Every eligible item was delivered; nothing left pending.
    Completed,
    /// The drain ran but items remain retrying or conflicted.
    Partial,
    /// Offline; nothing was attempted, no remote calls made.
    Offline,
    /// Another drain was already running; nothing was attempted.
    AlreadyRunning,
    /// Cancelled between items; queue left valid and resumable.
    Cancelled,
}

/// Structured result of one drain, so callers can render partial success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub outcome: DrainOutcome,
    pub succeeded: usize,
    pub retrying: usize,
    pub conflicted: usize,
    pub failed_terminal: usize,
    /// Terminal failures by item id, with the reason.
    pub failures: Vec<(Uuid, String)>,
}

impl SyncReport {
    fn skipped(outcome: DrainOutcome) -> Self {
        Self {
            outcome,
            succeeded: 0,
            retrying: 0,
            conflicted: 0,
            failed_terminal: 0,
            failures: Vec::new(),
        }
    }
}

/// Explicit resolution for a mutation held in the conflict sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveAction {
    /// Re-deliver against the new remote state.
    Retry,
    /// Drop the mutation.
    Discard,
}

/// Orchestrates the manifest store, download manager, sync queue and
/// network monitor behind a single command/query surface.
///
/// The manifest and queue are exclusively owned by the engine; callers
/// never mutate them directly.
pub struct SyncEngine {
    remote: Arc<dyn RemoteContent>,
    manifest: Arc<ManifestStore>,
    queue: Arc<SyncQueue>,
    downloads: Arc<DownloadManager>,
    monitor: Arc<dyn NetworkMonitor>,
    config: EngineConfig,
    /// Global mutual exclusion: only one drain at a time.
    drain_lock: Mutex<()>,
    syncing: AtomicBool,
    drain_cancel: RwLock<CancellationToken>,
    last_sync_time: RwLock<Option<DateTime<Utc>>>,
    updates_available: RwLock<HashMap<ContentId, bool>>,
    snapshot_tx: watch::Sender<EngineSnapshot>,
}

impl SyncEngine {
    /// Open the engine over a blob store, loading persisted manifest and
    /// queue state.
    pub async fn open(
        store: Arc<dyn BlobStore>,
        remote: Arc<dyn RemoteContent>,
        monitor: Arc<dyn NetworkMonitor>,
        config: EngineConfig,
    ) -> Result<Arc<Self>> {
        let manifest = Arc::new(ManifestStore::open(store.clone()).await?);
        let queue = Arc::new(SyncQueue::open(store).await?);
        let downloads = DownloadManager::new(
            remote.clone(),
            manifest.clone(),
            config.concurrent_downloads,
        );
        let (snapshot_tx, _) = watch::channel(EngineSnapshot::empty());

        let engine = Arc::new(Self {
            remote,
            manifest,
            queue,
            downloads,
            monitor,
            config,
            drain_lock: Mutex::new(()),
            syncing: AtomicBool::new(false),
            drain_cancel: RwLock::new(CancellationToken::new()),
            last_sync_time: RwLock::new(None),
            updates_available: RwLock::new(HashMap::new()),
            snapshot_tx,
        });
        engine.publish_snapshot().await;
        Ok(engine)
    }

    // ---- query surface ----

    pub async fn manifest_snapshot(&self) -> Vec<ManifestEntry> {
        self.manifest.list().await
    }

    pub async fn queue_snapshot(&self) -> Vec<SyncQueueItem> {
        self.queue.items().await
    }

    pub async fn updates_available(&self) -> HashMap<ContentId, bool> {
        self.updates_available.read().await.clone()
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> Stats {
        Stats::derive(
            &self.manifest.list().await,
            &self.queue.items().await,
            *self.last_sync_time.read().await,
        )
    }

    /// Read the locally stored package bytes for a downloaded item.
    pub async fn read_package(&self, id: &ContentId) -> Result<Option<Vec<u8>>> {
        self.manifest.read_package(id).await
    }

    /// Subscribe to live engine snapshots.
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot_tx.subscribe()
    }

    // ---- command surface ----

    /// Start (or attach to) a download; see [`DownloadManager::download`].
    pub async fn download_content(self: &Arc<Self>, id: &ContentId, force: bool) -> ProgressStream {
        let progress = self.downloads.download(id, force).await;

        // Republish once the transfer settles so observers see the result.
        let engine = self.clone();
        let mut watcher = progress.clone();
        tokio::spawn(async move {
            loop {
                if watcher.borrow().is_terminal() {
                    break;
                }
                if watcher.changed().await.is_err() {
                    break;
                }
            }
            engine.publish_snapshot().await;
        });

        progress
    }

    /// Cancel an in-flight download.
    pub async fn cancel_download(&self, id: &ContentId) -> bool {
        self.downloads.cancel(id).await
    }

    /// Remove downloaded content: metadata and package blob together.
    /// Removing an absent id returns `Ok(false)`.
    pub async fn remove_content(&self, id: &ContentId) -> Result<bool> {
        let removed = self.manifest.remove(id).await?;
        if removed {
            self.updates_available.write().await.remove(id);
            self.publish_snapshot().await;
        }
        Ok(removed)
    }

    /// Record a local mutation. Always succeeds locally; never blocks on
    /// network state.
    pub async fn enqueue_mutation(
        &self,
        content_id: ContentId,
        kind: MutationKind,
        payload: serde_json::Value,
    ) -> Result<Uuid> {
        let id = self.queue.enqueue(content_id, kind, payload).await?;
        self.publish_snapshot().await;
        Ok(id)
    }

    /// Compare local versions against the server in one batched call.
    ///
    /// Ids the server no longer lists are reported `false` (conservative).
    /// A transport failure fails the whole check and leaves the cached
    /// map untouched; partial results are never cached as authoritative.
    pub async fn check_for_updates(&self) -> Result<HashMap<ContentId, bool>> {
        let entries = self.manifest.list().await;
        let ids: Vec<ContentId> = entries.iter().map(|e| e.content_id.clone()).collect();

        let remote_versions = if ids.is_empty() {
            HashMap::new()
        } else {
            self.remote.fetch_current_versions(&ids).await?
        };

        let map: HashMap<ContentId, bool> = entries
            .iter()
            .map(|entry| {
                let newer = remote_versions
                    .get(&entry.content_id)
                    .is_some_and(|remote| *remote > entry.version);
                (entry.content_id.clone(), newer)
            })
            .collect();

        debug!(
            updatable = map.values().filter(|v| **v).count(),
            checked = map.len(),
            "update check complete"
        );
        *self.updates_available.write().await = map.clone();
        self.publish_snapshot().await;
        Ok(map)
    }

    /// Cancel a running drain between items.
    pub async fn cancel_sync(&self) {
        self.drain_cancel.read().await.cancel();
    }

    /// Drain the sync queue in creation order.
    ///
    /// A concurrent call while a drain is running is a no-op reporting
    /// `AlreadyRunning`; an offline call is a no-op reporting `Offline`
    /// with zero remote calls. Per-content ordering is preserved: when an
    /// item fails retryably or conflicts, later items for the same
    /// content id are not attempted this drain, while independent ids
    /// continue.
    pub async fn sync_pending_changes(&self) -> Result<SyncReport> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("drain already in progress");
            return Ok(SyncReport::skipped(DrainOutcome::AlreadyRunning));
        };

        if !self.monitor.is_online() {
            debug!("offline, skipping drain");
            return Ok(SyncReport::skipped(DrainOutcome::Offline));
        }

        let cancel = CancellationToken::new();
        *self.drain_cancel.write().await = cancel.clone();
        self.syncing.store(true, Ordering::SeqCst);
        self.publish_snapshot().await;

        let result = self.drain(&cancel).await;

        self.syncing.store(false, Ordering::SeqCst);
        self.publish_snapshot().await;
        result
    }

    async fn drain(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let mut report = SyncReport::skipped(DrainOutcome::Completed);
        let now = Utc::now();
        let items = self.queue.pending().await;
        info!(pending = items.len(), "drain started");

        // Ids blocked for the rest of this drain: an earlier item failed
        // retryably or is still inside its backoff window.
        let mut blocked: HashSet<String> = HashSet::new();
        // Ids whose chain was moved to the conflict sub-state.
        let mut conflict_held: HashSet<String> = HashSet::new();
        let mut cancelled = false;

        for item in items {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let cid = item.content_id.as_str().to_string();
            if conflict_held.contains(&cid) {
                continue;
            }
            if blocked.contains(&cid) || self.in_backoff(&item, now) {
                blocked.insert(cid);
                report.retrying += 1;
                continue;
            }

            // The item may have been resolved/discarded since the snapshot.
            let marked = self
                .queue
                .update(item.id, |i| {
                    i.status = QueueStatus::InFlight;
                    i.attempt_count += 1;
                    i.last_attempt_at = Some(Utc::now());
                })
                .await?;
            if !marked {
                continue;
            }
            let attempt = item.attempt_count + 1;

            match self.remote.submit_mutation(&item).await {
                Ok(SubmitOutcome::Ack) => {
                    self.queue.remove(item.id).await?;
                    report.succeeded += 1;
                }
                Ok(SubmitOutcome::Conflict(reason)) => {
                    warn!(item = %item.id, content_id = %item.content_id, %reason,
                          "mutation conflicted; held for resolution");
                    report.conflicted += 1 + self.hold_conflict_chain(&item, &reason).await?;
                    conflict_held.insert(cid);
                }
                Ok(SubmitOutcome::Invalid(reason)) => {
                    warn!(item = %item.id, %reason, "mutation rejected as invalid");
                    self.queue
                        .update(item.id, |i| {
                            i.status = QueueStatus::FailedTerminal;
                            i.last_error = Some(reason.clone());
                        })
                        .await?;
                    report.failed_terminal += 1;
                    report.failures.push((item.id, reason));
                }
                Err(e) if e.is_retryable() => {
                    let reason = e.to_string();
                    if attempt >= self.config.retry.max_attempts {
                        warn!(item = %item.id, attempts = attempt, %reason,
                              "retry ceiling reached; mutation is terminal");
                        self.queue
                            .update(item.id, |i| {
                                i.status = QueueStatus::FailedTerminal;
                                i.last_error = Some(reason.clone());
                            })
                            .await?;
                        report.failed_terminal += 1;
                        report.failures.push((item.id, reason));
                    } else {
                        debug!(item = %item.id, attempts = attempt, %reason,
                               "retryable failure; backing off");
                        self.queue
                            .update(item.id, |i| {
                                i.status = QueueStatus::Pending;
                                i.last_error = Some(reason);
                            })
                            .await?;
                        report.retrying += 1;
                    }
                    // Preserve per-content ordering either way.
                    blocked.insert(cid);
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.queue
                        .update(item.id, |i| {
                            i.status = QueueStatus::FailedTerminal;
                            i.last_error = Some(reason.clone());
                        })
                        .await?;
                    report.failed_terminal += 1;
                    report.failures.push((item.id, reason));
                }
            }
        }

        report.outcome = if cancelled {
            DrainOutcome::Cancelled
        } else if report.retrying == 0 && report.conflicted == 0 {
            DrainOutcome::Completed
        } else {
            DrainOutcome::Partial
        };

        if report.outcome == DrainOutcome::Completed {
            *self.last_sync_time.write().await = Some(Utc::now());
        }
        info!(
            outcome = ?report.outcome,
            succeeded = report.succeeded,
            retrying = report.retrying,
            conflicted = report.conflicted,
            failed_terminal = report.failed_terminal,
            "drain finished"
        );
        Ok(report)
    }

    fn in_backoff(&self, item: &SyncQueueItem, now: DateTime<Utc>) -> bool {
        if item.attempt_count == 0 {
            return false;
        }
        let Some(last) = item.last_attempt_at else {
            return false;
        };
        let delay = self.config.retry.delay_for_attempt(item.attempt_count);
        let ready_at = last + chrono::Duration::from_std(delay).unwrap_or_default();
        now < ready_at
    }

    /// Move later pending items for the conflicted item's content id into
    /// the conflict sub-state, preserving their order. No mutation is
    /// dropped and nothing is overwritten silently.
    async fn hold_conflict_chain(&self, item: &SyncQueueItem, reason: &str) -> Result<usize> {
        self.queue
            .update(item.id, |i| {
                i.status = QueueStatus::Conflict;
                i.last_error = Some(reason.to_string());
            })
            .await?;

        let mut held = 0;
        let later: Vec<Uuid> = self
            .queue
            .items()
            .await
            .iter()
            .filter(|i| {
                i.content_id == item.content_id
                    && i.id != item.id
                    && i.status == QueueStatus::Pending
                    && i.created_at >= item.created_at
            })
            .map(|i| i.id)
            .collect();
        for id in later {
            self.queue
                .update(id, |i| {
                    i.status = QueueStatus::Conflict;
                    i.last_error = Some(format!(
                        "held: earlier mutation for {} conflicted",
                        item.content_id
                    ));
                })
                .await?;
            held += 1;
        }
        Ok(held)
    }

    /// Explicitly resolve a mutation held in the conflict sub-state.
    ///
    /// Returns `Ok(false)` if the item no longer exists.
    pub async fn resolve_conflict(&self, id: Uuid, action: ResolveAction) -> Result<bool> {
        let Some(item) = self.queue.items().await.into_iter().find(|i| i.id == id) else {
            return Ok(false);
        };
        if item.status != QueueStatus::Conflict {
            return Err(Error::InvalidInput(format!(
                "mutation {id} is not in conflict"
            )));
        }

        match action {
            ResolveAction::Retry => {
                self.queue
                    .update(id, |i| {
                        i.status = QueueStatus::Pending;
                        i.attempt_count = 0;
                        i.last_attempt_at = None;
                        i.last_error = None;
                    })
                    .await?;
            }
            ResolveAction::Discard => {
                self.queue.remove(id).await?;
            }
        }
        self.publish_snapshot().await;
        Ok(true)
    }

    /// Explicitly discard a terminally failed mutation.
    pub async fn discard_mutation(&self, id: Uuid) -> Result<bool> {
        let Some(item) = self.queue.items().await.into_iter().find(|i| i.id == id) else {
            return Ok(false);
        };
        if !matches!(
            item.status,
            QueueStatus::FailedTerminal | QueueStatus::Conflict
        ) {
            return Err(Error::InvalidInput(format!(
                "mutation {id} is still active and cannot be discarded"
            )));
        }
        let removed = self.queue.remove(id).await?;
        self.publish_snapshot().await;
        Ok(removed)
    }

    /// Start the background task that drains the queue on each
    /// offline→online transition, exactly once per transition.
    pub fn spawn_autosync(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        let mut rx = self.monitor.watch();
        // Baseline is taken before the task is scheduled, so a transition
        // arriving in between is still observed.
        let mut was_online = *rx.borrow_and_update();
        tokio::spawn(async move {
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                let online = *rx.borrow_and_update();
                if online && !was_online {
                    info!("connectivity restored; draining sync queue");
                    if let Err(e) = engine.sync_pending_changes().await {
                        warn!(error = %e, "auto drain failed");
                    }
                }
                was_online = online;
            }
        })
    }

    async fn publish_snapshot(&self) {
        let manifest = self.manifest.list().await;
        let queue = self.queue.items().await;
        let stats = Stats::derive(&manifest, &queue, *self.last_sync_time.read().await);
        self.snapshot_tx.send_replace(EngineSnapshot {
            manifest,
            queue,
            updates_available: self.updates_available.read().await.clone(),
            stats,
            online: self.monitor.is_online(),
            is_syncing: self.is_syncing(),
        });
    }
}
