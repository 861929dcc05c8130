//! Satchel Offline Content Synchronization Engine
//!
//! This crate keeps learning content usable without connectivity:
//! - Manifest store: the local authoritative index of downloaded content
//! - Download manager: streaming fetch with progress, integrity checks and
//!   atomic commit
//! - Update checker: batched local-vs-remote version comparison
//! - Sync queue + sync engine: durable offline mutations drained in order
//!   with retry, backoff and explicit conflict surfacing
//! - Network monitor glue: auto-drain on reconnect
//! - Snapshot observer: live engine state for presentation layers

pub mod download;
pub mod engine;
pub mod manifest;
pub mod monitor;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod snapshot;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types
pub use download::{wait_terminal, DownloadManager, DownloadProgress, ProgressStream};
pub use engine::{DrainOutcome, EngineConfig, ResolveAction, SyncEngine, SyncReport};
pub use manifest::{ManifestEntry, ManifestStore};
pub use monitor::{NetworkMonitor, StaticMonitor, ToggleMonitor};
pub use queue::{MutationKind, QueueStatus, SyncQueue, SyncQueueItem};
pub use remote::{ByteStream, PackageDownload, PackageMeta, RemoteContent, SubmitOutcome};
pub use retry::RetryConfig;
pub use snapshot::EngineSnapshot;
pub use stats::Stats;
