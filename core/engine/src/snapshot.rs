//! Observer surface: immutable engine snapshots over a watch channel.
//!
//! Presentation layers subscribe instead of reaching into engine state;
//! the engine republishes after every state-changing operation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use satchel_common::ContentId;

use crate::manifest::ManifestEntry;
use crate::queue::SyncQueueItem;
use crate::stats::Stats;

/// Immutable view of the engine's state at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub manifest: Vec<ManifestEntry>,
    pub queue: Vec<SyncQueueItem>,
    /// Result of the last `check_for_updates`; recomputed only on demand.
    pub updates_available: HashMap<ContentId, bool>,
    pub stats: Stats,
    pub online: bool,
    pub is_syncing: bool,
}

impl EngineSnapshot {
    pub(crate) fn empty() -> Self {
        Self {
            manifest: Vec::new(),
            queue: Vec::new(),
            updates_available: HashMap::new(),
            stats: Stats::derive(&[], &[], None),
            online: false,
            is_syncing: false,
        }
    }
}
