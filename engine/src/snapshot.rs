//! Snapshot types for persisting and restoring local store state.
//!
//! A snapshot is the on-disk form of [`crate::MemoryStore`]: the sync queue
//! plus the entity cache, serialized deterministically as JSON.

use crate::{error::Result, CachedEntity, Error, QueuedOperation, SyncStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time copy of both local tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Sync queue rows, oldest first
    pub queue: Vec<QueuedOperation>,
    /// Cache rows keyed by `entityType:entityId`.
    /// BTreeMap keeps the serialized order stable.
    pub cache: BTreeMap<String, CachedEntity>,
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            queue: Vec::new(),
            cache: BTreeMap::new(),
        }
    }

    pub fn add_operation(&mut self, op: QueuedOperation) {
        self.queue.push(op);
    }

    pub fn add_cached(&mut self, entity: CachedEntity) {
        self.cache.insert(entity.key(), entity);
    }

    /// Reset operations left `syncing` by a pass that never finished.
    ///
    /// A snapshot is only ever loaded at startup, so nothing can legitimately
    /// be mid-flight. Returns how many rows were reset.
    pub fn recover_interrupted(&mut self) -> usize {
        let mut recovered = 0;
        for op in self
            .queue
            .iter_mut()
            .filter(|op| op.status == SyncStatus::Syncing)
        {
            op.status = SyncStatus::Pending;
            recovered += 1;
        }
        recovered
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for op in &self.queue {
            if !seen.insert(op.id.as_str()) {
                return Err(Error::InvalidSnapshot(format!(
                    "duplicate operation id: {}",
                    op.id
                )));
            }
        }

        for (key, entity) in &self.cache {
            if *key != entity.key() {
                return Err(Error::InvalidSnapshot(format!(
                    "cache key '{}' does not match entity '{}'",
                    key,
                    entity.key()
                )));
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        // Validate format version
        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        snapshot.validate()?;
        Ok(snapshot)
    }
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self::new()
    }
}
