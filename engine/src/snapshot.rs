//! The snapshot store and its persisted cache.
//!
//! A [`Snapshot`] is the merged view: for every key, the winning change
//! record. It is derived state, always rebuildable by folding every journal,
//! and is never the system of record. [`MergeCursors`] remember how far each
//! device's journal has been folded.
//!
//! [`SnapshotCache`] bundles both for persistence so a load does not have to
//! refold every journal from the beginning. It uses `BTreeMap`s so
//! serialization is deterministic.

use crate::clock::TIMESTAMP_DISTANT_PAST;
use crate::error::{Error, Result};
use crate::{Change, ChangeRecord, DeviceId, Key, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Version of the snapshot cache format.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// The currently winning change for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub change: Change,
    pub timestamp: Timestamp,
    pub device_id: DeviceId,
}

impl SnapshotEntry {
    pub fn value(&self) -> Option<&Value> {
        self.change.value()
    }
}

impl From<ChangeRecord> for SnapshotEntry {
    fn from(record: ChangeRecord) -> Self {
        Self {
            change: record.change,
            timestamp: record.timestamp,
            device_id: record.device_id,
        }
    }
}

/// Key → winning entry. Tombstones are kept so later folds can compare
/// against them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    entries: BTreeMap<Key, SnapshotEntry>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live value for a key; `None` if absent or deleted.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).and_then(SnapshotEntry::value)
    }

    /// The winning entry for a key, tombstones included.
    pub fn entry(&self, key: &str) -> Option<&SnapshotEntry> {
        self.entries.get(key)
    }

    /// All entries, tombstones included.
    pub fn entries(&self) -> impl Iterator<Item = (&Key, &SnapshotEntry)> {
        self.entries.iter()
    }

    /// Live key/value pairs in key order.
    pub fn live_values(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.entries
            .iter()
            .filter_map(|(k, e)| e.value().map(|v| (k, v)))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.live_values().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fold one record in under the last-writer-wins rule.
    ///
    /// Returns `true` if the record became the new winner for its key.
    pub fn apply(&mut self, record: &ChangeRecord) -> bool {
        let wins = match self.entries.get(&record.key) {
            None => true,
            Some(current) => {
                record.merge_order(current.timestamp, &current.device_id) == Ordering::Greater
            }
        };
        if wins {
            self.entries
                .insert(record.key.clone(), SnapshotEntry::from(record.clone()));
        }
        wins
    }

    /// Install a record written by this device, unconditionally.
    ///
    /// Local writes are visible immediately; they are reconciled once other
    /// devices fold them.
    pub fn apply_local(&mut self, record: &ChangeRecord) {
        self.entries
            .insert(record.key.clone(), SnapshotEntry::from(record.clone()));
    }
}

/// Per-device fold position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MergeCursors(BTreeMap<DeviceId, Timestamp>);

impl MergeCursors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cursor for a device; a device never seen is in the distant past.
    pub fn get(&self, device_id: &str) -> Timestamp {
        self.0
            .get(device_id)
            .copied()
            .unwrap_or(TIMESTAMP_DISTANT_PAST)
    }

    /// Cursor for a device, or `None` if nothing from it has been folded.
    pub fn most_recent(&self, device_id: &str) -> Option<Timestamp> {
        self.0.get(device_id).copied()
    }

    /// Move a device's cursor forward. Cursors never move backward.
    pub fn advance(&mut self, device_id: &str, to: Timestamp) {
        let cursor = self.0.entry(device_id.to_string()).or_insert(to);
        *cursor = (*cursor).max(to);
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.0.contains_key(device_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, &Timestamp)> {
        self.0.iter()
    }

    /// Highest cursor across all devices.
    pub fn max_timestamp(&self) -> Option<Timestamp> {
        self.0.values().copied().max()
    }

    pub fn to_map(&self) -> BTreeMap<DeviceId, Timestamp> {
        self.0.clone()
    }
}

/// Persisted form of a snapshot plus its cursors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotCache {
    /// Snapshot format version
    pub format_version: u32,
    /// Device that wrote the cache
    pub device_id: DeviceId,
    pub entries: BTreeMap<Key, SnapshotEntry>,
    pub cursors: MergeCursors,
}

impl SnapshotCache {
    /// Capture the current state.
    pub fn capture(device_id: impl Into<DeviceId>, snapshot: &Snapshot, cursors: &MergeCursors) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            device_id: device_id.into(),
            entries: snapshot.entries.clone(),
            cursors: cursors.clone(),
        }
    }

    /// Split back into a snapshot and cursors.
    pub fn restore(self) -> (Snapshot, MergeCursors) {
        (
            Snapshot {
                entries: self.entries,
            },
            self.cursors,
        )
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let cache: Self =
            serde_json::from_slice(bytes).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if cache.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                cache.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(cache)
    }
}
