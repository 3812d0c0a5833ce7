//! Merging journals into the snapshot.
//!
//! This is the core of convergence. Given the snapshot, the merge cursors
//! and any set of device journals, a merge pass produces the same winners on
//! every replica, whatever order the journals are folded in.
//!
//! # Algorithm
//!
//! 1. For each journal, take the records after that device's cursor
//! 2. Fold each record into the snapshot under the last-writer-wins rule
//!    (higher timestamp wins, ties go to the greater device id)
//! 3. Advance the device's cursor to its journal's last timestamp
//! 4. Report which keys got a new winner
//!
//! Journals are only read. Re-running a pass over the same journals folds
//! nothing and reports no change.

use crate::journal::Journal;
use crate::snapshot::{MergeCursors, Snapshot, SnapshotEntry};
use crate::{DeviceId, Key, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A key whose winner changed during a merge pass, with the new winner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedChange {
    pub key: Key,
    pub entry: SnapshotEntry,
}

/// Outcome of a merge pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    /// Keys whose winning entry changed
    pub changed: BTreeSet<Key>,
    /// Records read past the cursors, winners or not
    pub records_folded: usize,
    /// Devices that contributed at least one new record
    pub devices: Vec<DeviceId>,
    /// Newest timestamp folded in this pass
    pub max_timestamp: Option<Timestamp>,
}

impl MergeReport {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    /// The new winners, read back from the snapshot the pass was run on.
    pub fn changes(&self, snapshot: &Snapshot) -> Vec<MergedChange> {
        self.changed
            .iter()
            .filter_map(|key| {
                snapshot.entry(key).map(|entry| MergedChange {
                    key: key.clone(),
                    entry: entry.clone(),
                })
            })
            .collect()
    }
}

/// Folds journals into a snapshot, one pass at a time.
pub struct Merger<'a> {
    snapshot: &'a mut Snapshot,
    cursors: &'a mut MergeCursors,
    report: MergeReport,
}

impl<'a> Merger<'a> {
    pub fn new(snapshot: &'a mut Snapshot, cursors: &'a mut MergeCursors) -> Self {
        Self {
            snapshot,
            cursors,
            report: MergeReport::default(),
        }
    }

    /// Fold the part of `journal` past its device's cursor.
    ///
    /// Returns the number of records read. A journal never seen before has
    /// its cursor in the distant past and is folded in full.
    pub fn fold_journal(&mut self, journal: &Journal) -> usize {
        let device = journal.device_id();
        let pending = journal.entries_after(self.cursors.get(device));
        let Some(last) = pending.last() else {
            return 0;
        };

        for record in pending {
            if self.snapshot.apply(record) {
                self.report.changed.insert(record.key.clone());
            }
        }

        self.cursors.advance(device, last.timestamp);
        self.report.records_folded += pending.len();
        self.report.devices.push(device.clone());
        self.report.max_timestamp = self.report.max_timestamp.max(Some(last.timestamp));
        pending.len()
    }

    /// Fold several journals.
    pub fn fold_all<'j>(&mut self, journals: impl IntoIterator<Item = &'j Journal>) -> usize {
        journals.into_iter().map(|j| self.fold_journal(j)).sum()
    }

    pub fn finish(self) -> MergeReport {
        self.report
    }
}

/// Build a snapshot from nothing by folding every journal.
pub fn rebuild<'j>(journals: impl IntoIterator<Item = &'j Journal>) -> (Snapshot, MergeCursors) {
    let mut snapshot = Snapshot::new();
    let mut cursors = MergeCursors::new();
    Merger::new(&mut snapshot, &mut cursors).fold_all(journals);
    (snapshot, cursors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChangeRecord, Value};

    fn journal(device: &str, records: &[(&str, Option<i64>, Timestamp)]) -> Journal {
        let mut journal = Journal::new(device);
        for (key, value, ts) in records {
            let record = match value {
                Some(v) => ChangeRecord::set(*key, *v, *ts, device),
                None => ChangeRecord::tombstone(*key, *ts, device),
            };
            journal.append(record).unwrap();
        }
        journal
    }

    #[test]
    fn fold_new_journal_in_full() {
        let dev2 = journal("dev2", &[("a", Some(1), 10), ("b", Some(2), 20)]);
        let mut snapshot = Snapshot::new();
        let mut cursors = MergeCursors::new();

        let mut merger = Merger::new(&mut snapshot, &mut cursors);
        assert_eq!(merger.fold_journal(&dev2), 2);
        let report = merger.finish();

        assert_eq!(report.records_folded, 2);
        assert_eq!(report.changed.len(), 2);
        assert_eq!(report.devices, vec!["dev2".to_string()]);
        assert_eq!(report.max_timestamp, Some(20));
        assert_eq!(cursors.get("dev2"), 20);
        assert_eq!(snapshot.get("b"), Some(&Value::Int(2)));
    }

    #[test]
    fn fold_resumes_from_cursor() {
        let mut dev2 = journal("dev2", &[("a", Some(1), 10)]);
        let mut snapshot = Snapshot::new();
        let mut cursors = MergeCursors::new();
        Merger::new(&mut snapshot, &mut cursors).fold_journal(&dev2);

        dev2.append(ChangeRecord::set("a", 5i64, 30, "dev2")).unwrap();
        let mut merger = Merger::new(&mut snapshot, &mut cursors);
        assert_eq!(merger.fold_journal(&dev2), 1);
        assert_eq!(snapshot.get("a"), Some(&Value::Int(5)));
    }

    #[test]
    fn rerun_is_idempotent() {
        let dev1 = journal("dev1", &[("a", Some(1), 10)]);
        let dev2 = journal("dev2", &[("a", Some(2), 20), ("b", None, 25)]);
        let (mut snapshot, mut cursors) = rebuild([&dev1, &dev2]);
        let before = (snapshot.clone(), cursors.clone());

        let report = {
            let mut merger = Merger::new(&mut snapshot, &mut cursors);
            merger.fold_all([&dev1, &dev2]);
            merger.finish()
        };

        assert!(report.is_empty());
        assert_eq!(report.records_folded, 0);
        assert_eq!((snapshot, cursors), before);
    }

    #[test]
    fn losing_records_still_advance_cursor() {
        let dev1 = journal("dev1", &[("a", Some(1), 100)]);
        let dev2 = journal("dev2", &[("a", Some(2), 50)]);
        let mut snapshot = Snapshot::new();
        let mut cursors = MergeCursors::new();
        let report = {
            let mut merger = Merger::new(&mut snapshot, &mut cursors);
            merger.fold_all([&dev1, &dev2]);
            merger.finish()
        };

        assert_eq!(snapshot.get("a"), Some(&Value::Int(1)));
        assert_eq!(cursors.get("dev2"), 50);
        assert_eq!(report.records_folded, 2);
    }

    #[test]
    fn tie_goes_to_greater_device_in_either_order() {
        let dev1 = journal("dev1", &[("name", Some(1), 10)]);
        let dev2 = journal("dev2", &[("name", Some(2), 10)]);

        let (forward, _) = rebuild([&dev1, &dev2]);
        let (backward, _) = rebuild([&dev2, &dev1]);

        assert_eq!(forward.get("name"), Some(&Value::Int(2)));
        assert_eq!(forward, backward);
    }

    #[test]
    fn tombstone_competes_like_a_value() {
        let dev1 = journal("dev1", &[("x", Some(1), 10), ("x", None, 30)]);
        let dev2 = journal("dev2", &[("x", Some(2), 20)]);
        let (snapshot, _) = rebuild([&dev1, &dev2]);
        assert_eq!(snapshot.get("x"), None);

        let dev3 = journal("dev3", &[("x", Some(3), 40)]);
        let (snapshot, _) = rebuild([&dev1, &dev2, &dev3]);
        assert_eq!(snapshot.get("x"), Some(&Value::Int(3)));
    }

    #[test]
    fn report_changes_reads_winners() {
        let dev2 = journal("dev2", &[("a", Some(1), 10), ("b", None, 11)]);
        let mut snapshot = Snapshot::new();
        let mut cursors = MergeCursors::new();
        let report = {
            let mut merger = Merger::new(&mut snapshot, &mut cursors);
            merger.fold_journal(&dev2);
            merger.finish()
        };

        let changes = report.changes(&snapshot);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].key, "a");
        assert_eq!(changes[0].entry.value(), Some(&Value::Int(1)));
        assert!(changes[1].entry.change.is_tombstone());
    }

    #[test]
    fn empty_journal_is_skipped() {
        let empty = Journal::new("dev3");
        let mut snapshot = Snapshot::new();
        let mut cursors = MergeCursors::new();
        let mut merger = Merger::new(&mut snapshot, &mut cursors);
        assert_eq!(merger.fold_journal(&empty), 0);
        assert!(merger.finish().devices.is_empty());
        assert!(!cursors.contains("dev3"));
    }
}
