//! Lane-owned store state.
//!
//! [`StoreCore`] holds everything a store instance mutates: the lifecycle
//! state, this device's journal and clock, the merged snapshot and merge
//! cursors, and the blob store. Only the lane thread ever touches it, so
//! none of it is behind a lock.

use crate::blob::BlobStore;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::events::{ChangeOrigin, EventBus, EventKind};
use crate::package::{FileStamp, Package, PackageInfo};
use crate::transaction::{MergeObserver, Transaction};
use folio_engine::{
    journal, Change, ChangeRecord, DeviceClock, DeviceId, Journal, Key, MergeCursors,
    MergeReport, Merger, Snapshot, SnapshotCache, Timestamp, Value, WallClock,
};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

type PanicPayload = Box<dyn Any + Send>;

/// Lifecycle of a store instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Unloaded = 0,
    Loaded = 1,
    Closed = 2,
    /// Terminal. Either `delete()` ran or the package vanished. Deleting a
    /// loaded store closes it first, so subscribers see `Closed` then
    /// `Deleted`.
    Deleted = 3,
}

impl Lifecycle {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Lifecycle::Loaded,
            2 => Lifecycle::Closed,
            3 => Lifecycle::Deleted,
            _ => Lifecycle::Unloaded,
        }
    }
}

/// Lifecycle state readable from outside the lane.
#[derive(Debug, Default)]
pub struct SharedState(AtomicU8);

impl SharedState {
    pub fn get(&self) -> Lifecycle {
        Lifecycle::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: Lifecycle) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Everything a folded load produces, assembled before any of it is
/// installed so a failed load exposes nothing.
struct LoadedState {
    journal: Journal,
    snapshot: Snapshot,
    cursors: MergeCursors,
    seen: BTreeMap<DeviceId, FileStamp>,
    from_cache: bool,
}

pub struct StoreCore {
    config: StoreConfig,
    package: Option<Package>,
    state: Lifecycle,
    shared: Arc<SharedState>,
    wall: Arc<dyn WallClock>,
    clock: DeviceClock,
    journal: Journal,
    snapshot: Snapshot,
    cursors: MergeCursors,
    /// Stamps of the foreign journal files as last folded
    seen: BTreeMap<DeviceId, FileStamp>,
    blobs: BlobStore,
    /// Journal has records not yet written to disk
    dirty: bool,
    /// Snapshot cache is behind the in-memory snapshot
    cache_dirty: bool,
    events: EventBus,
    observer: Option<Box<dyn MergeObserver>>,
}

impl StoreCore {
    pub(crate) fn new(
        config: StoreConfig,
        wall: Arc<dyn WallClock>,
        events: EventBus,
        shared: Arc<SharedState>,
    ) -> Self {
        let package = config
            .location()
            .map(|location| Package::new(location, config.fsync));
        let blobs = match &package {
            Some(package) => BlobStore::disk(package.clone()),
            None => BlobStore::memory(),
        };
        let device_id = config.device_id.clone();
        Self {
            package,
            state: Lifecycle::Unloaded,
            shared,
            wall,
            clock: DeviceClock::new(device_id.clone()),
            journal: Journal::new(device_id),
            snapshot: Snapshot::new(),
            cursors: MergeCursors::new(),
            seen: BTreeMap::new(),
            blobs,
            dirty: false,
            cache_dirty: false,
            events,
            observer: None,
            config,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.config.device_id
    }

    fn transition(&mut self, state: Lifecycle) {
        self.state = state;
        self.shared.set(state);
    }

    pub(crate) fn ensure_loaded(&self) -> Result<()> {
        match self.state {
            Lifecycle::Loaded => Ok(()),
            Lifecycle::Deleted => Err(StoreError::StoreDeleted),
            Lifecycle::Unloaded | Lifecycle::Closed => Err(StoreError::NotLoaded),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the package, creating it if absent, and fold every journal.
    ///
    /// Loading an already loaded store does nothing.
    pub fn load(&mut self) -> Result<()> {
        match self.state {
            Lifecycle::Loaded => return Ok(()),
            Lifecycle::Deleted => return Err(StoreError::StoreDeleted),
            Lifecycle::Unloaded | Lifecycle::Closed => {}
        }

        if let Some(package) = self.package.clone() {
            let loaded = self.read_package(&package)?;
            self.clock = DeviceClock::resume(
                self.config.device_id.clone(),
                loaded.cursors.max_timestamp().unwrap_or_default(),
            );
            self.journal = loaded.journal;
            self.snapshot = loaded.snapshot;
            self.cursors = loaded.cursors;
            self.seen = loaded.seen;
            self.dirty = false;
            self.cache_dirty = !loaded.from_cache;
            tracing::info!(
                path = %package.root().display(),
                device = %self.config.device_id,
                keys = self.snapshot.len(),
                from_cache = loaded.from_cache,
                "Loaded store"
            );
        } else {
            tracing::info!(device = %self.config.device_id, "Loaded in-memory store");
        }

        self.transition(Lifecycle::Loaded);
        self.events.publish(EventKind::Loaded);
        Ok(())
    }

    fn read_package(&self, package: &Package) -> Result<LoadedState> {
        let device = &self.config.device_id;

        if !package.exists() {
            package.create(device)?;
        } else if package.read_info()?.is_none() {
            // Older or partially synced package: adopt it
            package.write_info(&PackageInfo::new(device.clone()))?;
        }

        match package.sweep_temp_files(device) {
            Ok(0) => {}
            Ok(removed) => tracing::info!(device = %device, removed, "Swept stale temporary files"),
            Err(e) => tracing::warn!(device = %device, error = %e, "Could not sweep temporary files"),
        }

        let journal = package
            .read_journal(device)?
            .unwrap_or_else(|| Journal::new(device.clone()));

        let cached = if self.config.snapshot_cache {
            package
                .read_snapshot_cache(device)
                .filter(|cache| cache_matches_journal(cache, &journal))
        } else {
            None
        };
        let from_cache = cached.is_some();
        let (mut snapshot, mut cursors) = cached
            .map(SnapshotCache::restore)
            .unwrap_or_default();

        let mut seen = BTreeMap::new();
        {
            let mut merger = Merger::new(&mut snapshot, &mut cursors);
            merger.fold_journal(&journal);
            fold_foreign(package, device, &mut merger, &mut seen)?;
        }

        Ok(LoadedState {
            journal,
            snapshot,
            cursors,
            seen,
            from_cache,
        })
    }

    /// Flush pending writes and stop serving reads. Idempotent.
    ///
    /// If the final flush fails the store stays loaded and the error is
    /// returned, so the caller can retry without losing writes.
    pub fn close(&mut self) -> Result<()> {
        if self.state != Lifecycle::Loaded {
            return Ok(());
        }
        self.save()?;

        if self.package.is_some() {
            // The package is the state; drop the in-memory copy
            self.snapshot = Snapshot::new();
            self.cursors = MergeCursors::new();
            self.journal = Journal::new(self.config.device_id.clone());
            self.seen.clear();
        }
        self.transition(Lifecycle::Closed);
        tracing::info!(device = %self.config.device_id, "Closed store");
        self.events.publish(EventKind::Closed);
        Ok(())
    }

    /// Remove the package from disk. Every later operation except `close`
    /// fails with `StoreDeleted`.
    pub fn delete(&mut self) -> Result<()> {
        if self.state == Lifecycle::Deleted {
            return Err(StoreError::StoreDeleted);
        }
        if let Some(package) = &self.package {
            package.remove()?;
            tracing::info!(path = %package.root().display(), "Deleted package");
        }
        self.mark_deleted();
        Ok(())
    }

    fn mark_deleted(&mut self) {
        if self.state == Lifecycle::Deleted {
            return;
        }
        self.snapshot = Snapshot::new();
        self.cursors = MergeCursors::new();
        self.journal = Journal::new(self.config.device_id.clone());
        self.seen.clear();
        self.dirty = false;
        self.cache_dirty = false;
        let was_loaded = self.state == Lifecycle::Loaded;
        self.transition(Lifecycle::Deleted);
        if was_loaded {
            self.events.publish(EventKind::Closed);
        }
        self.events.publish(EventKind::Deleted);
    }

    /// Flush on lane shutdown.
    pub(crate) fn shutdown(&mut self) {
        if self.state == Lifecycle::Loaded {
            if let Err(e) = self.save() {
                tracing::error!(device = %self.config.device_id, error = %e, "Final flush failed");
            }
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_loaded()?;
        Ok(self.snapshot.get(key).cloned())
    }

    pub fn all_values(&self) -> Result<BTreeMap<Key, Value>> {
        self.ensure_loaded()?;
        Ok(self
            .snapshot
            .live_values()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Latest timestamp folded from `device_id`, this device included.
    pub fn most_recent_timestamp(&self, device_id: &str) -> Result<Option<Timestamp>> {
        self.ensure_loaded()?;
        Ok(self.cursors.most_recent(device_id))
    }

    pub fn most_recent_timestamps(&self) -> Result<BTreeMap<DeviceId, Timestamp>> {
        self.ensure_loaded()?;
        Ok(self.cursors.to_map())
    }

    /// Every record for `key` in every readable journal, in merge order.
    pub fn history(&self, key: &str) -> Result<Vec<ChangeRecord>> {
        self.ensure_loaded()?;
        let mut journals = vec![self.journal.clone()];
        if let Some(package) = &self.package {
            for device in package.list_journals()? {
                if device == self.config.device_id {
                    continue;
                }
                match package.read_journal(&device) {
                    Ok(Some(journal)) => journals.push(journal),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(device = %device, error = %e, "Skipping unreadable journal")
                    }
                }
            }
        }
        Ok(journal::history(key, &journals))
    }

    // =========================================================================
    // Local writes
    // =========================================================================

    /// Append one record per change and install them in the snapshot.
    ///
    /// Values are validated up front, so a batch either goes in whole or not
    /// at all. Does not publish; callers decide how to report the keys.
    pub(crate) fn apply_writes(&mut self, changes: Vec<(Key, Change)>) -> Result<BTreeSet<Key>> {
        self.ensure_loaded()?;
        for (_, change) in &changes {
            if let Change::Set(value) = change {
                value.validate()?;
            }
        }

        let now = self.wall.now_micros();
        let mut keys = BTreeSet::new();
        for (key, change) in changes {
            let timestamp = self.clock.tick(now);
            let record = ChangeRecord::new(key, change, timestamp, self.config.device_id.clone());
            self.journal.append(record.clone())?;
            self.snapshot.apply_local(&record);
            self.cursors.advance(&self.config.device_id, timestamp);
            keys.insert(record.key);
        }

        if !keys.is_empty() {
            self.dirty = true;
            self.cache_dirty = true;
        }
        Ok(keys)
    }

    /// Apply local changes and raise a `Changed` notification.
    pub fn write(&mut self, changes: Vec<(Key, Change)>) -> Result<()> {
        let keys = self.apply_writes(changes)?;
        self.publish_changed(keys, ChangeOrigin::Local);
        Ok(())
    }

    pub(crate) fn publish_changed(&self, keys: BTreeSet<Key>, origin: ChangeOrigin) {
        if !keys.is_empty() {
            self.events.publish(EventKind::Changed { keys, origin });
        }
    }

    /// Run `work` against a consistent view. Writes made before a failure
    /// stay in place and are reported, even when `work` panics.
    pub fn run_transaction<T>(
        &mut self,
        work: impl FnOnce(&mut Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        self.ensure_loaded()?;
        let mut tx = Transaction::new(self);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&mut tx)));
        let keys = tx.into_touched();
        self.publish_changed(keys, ChangeOrigin::Local);
        outcome.unwrap_or_else(|payload| panic::resume_unwind(payload))
    }

    // =========================================================================
    // Merging
    // =========================================================================

    /// Fold whatever is new in other devices' journals.
    pub fn merge(&mut self) -> Result<MergeReport> {
        self.ensure_loaded()?;
        let Some(package) = self.package.clone() else {
            self.events.publish(EventKind::Synced);
            return Ok(MergeReport::default());
        };
        if !package.exists() {
            tracing::warn!(path = %package.root().display(), "Package disappeared");
            self.mark_deleted();
            return Err(StoreError::StoreDeleted);
        }

        let report = {
            let mut merger = Merger::new(&mut self.snapshot, &mut self.cursors);
            fold_foreign(&package, &self.config.device_id, &mut merger, &mut self.seen)?;
            merger.finish()
        };

        if let Some(max) = report.max_timestamp {
            self.clock.observe(max);
        }
        tracing::debug!(
            device = %self.config.device_id,
            records = report.records_folded,
            changed = report.changed.len(),
            "Merge pass"
        );

        let mut observer_panic = None;
        if !report.is_empty() {
            self.cache_dirty = true;
            let mut keys = report.changed.clone();
            let (touched, panicked) = self.notify_observer(&report);
            keys.extend(touched);
            observer_panic = panicked;
            self.publish_changed(keys, ChangeOrigin::Sync);
        }
        self.events.publish(EventKind::Synced);

        // The pass is folded and reported; only now surface the observer's panic
        if let Some(payload) = observer_panic {
            panic::resume_unwind(payload);
        }
        Ok(report)
    }

    /// Hand the pass to the observer. Returns the keys it wrote and, if it
    /// panicked, the panic payload. The observer stays installed either way.
    fn notify_observer(&mut self, report: &MergeReport) -> (BTreeSet<Key>, Option<PanicPayload>) {
        let Some(mut observer) = self.observer.take() else {
            return (BTreeSet::new(), None);
        };
        let changes = report.changes(&self.snapshot);
        let (touched, outcome) = {
            let mut tx = Transaction::new(self);
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| observer.merged(&changes, &mut tx)));
            (tx.into_touched(), outcome)
        };
        if outcome.is_err() {
            tracing::error!(device = %self.config.device_id, "Merge observer panicked");
        }
        // A replacement installed from inside the callback takes precedence
        if self.observer.is_none() {
            self.observer = Some(observer);
        }
        (touched, outcome.err())
    }

    pub(crate) fn set_observer(&mut self, observer: Option<Box<dyn MergeObserver>>) {
        self.observer = observer;
    }

    /// Merge, then persist the local journal.
    pub fn sync(&mut self) -> Result<MergeReport> {
        let report = self.merge()?;
        self.save()?;
        Ok(report)
    }

    /// The watcher reported that the package may have changed.
    pub fn package_changed(&mut self) -> Result<()> {
        if self.state != Lifecycle::Loaded {
            return Ok(());
        }
        match self.merge() {
            Ok(_) => Ok(()),
            // Already reported through the Deleted notification
            Err(StoreError::StoreDeleted) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Write the journal, and the snapshot cache if enabled, when behind.
    pub fn save(&mut self) -> Result<()> {
        if self.state == Lifecycle::Deleted {
            return Err(StoreError::StoreDeleted);
        }
        let Some(package) = self.package.clone() else {
            self.dirty = false;
            self.cache_dirty = false;
            return Ok(());
        };
        if !(self.dirty || self.cache_dirty) {
            return Ok(());
        }
        if !package.exists() {
            self.mark_deleted();
            return Err(StoreError::StoreDeleted);
        }

        if self.dirty {
            package.write_journal(&self.journal)?;
            self.dirty = false;
            tracing::debug!(
                device = %self.config.device_id,
                records = self.journal.len(),
                "Flushed journal"
            );
        }

        if self.cache_dirty {
            if self.config.snapshot_cache {
                let cache =
                    SnapshotCache::capture(self.config.device_id.clone(), &self.snapshot, &self.cursors);
                if let Err(e) = package.write_snapshot_cache(&cache) {
                    tracing::warn!(device = %self.config.device_id, error = %e, "Snapshot cache not written");
                    return Ok(());
                }
            }
            self.cache_dirty = false;
        }
        Ok(())
    }

    /// Background flush; failures stay dirty and are retried.
    pub(crate) fn flush_when_idle(&mut self) {
        if self.state != Lifecycle::Loaded || !(self.dirty || self.cache_dirty) {
            return;
        }
        if let Err(e) = self.save() {
            tracing::error!(device = %self.config.device_id, error = %e, "Background flush failed");
        }
    }

    // =========================================================================
    // Blobs
    // =========================================================================

    pub fn write_blob(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.ensure_loaded()?;
        self.blobs.write(path, data)
    }

    pub fn write_blob_from_path(&mut self, source: &Path, path: &str) -> Result<()> {
        self.ensure_loaded()?;
        self.blobs.write_from_path(source, path)
    }

    pub fn read_blob(&self, path: &str) -> Result<Vec<u8>> {
        self.ensure_loaded()?;
        self.blobs.read(path)
    }

    pub fn delete_blob(&mut self, path: &str) -> Result<()> {
        self.ensure_loaded()?;
        self.blobs.delete(path)
    }
}

/// A cache is usable only if it has not folded more of this device's
/// journal than the journal holds.
fn cache_matches_journal(cache: &SnapshotCache, journal: &Journal) -> bool {
    let own_cursor = cache.cursors.get(journal.device_id());
    let journal_last = journal.last_timestamp().unwrap_or_default();
    if own_cursor > journal_last {
        tracing::warn!(
            device = %journal.device_id(),
            cursor = own_cursor,
            journal_last,
            "Discarding snapshot cache ahead of journal"
        );
        return false;
    }
    true
}

/// Fold every foreign journal that changed on disk since it was last folded.
///
/// A journal that cannot be read, typically because the sync transport is
/// still writing it, is skipped with a warning; its cursor and stamp stay
/// put so the next pass retries it.
fn fold_foreign(
    package: &Package,
    own_device: &str,
    merger: &mut Merger<'_>,
    seen: &mut BTreeMap<DeviceId, FileStamp>,
) -> Result<()> {
    for device in package.list_journals()? {
        if device == own_device {
            continue;
        }

        let stamp = match package.journal_stamp(&device) {
            Ok(Some(stamp)) => stamp,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(device = %device, error = %e, "Cannot stat journal");
                continue;
            }
        };
        if seen.get(&device) == Some(&stamp) {
            continue;
        }

        match package.read_journal(&device) {
            Ok(Some(journal)) => {
                let folded = merger.fold_journal(&journal);
                tracing::trace!(device = %device, records = folded, "Folded journal");
                seen.insert(device, stamp);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(device = %device, error = %e, "Journal not readable yet, will retry");
            }
        }
    }
    Ok(())
}
