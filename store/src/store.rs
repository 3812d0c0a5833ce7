//! The public store handle.

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::events::{EventBus, StoreEvent, StoreId};
use crate::lane::{Lane, Ticket};
use crate::state::{Lifecycle, SharedState, StoreCore};
use crate::transaction::{MergeObserver, Transaction};
use folio_engine::{
    Change, ChangeRecord, DeviceId, Key, MergeReport, SystemClock, Timestamp, Value, WallClock,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A key-value store backed by a file package.
///
/// All work runs on the store's serial lane. Almost every operation returns
/// a [`Ticket`] immediately: await it, block on it with [`Ticket::wait`], or
/// drop it to fire and forget. The `_now` methods
/// are blocking shorthands for threads outside an async runtime. A read runs
/// after every write submitted before it, so it always observes them.
///
/// Dropping the store flushes pending writes and stops the lane.
pub struct Store {
    id: StoreId,
    config: StoreConfig,
    shared: Arc<SharedState>,
    events: EventBus,
    lane: Lane,
}

impl Store {
    /// Open a store handle using the system clock. The package is not read
    /// until [`Store::load`].
    pub fn new(config: StoreConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Open a store handle with an injected wall clock.
    pub fn with_clock(config: StoreConfig, wall: Arc<dyn WallClock>) -> Result<Self> {
        config.validate()?;

        let id = Uuid::new_v4();
        let events = EventBus::new(id, config.event_capacity);
        let shared = Arc::new(SharedState::default());
        let core = StoreCore::new(config.clone(), wall, events.clone(), shared.clone());
        let lane = Lane::spawn(core).map_err(|e| {
            StoreError::io(config.location().unwrap_or(Path::new("")), e)
        })?;

        Ok(Self {
            id,
            config,
            shared,
            events,
            lane,
        })
    }

    /// A store that never touches disk.
    pub fn in_memory(device_id: impl Into<DeviceId>) -> Result<Self> {
        Self::new(StoreConfig::in_memory(device_id))
    }

    // =========================================================================
    // Information
    // =========================================================================

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn location(&self) -> Option<&Path> {
        self.config.location()
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.config.device_id
    }

    pub fn is_loaded(&self) -> bool {
        self.shared.get() == Lifecycle::Loaded
    }

    pub fn is_deleted(&self) -> bool {
        self.shared.get() == Lifecycle::Deleted
    }

    pub fn is_in_memory(&self) -> bool {
        self.config.location.is_none()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the package, creating it if absent.
    pub fn load(&self) -> Ticket<()> {
        self.lane.submit(|core| core.load())
    }

    pub fn load_now(&self) -> Result<()> {
        self.load().wait()
    }

    /// Flush pending writes and close. Runs after everything already queued.
    pub fn close(&self) -> Ticket<()> {
        self.lane.submit(|core| core.close())
    }

    pub fn close_now(&self) -> Result<()> {
        self.close().wait()
    }

    /// Remove the package directory.
    pub fn delete_store(&self) -> Ticket<()> {
        self.lane.submit(|core| core.delete())
    }

    // =========================================================================
    // Reads
    // =========================================================================
    //
    // Each read is queued behind every task submitted before it, so it sees
    // all earlier writes. The `_now` forms block the calling thread and must
    // not be used from inside an async runtime; await the ticket there.

    pub fn get(&self, key: &str) -> Ticket<Option<Value>> {
        let key = key.to_string();
        self.lane.submit(move |core| core.get(&key))
    }

    pub fn get_now(&self, key: &str) -> Result<Option<Value>> {
        self.get(key).wait()
    }

    pub fn all_values(&self) -> Ticket<BTreeMap<Key, Value>> {
        self.lane.submit(|core| core.all_values())
    }

    pub fn all_values_now(&self) -> Result<BTreeMap<Key, Value>> {
        self.all_values().wait()
    }

    /// Run a merge pass, then read.
    pub fn synced_value(&self, key: &str) -> Ticket<Option<Value>> {
        let key = key.to_string();
        self.lane.submit(move |core| {
            core.merge()?;
            core.get(&key)
        })
    }

    pub fn synced_value_now(&self, key: &str) -> Result<Option<Value>> {
        self.synced_value(key).wait()
    }

    pub fn most_recent_timestamp(&self, device_id: &str) -> Ticket<Option<Timestamp>> {
        let device_id = device_id.to_string();
        self.lane
            .submit(move |core| core.most_recent_timestamp(&device_id))
    }

    pub fn most_recent_timestamp_now(&self, device_id: &str) -> Result<Option<Timestamp>> {
        self.most_recent_timestamp(device_id).wait()
    }

    pub fn most_recent_timestamps_by_device(&self) -> Ticket<BTreeMap<DeviceId, Timestamp>> {
        self.lane.submit(|core| core.most_recent_timestamps())
    }

    pub fn most_recent_timestamps_by_device_now(&self) -> Result<BTreeMap<DeviceId, Timestamp>> {
        self.most_recent_timestamps_by_device().wait()
    }

    /// Every change to `key` recorded in this device's journal and in the
    /// foreign journals currently on disk, oldest first by merge order.
    ///
    /// Foreign records not yet folded by a merge pass are included, so the
    /// last entry is the winner the next merge pass will settle on, which
    /// can differ from [`Store::get`] until then.
    pub fn history(&self, key: &str) -> Ticket<Vec<ChangeRecord>> {
        let key = key.to_string();
        self.lane.submit(move |core| core.history(&key))
    }

    pub fn history_now(&self, key: &str) -> Result<Vec<ChangeRecord>> {
        self.history(key).wait()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Ticket<()> {
        let changes = vec![(key.into(), Change::Set(value.into()))];
        self.lane.submit(move |core| core.write(changes))
    }

    /// Set several keys as one batch: all become visible together.
    pub fn set_many(&self, values: impl IntoIterator<Item = (Key, Value)>) -> Ticket<()> {
        let changes: Vec<_> = values
            .into_iter()
            .map(|(key, value)| (key, Change::Set(value)))
            .collect();
        self.lane.submit(move |core| core.write(changes))
    }

    pub fn delete(&self, key: impl Into<Key>) -> Ticket<()> {
        let changes = vec![(key.into(), Change::Tombstone)];
        self.lane.submit(move |core| core.write(changes))
    }

    /// Run `work` as one unit on the lane. Writes it makes are kept even if
    /// it returns an error.
    pub fn run_transaction<T, F>(&self, work: F) -> Ticket<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Transaction<'_>) -> Result<T> + Send + 'static,
    {
        self.lane.submit(move |core| core.run_transaction(work))
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Merge other devices' journals and persist the local journal.
    pub fn sync(&self) -> Ticket<MergeReport> {
        self.lane.submit(|core| core.sync())
    }

    pub fn sync_now(&self) -> Result<MergeReport> {
        self.sync().wait()
    }

    /// Entry point for a file watcher: the package may have changed on disk.
    pub fn package_changed(&self) -> Ticket<()> {
        self.lane.submit(|core| core.package_changed())
    }

    /// Write pending changes to disk.
    pub fn save(&self) -> Ticket<()> {
        self.lane.submit(|core| {
            core.ensure_loaded()?;
            core.save()
        })
    }

    pub fn save_now(&self) -> Result<()> {
        self.save().wait()
    }

    /// Resolves once every task submitted so far has run.
    pub fn finished(&self) -> Ticket<()> {
        self.lane.submit(|_| Ok(()))
    }

    /// Block until every task submitted so far has run.
    pub fn wait_until_finished(&self) -> Result<()> {
        self.finished().wait()
    }

    /// Install the handler called after each merge pass that changes keys.
    pub fn set_merge_observer(&self, observer: impl MergeObserver + 'static) -> Ticket<()> {
        let observer: Box<dyn MergeObserver> = Box::new(observer);
        self.lane.submit(move |core| {
            core.set_observer(Some(observer));
            Ok(())
        })
    }

    pub fn clear_merge_observer(&self) -> Ticket<()> {
        self.lane.submit(|core| {
            core.set_observer(None);
            Ok(())
        })
    }

    // =========================================================================
    // Blobs
    // =========================================================================

    pub fn write_blob(&self, data: impl Into<Vec<u8>>, path: &str) -> Ticket<()> {
        let data = data.into();
        let path = path.to_string();
        self.lane.submit(move |core| core.write_blob(&path, &data))
    }

    pub fn write_blob_now(&self, data: impl Into<Vec<u8>>, path: &str) -> Result<()> {
        self.write_blob(data, path).wait()
    }

    pub fn write_blob_from_path(&self, source: impl Into<PathBuf>, path: &str) -> Ticket<()> {
        let source = source.into();
        let path = path.to_string();
        self.lane
            .submit(move |core| core.write_blob_from_path(&source, &path))
    }

    pub fn write_blob_from_path_now(&self, source: impl Into<PathBuf>, path: &str) -> Result<()> {
        self.write_blob_from_path(source, path).wait()
    }

    pub fn read_blob(&self, path: &str) -> Ticket<Vec<u8>> {
        let path = path.to_string();
        self.lane.submit(move |core| core.read_blob(&path))
    }

    pub fn read_blob_now(&self, path: &str) -> Result<Vec<u8>> {
        self.read_blob(path).wait()
    }

    pub fn delete_blob(&self, path: &str) -> Ticket<()> {
        let path = path.to_string();
        self.lane.submit(move |core| core.delete_blob(&path))
    }

    pub fn delete_blob_now(&self, path: &str) -> Result<()> {
        self.delete_blob(path).wait()
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.id)
            .field("device_id", &self.config.device_id)
            .field("location", &self.config.location)
            .field("state", &self.shared.get())
            .finish()
    }
}
