//! Transactions and the merge-observer seam.

use crate::error::Result;
use crate::state::StoreCore;
use folio_engine::{Change, DeviceId, Key, MergedChange, Timestamp, Value};
use std::collections::{BTreeMap, BTreeSet};

/// A consistent view of the store inside the serial lane.
///
/// Nothing else runs while a transaction is open: no merge pass, no other
/// write. Writes are not rolled back if the transaction later fails; each
/// one is durable exactly as if it had been issued on its own.
pub struct Transaction<'a> {
    core: &'a mut StoreCore,
    touched: BTreeSet<Key>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(core: &'a mut StoreCore) -> Self {
        Self {
            core,
            touched: BTreeSet::new(),
        }
    }

    pub(crate) fn into_touched(self) -> BTreeSet<Key> {
        self.touched
    }

    pub fn device_id(&self) -> &DeviceId {
        self.core.device_id()
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.core.get(key)
    }

    pub fn all_values(&self) -> Result<BTreeMap<Key, Value>> {
        self.core.all_values()
    }

    pub fn most_recent_timestamp(&self, device_id: &str) -> Result<Option<Timestamp>> {
        self.core.most_recent_timestamp(device_id)
    }

    pub fn set(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        self.apply(vec![(key.into(), Change::Set(value.into()))])
    }

    pub fn set_many(&mut self, values: impl IntoIterator<Item = (Key, Value)>) -> Result<()> {
        self.apply(
            values
                .into_iter()
                .map(|(key, value)| (key, Change::Set(value)))
                .collect(),
        )
    }

    pub fn delete(&mut self, key: impl Into<Key>) -> Result<()> {
        self.apply(vec![(key.into(), Change::Tombstone)])
    }

    fn apply(&mut self, changes: Vec<(Key, Change)>) -> Result<()> {
        let keys = self.core.apply_writes(changes)?;
        self.touched.extend(keys);
        Ok(())
    }
}

/// Inspects the outcome of a merge pass.
///
/// `merged` runs in the serial lane after the last-writer-wins rule has been
/// applied and before the `Changed` notification goes out. `changes` holds
/// the new winner for every key the pass changed. Writes made through `tx`
/// are ordinary local writes, and their keys are reported in the same
/// notification.
pub trait MergeObserver: Send {
    fn merged(&mut self, changes: &[MergedChange], tx: &mut Transaction<'_>);
}

impl<F> MergeObserver for F
where
    F: FnMut(&[MergedChange], &mut Transaction<'_>) + Send,
{
    fn merged(&mut self, changes: &[MergedChange], tx: &mut Transaction<'_>) {
        self(changes, tx)
    }
}
