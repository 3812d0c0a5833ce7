//! Store notifications.
//!
//! Events are delivered in the order the lane performed the transitions,
//! through a `tokio::sync::broadcast` channel. Delivery is best effort: a
//! subscriber that falls behind by more than the channel capacity sees a
//! `Lagged` error and skips ahead. Nothing is persisted.

use folio_engine::Key;
use serde::Serialize;
use std::collections::BTreeSet;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Identity of one open store instance.
pub type StoreId = Uuid;

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOrigin {
    /// A write made through this store instance
    Local,
    /// A merge pass over other devices' journals
    Sync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum EventKind {
    Loaded,
    Closed,
    Deleted,
    Changed {
        keys: BTreeSet<Key>,
        origin: ChangeOrigin,
    },
    /// A merge pass completed, whether or not it changed anything.
    Synced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreEvent {
    pub store: StoreId,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Publishing side of the notification channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    store: StoreId,
    tx: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub fn new(store: StoreId, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { store, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, kind: EventKind) {
        tracing::trace!(store = %self.store, event = ?kind, "Publishing store event");
        // No subscribers is not an error
        let _ = self.tx.send(StoreEvent {
            store: self.store,
            kind,
        });
    }
}
