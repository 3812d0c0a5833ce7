//! # Folio Store
//!
//! A key-value store kept in a file package that any folder-syncing tool
//! can replicate between devices. There is no server and no network
//! protocol: every device appends to its own journal inside the package,
//! and reads the other devices' journals as the sync client copies them in.
//!
//! The merge rules live in [`folio_engine`]; this crate owns the files, the
//! serial lane every operation runs on, and notifications.
//!
//! ## Quick Start
//!
//! ```no_run
//! use folio_store::{Store, StoreConfig};
//!
//! # fn main() -> folio_store::Result<()> {
//! let store = Store::new(StoreConfig::new("/Users/me/Dropbox/notes.folio", "laptop"))?;
//! store.load_now()?;
//!
//! store.set("title", "Groceries").wait()?;
//! assert_eq!(store.get_now("title")?, Some("Groceries".into()));
//!
//! // Pick up whatever other devices wrote
//! store.sync_now()?;
//! store.close_now()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`package`]: on-disk layout and atomic file replacement
//! - [`blob`]: binary payloads stored next to the journals
//! - [`events`]: load, close, delete, change and sync notifications
//! - [`transaction`]: multi-step work and the merge observer
//! - [`store`]: the public handle

pub mod blob;
pub mod config;
pub mod error;
pub mod events;
mod lane;
pub mod package;
mod state;
pub mod store;
pub mod transaction;

pub use config::{ConfigError, StoreConfig};
pub use error::{Result, StoreError};
pub use events::{ChangeOrigin, EventKind, StoreEvent, StoreId};
pub use lane::Ticket;
pub use state::Lifecycle;
pub use store::Store;
pub use transaction::{MergeObserver, Transaction};

pub use folio_engine::{
    ChangeRecord, DeviceId, Key, MergeReport, MergedChange, Timestamp, Value,
    TIMESTAMP_DISTANT_PAST,
};
