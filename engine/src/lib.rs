//! # Folio Engine
//!
//! The merge core of Folio, a key-value store kept in a file package and
//! synchronized between devices by nothing more than a shared folder.
//!
//! Every device appends its writes to its own journal inside the package. A
//! file-syncing tool copies those journals around. Each device then folds all
//! journals into one merged view, and because the fold is deterministic every
//! device ends up with the same view.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches files or threads; the `folio-store`
//!   crate owns the package on disk
//! - **Deterministic**: the same journals always fold into the same snapshot,
//!   in any order
//! - **Append-only**: journals are never rewritten, so folding is always safe
//!   to repeat
//!
//! ## Core Concepts
//!
//! ### Values
//!
//! [`Value`] is a closed tagged union (null, bool, int, float, string, bytes,
//! array, map) with an explicit, versioned encoding.
//!
//! ### Change Records and Journals
//!
//! A [`ChangeRecord`] sets or deletes (tombstones) one key at one timestamp.
//! A [`Journal`] is one device's records, strictly increasing in timestamp.
//!
//! ### Timestamps
//!
//! A [`DeviceClock`] issues timestamps seeded from wall time, always strictly
//! after anything the device has issued or observed.
//!
//! ### Merging
//!
//! The [`Merger`] folds journals into a [`Snapshot`]:
//! - Higher timestamp wins
//! - Equal timestamps go to the lexicographically greater device id
//!
//! [`MergeCursors`] record how far each journal has been folded.
//!
//! ## Quick Start
//!
//! ```rust
//! use folio_engine::{merge, ChangeRecord, Journal, Value};
//!
//! let mut laptop = Journal::new("laptop");
//! laptop.append(ChangeRecord::set("name", "a", 10, "laptop")).unwrap();
//!
//! let mut phone = Journal::new("phone");
//! phone.append(ChangeRecord::set("name", "b", 10, "phone")).unwrap();
//!
//! // Same timestamp: "phone" > "laptop", so phone wins on every device.
//! let (snapshot, cursors) = merge::rebuild([&laptop, &phone]);
//! assert_eq!(snapshot.get("name"), Some(&Value::from("b")));
//! assert_eq!(cursors.get("laptop"), 10);
//! ```

pub mod clock;
pub mod error;
pub mod journal;
pub mod merge;
pub mod record;
pub mod snapshot;
pub mod value;

// Re-export main types at crate root
pub use clock::{DeviceClock, ManualClock, SystemClock, WallClock, TIMESTAMP_DISTANT_PAST};
pub use error::Error;
pub use journal::{Journal, JournalHeader, JOURNAL_FORMAT_VERSION};
pub use merge::{MergeReport, MergedChange, Merger};
pub use record::{Change, ChangeRecord};
pub use snapshot::{MergeCursors, Snapshot, SnapshotCache, SnapshotEntry, SNAPSHOT_FORMAT_VERSION};
pub use value::{Value, VALUE_ENCODING_VERSION};

/// Type aliases for clarity
pub type Key = String;
pub type DeviceId = String;
/// Microseconds since the Unix epoch, as issued by a [`DeviceClock`].
pub type Timestamp = u64;
