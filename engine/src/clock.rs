//! Timestamp clocks.
//!
//! A [`DeviceClock`] issues the timestamps a device stamps on its own change
//! records. It is a logical clock seeded from wall time: every issued value
//! is strictly greater than everything the device has issued or observed
//! before, even when the wall clock stalls or jumps backward.
//!
//! Wall time is injected through [`WallClock`] so tests can drive the clock
//! by hand.

use crate::{DeviceId, Timestamp};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Timestamp that sorts before every record. A merge cursor at this value
/// has folded nothing yet.
pub const TIMESTAMP_DISTANT_PAST: Timestamp = 0;

/// Source of wall-clock time in microseconds since the Unix epoch.
pub trait WallClock: Send + Sync {
    fn now_micros(&self) -> Timestamp;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_micros(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as Timestamp)
            .unwrap_or(TIMESTAMP_DISTANT_PAST)
    }
}

/// A wall clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(now)),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Timestamp) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now_micros(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Per-device timestamp allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceClock {
    device_id: DeviceId,
    /// Highest timestamp issued or observed so far.
    last: Timestamp,
}

impl DeviceClock {
    /// Create a clock that has issued nothing yet.
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self::resume(device_id, TIMESTAMP_DISTANT_PAST)
    }

    /// Resume a clock after a restart, from the last timestamp the device
    /// is known to have written.
    pub fn resume(device_id: impl Into<DeviceId>, last: Timestamp) -> Self {
        Self {
            device_id: device_id.into(),
            last,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn last(&self) -> Timestamp {
        self.last
    }

    /// Issue the next timestamp: wall time, unless that would not be
    /// strictly after the last value, in which case last + 1.
    pub fn tick(&mut self, wall_now: Timestamp) -> Timestamp {
        let next = wall_now.max(self.last.saturating_add(1));
        self.last = next;
        next
    }

    /// Record a timestamp seen on another device's journal so the next local
    /// write sorts after it.
    pub fn observe(&mut self, seen: Timestamp) {
        self.last = self.last.max(seen);
    }
}
