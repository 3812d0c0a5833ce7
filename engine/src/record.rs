//! Change records: the unit every journal is made of.

use crate::{DeviceId, Key, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// What a change record does to its key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Change {
    /// The key now holds this value
    Set(Value),
    /// The key was deleted
    Tombstone,
}

impl Change {
    /// The value, or `None` for a tombstone.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Change::Set(value) => Some(value),
            Change::Tombstone => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Change::Tombstone)
    }
}

impl From<Option<Value>> for Change {
    fn from(value: Option<Value>) -> Self {
        match value {
            Some(value) => Change::Set(value),
            None => Change::Tombstone,
        }
    }
}

/// One timestamped write to one key, as appended to a device journal.
/// Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub key: Key,
    pub change: Change,
    pub timestamp: Timestamp,
    pub device_id: DeviceId,
}

impl ChangeRecord {
    pub fn new(
        key: impl Into<Key>,
        change: Change,
        timestamp: Timestamp,
        device_id: impl Into<DeviceId>,
    ) -> Self {
        Self {
            key: key.into(),
            change,
            timestamp,
            device_id: device_id.into(),
        }
    }

    /// A record setting `key` to `value`.
    pub fn set(
        key: impl Into<Key>,
        value: impl Into<Value>,
        timestamp: Timestamp,
        device_id: impl Into<DeviceId>,
    ) -> Self {
        Self::new(key, Change::Set(value.into()), timestamp, device_id)
    }

    /// A record deleting `key`.
    pub fn tombstone(
        key: impl Into<Key>,
        timestamp: Timestamp,
        device_id: impl Into<DeviceId>,
    ) -> Self {
        Self::new(key, Change::Tombstone, timestamp, device_id)
    }

    /// Merge order of this record against another write to the same key.
    pub fn merge_order(&self, other_timestamp: Timestamp, other_device: &str) -> Ordering {
        merge_order(self.timestamp, &self.device_id, other_timestamp, other_device)
    }
}

/// Last-writer-wins order.
///
/// 1. Higher timestamp wins
/// 2. If timestamps are equal, the lexicographically greater device id wins
///
/// The order is total over distinct devices, so every replica picks the same
/// winner regardless of the order records were folded in.
pub fn merge_order(
    timestamp: Timestamp,
    device_id: &str,
    other_timestamp: Timestamp,
    other_device: &str,
) -> Ordering {
    timestamp
        .cmp(&other_timestamp)
        .then_with(|| device_id.cmp(other_device))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_timestamp_wins() {
        let record = ChangeRecord::set("name", "a", 20, "dev1");
        assert_eq!(record.merge_order(10, "dev2"), Ordering::Greater);
        assert_eq!(record.merge_order(30, "dev0"), Ordering::Less);
    }

    #[test]
    fn equal_timestamps_fall_back_to_device_id() {
        let record = ChangeRecord::set("name", "a", 10, "dev1");
        assert_eq!(record.merge_order(10, "dev2"), Ordering::Less);
        assert_eq!(record.merge_order(10, "dev0"), Ordering::Greater);
        assert_eq!(record.merge_order(10, "dev1"), Ordering::Equal);
    }

    #[test]
    fn tombstone_has_no_value() {
        let record = ChangeRecord::tombstone("name", 10, "dev1");
        assert!(record.change.is_tombstone());
        assert_eq!(record.change.value(), None);
        assert_eq!(Change::from(None), Change::Tombstone);
        assert_eq!(
            Change::from(Some(Value::Int(1))).value(),
            Some(&Value::Int(1))
        );
    }

    #[test]
    fn serialization_format() {
        let record = ChangeRecord::set("x", 1i64, 42, "dev1");
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"key":"x","change":{"set":{"int":1}},"timestamp":42,"deviceId":"dev1"}"#
        );

        let tombstone = ChangeRecord::tombstone("x", 43, "dev1");
        let json = serde_json::to_string(&tombstone).unwrap();
        assert!(json.contains(r#""change":"tombstone""#));
        let parsed: ChangeRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, tombstone);
    }
}
