//! Device journals.
//!
//! A journal is the append-only list of change records written by one
//! device. Entries are strictly increasing in timestamp and are never
//! rewritten; a correction is a new record.
//!
//! # Encoding
//!
//! JSON lines. The first line is a [`JournalHeader`], every following line
//! is one [`ChangeRecord`]:
//!
//! ```text
//! {"format":"folio-journal","formatVersion":1,"deviceId":"dev1"}
//! {"key":"x","change":{"set":{"int":1}},"timestamp":10,"deviceId":"dev1"}
//! {"key":"x","change":"tombstone","timestamp":11,"deviceId":"dev1"}
//! ```

use crate::error::{Error, Result};
use crate::record::merge_order;
use crate::{ChangeRecord, DeviceId, Timestamp};
use serde::{Deserialize, Serialize};

/// Marker in the header line identifying a journal file.
pub const JOURNAL_FORMAT: &str = "folio-journal";

/// Version of the journal encoding.
pub const JOURNAL_FORMAT_VERSION: u32 = 1;

/// First line of every encoded journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalHeader {
    pub format: String,
    pub format_version: u32,
    pub device_id: DeviceId,
}

impl JournalHeader {
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            format: JOURNAL_FORMAT.to_string(),
            format_version: JOURNAL_FORMAT_VERSION,
            device_id: device_id.into(),
        }
    }
}

/// The change records of a single device, in timestamp order.
#[derive(Debug, Clone, PartialEq)]
pub struct Journal {
    device_id: DeviceId,
    entries: Vec<ChangeRecord>,
}

impl Journal {
    /// Create an empty journal for a device.
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: device_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn entries(&self) -> &[ChangeRecord] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Timestamp of the newest entry.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.entries.last().map(|r| r.timestamp)
    }

    /// Append a record written by this journal's device.
    ///
    /// Fails without modifying the journal if the record belongs to another
    /// device, does not sort after the current last entry, or carries a
    /// value that cannot be encoded.
    pub fn append(&mut self, record: ChangeRecord) -> Result<()> {
        self.check_next(&record)?;
        if let Some(value) = record.change.value() {
            value.validate()?;
        }
        self.entries.push(record);
        Ok(())
    }

    fn check_next(&self, record: &ChangeRecord) -> Result<()> {
        if record.device_id != self.device_id {
            return Err(Error::DeviceMismatch {
                expected: self.device_id.clone(),
                actual: record.device_id.clone(),
            });
        }
        if let Some(previous) = self.last_timestamp() {
            if record.timestamp <= previous {
                return Err(Error::NonMonotonicTimestamp {
                    previous,
                    got: record.timestamp,
                });
            }
        }
        Ok(())
    }

    /// Entries with a timestamp strictly greater than `cursor`.
    pub fn entries_after(&self, cursor: Timestamp) -> &[ChangeRecord] {
        let start = self.entries.partition_point(|r| r.timestamp <= cursor);
        &self.entries[start..]
    }

    /// All entries for one key, oldest first.
    pub fn entries_for_key<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a ChangeRecord> {
        self.entries.iter().filter(move |r| r.key == key)
    }

    /// Encode as JSON lines.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = serde_json::to_vec(&JournalHeader::new(self.device_id.clone()))
            .map_err(|e| Error::InvalidJournal(e.to_string()))?;
        out.push(b'\n');
        for record in &self.entries {
            serde_json::to_writer(&mut out, record)
                .map_err(|e| Error::InvalidJournal(e.to_string()))?;
            out.push(b'\n');
        }
        Ok(out)
    }

    /// Decode a journal, checking every structural invariant.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut lines = bytes
            .split(|b| *b == b'\n')
            .enumerate()
            .filter(|(_, line)| !line.iter().all(u8::is_ascii_whitespace));

        let (_, header_line) = lines
            .next()
            .ok_or_else(|| Error::InvalidJournal("missing header".into()))?;
        let header: JournalHeader = serde_json::from_slice(header_line)
            .map_err(|e| Error::InvalidJournal(format!("header: {e}")))?;

        if header.format != JOURNAL_FORMAT {
            return Err(Error::InvalidJournal(format!(
                "unexpected format marker '{}'",
                header.format
            )));
        }
        if header.format_version > JOURNAL_FORMAT_VERSION {
            return Err(Error::InvalidJournal(format!(
                "unsupported journal format version: {} (max supported: {})",
                header.format_version, JOURNAL_FORMAT_VERSION
            )));
        }

        let mut journal = Journal::new(header.device_id);
        for (index, line) in lines {
            let record: ChangeRecord = serde_json::from_slice(line)
                .map_err(|e| Error::InvalidJournal(format!("line {}: {e}", index + 1)))?;
            journal.append(record)?;
        }
        Ok(journal)
    }

    /// Decode a journal that must belong to `device_id`.
    pub fn decode_for(device_id: &str, bytes: &[u8]) -> Result<Self> {
        let journal = Self::decode(bytes)?;
        if journal.device_id != device_id {
            return Err(Error::DeviceMismatch {
                expected: device_id.to_string(),
                actual: journal.device_id,
            });
        }
        Ok(journal)
    }
}

/// Every record for `key` across a set of journals, ordered the way the
/// merge rule ranks them (the last element is the current winner).
pub fn history<'a>(
    key: &str,
    journals: impl IntoIterator<Item = &'a Journal>,
) -> Vec<ChangeRecord> {
    let mut records: Vec<ChangeRecord> = journals
        .into_iter()
        .flat_map(|j| j.entries_for_key(key).cloned())
        .collect();
    records.sort_by(|a, b| merge_order(a.timestamp, &a.device_id, b.timestamp, &b.device_id));
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    fn sample() -> Journal {
        let mut journal = Journal::new("dev1");
        journal
            .append(ChangeRecord::set("a", 1i64, 10, "dev1"))
            .unwrap();
        journal
            .append(ChangeRecord::set("b", "two", 20, "dev1"))
            .unwrap();
        journal
            .append(ChangeRecord::tombstone("a", 30, "dev1"))
            .unwrap();
        journal
    }

    #[test]
    fn append_tracks_last_timestamp() {
        let journal = sample();
        assert_eq!(journal.len(), 3);
        assert_eq!(journal.last_timestamp(), Some(30));
        assert!(Journal::new("dev1").last_timestamp().is_none());
    }

    #[test]
    fn append_rejects_non_increasing_timestamp() {
        let mut journal = sample();
        let result = journal.append(ChangeRecord::set("c", 1i64, 30, "dev1"));
        assert!(matches!(
            result,
            Err(Error::NonMonotonicTimestamp {
                previous: 30,
                got: 30
            })
        ));
        assert_eq!(journal.len(), 3);
    }

    #[test]
    fn append_rejects_foreign_device() {
        let mut journal = sample();
        let result = journal.append(ChangeRecord::set("c", 1i64, 40, "dev2"));
        assert!(matches!(result, Err(Error::DeviceMismatch { .. })));
    }

    #[test]
    fn append_rejects_unencodable_value() {
        let mut journal = sample();
        let result = journal.append(ChangeRecord::set("c", Value::Float(f64::NAN), 40, "dev1"));
        assert!(matches!(result, Err(Error::InvalidValue(_))));
        assert_eq!(journal.len(), 3);
    }

    #[test]
    fn entries_after_cursor() {
        let journal = sample();
        assert_eq!(journal.entries_after(0).len(), 3);
        assert_eq!(journal.entries_after(10).len(), 2);
        assert_eq!(journal.entries_after(15)[0].key, "b");
        assert!(journal.entries_after(30).is_empty());
    }

    #[test]
    fn encode_decode() {
        let journal = sample();
        let bytes = journal.encode().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with(
            r#"{"format":"folio-journal","formatVersion":1,"deviceId":"dev1"}"#
        ));
        assert_eq!(text.lines().count(), 4);

        assert_eq!(Journal::decode(&bytes).unwrap(), journal);
    }

    #[test]
    fn decode_empty_journal() {
        let bytes = Journal::new("dev9").encode().unwrap();
        let journal = Journal::decode(&bytes).unwrap();
        assert_eq!(journal.device_id(), "dev9");
        assert!(journal.is_empty());
    }

    #[test]
    fn decode_rejects_truncated_line() {
        let bytes = sample().encode().unwrap();
        let cut = &bytes[..bytes.len() - 10];
        assert!(matches!(
            Journal::decode(cut),
            Err(Error::InvalidJournal(_))
        ));
    }

    #[test]
    fn decode_rejects_missing_header() {
        assert!(matches!(
            Journal::decode(b""),
            Err(Error::InvalidJournal(_))
        ));
        assert!(Journal::decode(b"not json\n").is_err());
    }

    #[test]
    fn decode_rejects_future_format() {
        let bytes = br#"{"format":"folio-journal","formatVersion":99,"deviceId":"dev1"}"#;
        assert!(matches!(
            Journal::decode(bytes),
            Err(Error::InvalidJournal(_))
        ));
    }

    #[test]
    fn decode_rejects_out_of_order_entries() {
        let text = concat!(
            r#"{"format":"folio-journal","formatVersion":1,"deviceId":"dev1"}"#,
            "\n",
            r#"{"key":"a","change":"tombstone","timestamp":20,"deviceId":"dev1"}"#,
            "\n",
            r#"{"key":"a","change":"tombstone","timestamp":10,"deviceId":"dev1"}"#,
            "\n",
        );
        assert!(matches!(
            Journal::decode(text.as_bytes()),
            Err(Error::NonMonotonicTimestamp { .. })
        ));
    }

    #[test]
    fn decode_for_checks_owner() {
        let bytes = sample().encode().unwrap();
        assert!(Journal::decode_for("dev1", &bytes).is_ok());
        assert!(matches!(
            Journal::decode_for("dev2", &bytes),
            Err(Error::DeviceMismatch { .. })
        ));
    }

    #[test]
    fn history_across_journals() {
        let dev1 = sample();
        let mut dev2 = Journal::new("dev2");
        dev2.append(ChangeRecord::set("a", 5i64, 10, "dev2")).unwrap();
        dev2.append(ChangeRecord::set("a", 6i64, 25, "dev2")).unwrap();

        let history = history("a", [&dev1, &dev2]);
        let order: Vec<_> = history
            .iter()
            .map(|r| (r.timestamp, r.device_id.as_str()))
            .collect();
        assert_eq!(order, vec![(10, "dev1"), (10, "dev2"), (25, "dev2"), (30, "dev1")]);
        assert!(history.last().unwrap().change.is_tombstone());
    }
}
