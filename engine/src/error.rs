//! Error types for the Folio engine.

use crate::{DeviceId, Timestamp};
use thiserror::Error;

/// All possible errors from the Folio engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Value errors
    #[error("invalid value: {0}")]
    InvalidValue(String),

    // Journal errors
    #[error("invalid journal: {0}")]
    InvalidJournal(String),

    #[error("timestamp {got} is not after previous timestamp {previous}")]
    NonMonotonicTimestamp { previous: Timestamp, got: Timestamp },

    #[error("device mismatch: expected '{expected}', got '{actual}'")]
    DeviceMismatch { expected: DeviceId, actual: DeviceId },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::InvalidJournal("truncated line 3".into());
        assert_eq!(err.to_string(), "invalid journal: truncated line 3");

        let err = Error::NonMonotonicTimestamp {
            previous: 20,
            got: 10,
        };
        assert_eq!(
            err.to_string(),
            "timestamp 10 is not after previous timestamp 20"
        );

        let err = Error::DeviceMismatch {
            expected: "dev1".into(),
            actual: "dev2".into(),
        };
        assert_eq!(
            err.to_string(),
            "device mismatch: expected 'dev1', got 'dev2'"
        );
    }
}
