//! Unified error handling for the store.

use crate::config::ConfigError;
use std::io;
use std::path::PathBuf;

/// Store error type.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A structural file of the package exists but cannot be parsed. The
    /// store does not try to repair it.
    #[error("package corrupt at {}: {reason}", path.display())]
    PackageCorrupt { path: PathBuf, reason: String },

    #[error("store has been deleted")]
    StoreDeleted,

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("store is not loaded")]
    NotLoaded,

    #[error("invalid blob path '{0}': must be relative and stay inside the package")]
    InvalidBlobPath(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("engine error: {0}")]
    Engine(#[from] folio_engine::Error),

    /// The task never produced a result: it panicked, or the serial lane
    /// has shut down.
    #[error("store task aborted")]
    Aborted,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        StoreError::PackageCorrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Io { .. } | StoreError::NotLoaded)
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StoreError::corrupt("/pkg/journal-dev1", "line 3: EOF");
        assert_eq!(
            err.to_string(),
            "package corrupt at /pkg/journal-dev1: line 3: EOF"
        );

        let err = StoreError::BlobNotFound("img/a.png".into());
        assert_eq!(err.to_string(), "blob not found: img/a.png");

        let err: StoreError = ConfigError::MissingDeviceId.into();
        assert!(err.to_string().starts_with("configuration error"));
    }

    #[test]
    fn retryable_errors() {
        let io_err = StoreError::io("/pkg", io::Error::other("disk full"));
        assert!(io_err.is_retryable());
        assert!(StoreError::NotLoaded.is_retryable());
        assert!(!StoreError::StoreDeleted.is_retryable());
    }
}
