//! Configuration for opening a store.

use folio_engine::DeviceId;
use std::env;
use std::path::{Path, PathBuf};

/// Default capacity of the notification channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Settings for one store instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Package directory; `None` for an in-memory store
    pub location: Option<PathBuf>,
    /// Identifier of this replica; names its journal file
    pub device_id: DeviceId,
    /// Persist the merged snapshot to skip refolding on load
    pub snapshot_cache: bool,
    /// fsync files and directories after atomic replaces
    pub fsync: bool,
    /// Buffered notifications per subscriber before it starts lagging
    pub event_capacity: usize,
}

impl StoreConfig {
    /// A store backed by the package at `location`.
    pub fn new(location: impl Into<PathBuf>, device_id: impl Into<DeviceId>) -> Self {
        Self {
            location: Some(location.into()),
            ..Self::in_memory(device_id)
        }
    }

    /// A store with no package on disk.
    pub fn in_memory(device_id: impl Into<DeviceId>) -> Self {
        Self {
            location: None,
            device_id: device_id.into(),
            snapshot_cache: true,
            fsync: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn with_snapshot_cache(mut self, enabled: bool) -> Self {
        self.snapshot_cache = enabled;
        self
    }

    pub fn with_fsync(mut self, enabled: bool) -> Self {
        self.fsync = enabled;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// Load configuration from environment variables.
    ///
    /// - `FOLIO_DEVICE_ID` (required)
    /// - `FOLIO_PACKAGE` (optional; in-memory when unset)
    /// - `FOLIO_SNAPSHOT_CACHE`, `FOLIO_FSYNC` (`true`/`false`, default true)
    /// - `FOLIO_EVENT_CAPACITY` (default 64)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(None)
    }

    /// Like [`StoreConfig::from_env`], with `device_id` taking precedence
    /// over `FOLIO_DEVICE_ID`.
    pub fn from_env_with(device_id: Option<DeviceId>) -> Result<Self, ConfigError> {
        let device_id = match device_id {
            Some(device_id) => device_id,
            None => env::var("FOLIO_DEVICE_ID").map_err(|_| ConfigError::MissingDeviceId)?,
        };

        let mut config = match env::var("FOLIO_PACKAGE") {
            Ok(location) => Self::new(location, device_id),
            Err(_) => Self::in_memory(device_id),
        };

        if let Ok(value) = env::var("FOLIO_SNAPSHOT_CACHE") {
            config.snapshot_cache = parse_flag("FOLIO_SNAPSHOT_CACHE", &value)?;
        }
        if let Ok(value) = env::var("FOLIO_FSYNC") {
            config.fsync = parse_flag("FOLIO_FSYNC", &value)?;
        }
        if let Ok(value) = env::var("FOLIO_EVENT_CAPACITY") {
            config.event_capacity = value.parse().map_err(|_| ConfigError::InvalidCapacity)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the settings before a store is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device_id)?;
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidCapacity);
        }
        Ok(())
    }
}

/// Device ids become journal file-name suffixes, so they must be usable as
/// a single path component.
pub fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    let invalid = device_id.is_empty()
        || device_id.starts_with('.')
        || device_id.contains(|c: char| matches!(c, '/' | '\\' | '\0'));
    if invalid {
        return Err(ConfigError::InvalidDeviceId(device_id.to_string()));
    }
    Ok(())
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            name,
            value: value.to_string(),
        }),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("FOLIO_DEVICE_ID environment variable is required")]
    MissingDeviceId,

    #[error("invalid device id '{0}': must be a non-empty file name component")]
    InvalidDeviceId(String),

    #[error("invalid value '{value}' for {name}: expected true or false")]
    InvalidFlag { name: &'static str, value: String },

    #[error("event capacity must be a positive integer")]
    InvalidCapacity,
}
