//! Package I/O: the on-disk layout of a store.
//!
//! ```text
//! <root>/
//!   package-info                 format version, creator, creation time
//!   journal-<device>             one journal per device (JSON lines)
//!   snapshot-cache-<device>      optional merged snapshot + cursors
//!   blobs/<relative path>        blob payloads
//! ```
//!
//! Every file is replaced atomically: the new contents are written to a
//! hidden temporary file next to the target, synced, then renamed over it.
//! A reader, including a sync client copying the file to another device,
//! sees either the old file or the new one, never a mix.

use crate::config::validate_device_id;
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use folio_engine::{DeviceId, Journal, SnapshotCache};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const PACKAGE_INFO_FILE: &str = "package-info";
pub const JOURNAL_PREFIX: &str = "journal-";
pub const SNAPSHOT_CACHE_PREFIX: &str = "snapshot-cache-";
pub const BLOBS_DIR: &str = "blobs";

/// Version of the package layout.
pub const PACKAGE_FORMAT_VERSION: u32 = 1;

/// Contents of the `package-info` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    pub format_version: u32,
    pub created_by: DeviceId,
    pub created_at: DateTime<Utc>,
}

impl PackageInfo {
    pub fn new(created_by: impl Into<DeviceId>) -> Self {
        Self {
            format_version: PACKAGE_FORMAT_VERSION,
            created_by: created_by.into(),
            created_at: Utc::now(),
        }
    }
}

/// Size and modification time of a file, used to skip journals that have
/// not changed since the last merge pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

/// A package directory.
#[derive(Debug, Clone)]
pub struct Package {
    root: PathBuf,
    fsync: bool,
}

impl Package {
    pub fn new(root: impl Into<PathBuf>, fsync: bool) -> Self {
        Self {
            root: root.into(),
            fsync,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn info_path(&self) -> PathBuf {
        self.root.join(PACKAGE_INFO_FILE)
    }

    pub fn journal_path(&self, device_id: &str) -> PathBuf {
        self.root.join(format!("{JOURNAL_PREFIX}{device_id}"))
    }

    pub fn snapshot_cache_path(&self, device_id: &str) -> PathBuf {
        self.root.join(format!("{SNAPSHOT_CACHE_PREFIX}{device_id}"))
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join(BLOBS_DIR)
    }

    /// Create the package with an empty journal for `device_id`.
    pub fn create(&self, device_id: &str) -> Result<()> {
        fs::create_dir_all(self.blobs_dir()).map_err(|e| StoreError::io(&self.root, e))?;
        self.write_info(&PackageInfo::new(device_id))?;
        self.write_journal(&Journal::new(device_id))?;
        tracing::info!(path = %self.root.display(), device = %device_id, "Created package");
        Ok(())
    }

    /// Read `package-info`. `None` if the file is absent, which happens
    /// while a sync client is still populating a new package.
    pub fn read_info(&self) -> Result<Option<PackageInfo>> {
        let path = self.info_path();
        let Some(bytes) = read_optional(&path)? else {
            return Ok(None);
        };
        let info: PackageInfo =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::corrupt(&path, e))?;
        if info.format_version > PACKAGE_FORMAT_VERSION {
            return Err(StoreError::corrupt(
                &path,
                format!(
                    "unsupported package format version: {} (max supported: {})",
                    info.format_version, PACKAGE_FORMAT_VERSION
                ),
            ));
        }
        Ok(Some(info))
    }

    pub fn write_info(&self, info: &PackageInfo) -> Result<()> {
        let path = self.info_path();
        let bytes = serde_json::to_vec_pretty(info).map_err(|e| StoreError::corrupt(&path, e))?;
        self.atomic_write(&path, &bytes)
    }

    /// Read and validate the journal of `device_id`. `None` if absent;
    /// `PackageCorrupt` if present but unreadable.
    pub fn read_journal(&self, device_id: &str) -> Result<Option<Journal>> {
        let path = self.journal_path(device_id);
        let Some(bytes) = read_optional(&path)? else {
            return Ok(None);
        };
        Journal::decode_for(device_id, &bytes)
            .map(Some)
            .map_err(|e| StoreError::corrupt(&path, e))
    }

    /// Atomically replace a journal file.
    pub fn write_journal(&self, journal: &Journal) -> Result<()> {
        let bytes = journal.encode()?;
        self.atomic_write(&self.journal_path(journal.device_id()), &bytes)
    }

    /// Devices that have a journal in the package, in name order.
    pub fn list_journals(&self) -> Result<Vec<DeviceId>> {
        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.root, e))?;
            let name = entry.file_name();
            let Some(device) = name.to_str().and_then(|n| n.strip_prefix(JOURNAL_PREFIX)) else {
                continue;
            };
            if validate_device_id(device).is_err() {
                tracing::debug!(file = ?name, "Ignoring journal with unusable device id");
                continue;
            }
            devices.push(device.to_string());
        }
        devices.sort();
        Ok(devices)
    }

    /// Size and modification time of a device's journal, if present.
    pub fn journal_stamp(&self, device_id: &str) -> Result<Option<FileStamp>> {
        let path = self.journal_path(device_id);
        match fs::metadata(&path) {
            Ok(meta) => Ok(Some(FileStamp {
                len: meta.len(),
                modified: meta.modified().ok(),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Read this device's snapshot cache.
    ///
    /// The cache is an optimization, so an unreadable one is logged and
    /// ignored rather than reported.
    pub fn read_snapshot_cache(&self, device_id: &str) -> Option<SnapshotCache> {
        let path = self.snapshot_cache_path(device_id);
        let bytes = match read_optional(&path) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable snapshot cache");
                return None;
            }
        };
        match SnapshotCache::from_json(&bytes) {
            Ok(cache) if cache.device_id == device_id => Some(cache),
            Ok(cache) => {
                tracing::warn!(
                    path = %path.display(),
                    owner = %cache.device_id,
                    "Ignoring snapshot cache written by another device"
                );
                None
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt snapshot cache");
                None
            }
        }
    }

    pub fn write_snapshot_cache(&self, cache: &SnapshotCache) -> Result<()> {
        let bytes = cache.to_json()?;
        self.atomic_write(&self.snapshot_cache_path(&cache.device_id), &bytes)
    }

    /// Remove the whole package directory.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&self.root, e)),
        }
    }

    /// Delete temporary files this device left behind when it stopped between
    /// staging and commit. Other devices' temporaries are left alone; they
    /// may still be mid-write. Returns how many files were removed.
    pub fn sweep_temp_files(&self, device_id: &str) -> Result<usize> {
        let prefixes = [
            format!(".{JOURNAL_PREFIX}{device_id}."),
            format!(".{SNAPSHOT_CACHE_PREFIX}{device_id}."),
        ];
        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.root, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let is_ours = prefixes.iter().any(|prefix| {
                name.strip_prefix(prefix.as_str())
                    .and_then(|rest| rest.strip_suffix(".tmp"))
                    .is_some_and(|id| uuid::Uuid::parse_str(id).is_ok())
            });
            if !is_ours {
                continue;
            }
            let path = entry.path();
            match fs::remove_file(&path) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "Removed stale temporary file");
                    removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(path, e)),
            }
        }
        Ok(removed)
    }

    /// Write `bytes` to a temporary file beside `target`, without making it
    /// visible. Call [`StagedFile::commit`] to rename it into place.
    pub fn stage(&self, target: &Path, bytes: &[u8]) -> Result<StagedFile> {
        let dir = target.parent().unwrap_or(self.root.as_path());
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        let staged = StagedFile {
            tmp,
            target: target.to_path_buf(),
            fsync: self.fsync,
            committed: false,
        };

        let mut file = File::create(&staged.tmp).map_err(|e| StoreError::io(&staged.tmp, e))?;
        file.write_all(bytes)
            .map_err(|e| StoreError::io(&staged.tmp, e))?;
        if self.fsync {
            file.sync_all().map_err(|e| StoreError::io(&staged.tmp, e))?;
        }
        Ok(staged)
    }

    /// Write-to-temp + fsync + rename.
    pub fn atomic_write(&self, target: &Path, bytes: &[u8]) -> Result<()> {
        self.stage(target, bytes)?.commit()
    }
}

/// A fully written temporary file waiting to replace its target.
///
/// Dropping it without committing removes the temporary file and leaves the
/// target untouched.
#[derive(Debug)]
pub struct StagedFile {
    tmp: PathBuf,
    target: PathBuf,
    fsync: bool,
    committed: bool,
}

impl StagedFile {
    pub fn temp_path(&self) -> &Path {
        &self.tmp
    }

    /// Atomically rename the staged file over its target.
    pub fn commit(mut self) -> Result<()> {
        fs::rename(&self.tmp, &self.target).map_err(|e| StoreError::io(&self.target, e))?;
        self.committed = true;

        // fsync the directory so the rename itself is durable
        #[cfg(unix)]
        if self.fsync {
            if let Some(dir) = self.target.parent() {
                if let Ok(dir) = File::open(dir) {
                    let _ = dir.sync_all();
                }
            }
        }

        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

/// Read a file, mapping "not found" to `None`.
pub(crate) fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_engine::{ChangeRecord, MergeCursors, Snapshot};

    fn package() -> (tempfile::TempDir, Package) {
        let dir = tempfile::tempdir().unwrap();
        let package = Package::new(dir.path().join("store.folio"), false);
        (dir, package)
    }

    #[test]
    fn create_lays_out_package() {
        let (_dir, package) = package();
        assert!(!package.exists());

        package.create("dev1").unwrap();

        assert!(package.exists());
        assert!(package.blobs_dir().is_dir());
        assert_eq!(package.read_info().unwrap().unwrap().created_by, "dev1");
        assert!(package.read_journal("dev1").unwrap().unwrap().is_empty());
        assert_eq!(package.list_journals().unwrap(), vec!["dev1".to_string()]);
    }

    #[test]
    fn journal_write_and_read() {
        let (_dir, package) = package();
        package.create("dev1").unwrap();

        let mut journal = Journal::new("dev1");
        journal
            .append(ChangeRecord::set("a", 1i64, 10, "dev1"))
            .unwrap();
        package.write_journal(&journal).unwrap();

        assert_eq!(package.read_journal("dev1").unwrap(), Some(journal));
        assert_eq!(package.read_journal("dev2").unwrap(), None);
    }

    #[test]
    fn unparseable_journal_is_corrupt() {
        let (_dir, package) = package();
        package.create("dev1").unwrap();
        fs::write(package.journal_path("dev1"), b"{ nope").unwrap();

        assert!(matches!(
            package.read_journal("dev1"),
            Err(StoreError::PackageCorrupt { .. })
        ));
    }

    #[test]
    fn journal_under_wrong_name_is_corrupt() {
        let (_dir, package) = package();
        package.create("dev1").unwrap();
        fs::copy(package.journal_path("dev1"), package.journal_path("dev2")).unwrap();

        assert!(matches!(
            package.read_journal("dev2"),
            Err(StoreError::PackageCorrupt { .. })
        ));
    }

    #[test]
    fn future_package_format_is_corrupt() {
        let (_dir, package) = package();
        package.create("dev1").unwrap();
        fs::write(
            package.info_path(),
            br#"{"formatVersion":7,"createdBy":"dev1","createdAt":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        assert!(matches!(
            package.read_info(),
            Err(StoreError::PackageCorrupt { .. })
        ));
    }

    #[test]
    fn list_journals_ignores_other_files() {
        let (_dir, package) = package();
        package.create("dev1").unwrap();
        package.write_journal(&Journal::new("dev2")).unwrap();
        fs::write(package.root().join(".journal-dev1.abc.tmp"), b"partial").unwrap();
        fs::write(package.root().join("journal-.hidden"), b"x").unwrap();
        fs::write(package.root().join("notes.txt"), b"x").unwrap();

        assert_eq!(
            package.list_journals().unwrap(),
            vec!["dev1".to_string(), "dev2".to_string()]
        );
    }

    #[test]
    fn dropped_stage_leaves_target_untouched() {
        let (_dir, package) = package();
        package.create("dev1").unwrap();
        let target = package.journal_path("dev1");
        let before = fs::read(&target).unwrap();

        let staged = package.stage(&target, b"replacement").unwrap();
        let tmp = staged.temp_path().to_path_buf();
        assert!(tmp.exists());
        drop(staged);

        assert!(!tmp.exists());
        assert_eq!(fs::read(&target).unwrap(), before);
    }

    #[test]
    fn sweep_removes_only_own_temp_files() {
        let (_dir, package) = package();
        package.create("dev1").unwrap();
        let target = package.journal_path("dev1");

        // Stage and leak, as a process killed before the rename would
        let own_journal = package.stage(&target, b"partial").unwrap();
        let own_journal_tmp = own_journal.temp_path().to_path_buf();
        std::mem::forget(own_journal);
        let own_cache = package
            .stage(&package.snapshot_cache_path("dev1"), b"partial")
            .unwrap();
        let own_cache_tmp = own_cache.temp_path().to_path_buf();
        std::mem::forget(own_cache);
        let foreign = package
            .stage(&package.journal_path("dev2"), b"partial")
            .unwrap();
        let foreign_tmp = foreign.temp_path().to_path_buf();
        std::mem::forget(foreign);
        let lookalike = package
            .root()
            .join(format!(".journal-dev1.x.{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&lookalike, b"x").unwrap();

        assert_eq!(package.sweep_temp_files("dev1").unwrap(), 2);

        assert!(!own_journal_tmp.exists());
        assert!(!own_cache_tmp.exists());
        assert!(foreign_tmp.exists());
        assert!(lookalike.exists());
        assert!(target.exists());
        assert_eq!(package.sweep_temp_files("dev1").unwrap(), 0);
    }

    #[test]
    fn committed_stage_replaces_target() {
        let (_dir, package) = package();
        package.create("dev1").unwrap();
        let target = package.root().join("file");

        package.stage(&target, b"one").unwrap().commit().unwrap();
        package.atomic_write(&target, b"two").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"two");
    }

    #[test]
    fn journal_stamp_tracks_changes() {
        let (_dir, package) = package();
        package.create("dev1").unwrap();
        let first = package.journal_stamp("dev1").unwrap().unwrap();

        let mut journal = Journal::new("dev1");
        journal
            .append(ChangeRecord::set("a", 1i64, 10, "dev1"))
            .unwrap();
        package.write_journal(&journal).unwrap();

        let second = package.journal_stamp("dev1").unwrap().unwrap();
        assert_ne!(first.len, second.len);
        assert!(package.journal_stamp("nobody").unwrap().is_none());
    }

    #[test]
    fn snapshot_cache_is_optional() {
        let (_dir, package) = package();
        package.create("dev1").unwrap();
        assert!(package.read_snapshot_cache("dev1").is_none());

        let mut snapshot = Snapshot::new();
        snapshot.apply(&ChangeRecord::set("a", 1i64, 10, "dev2"));
        let mut cursors = MergeCursors::new();
        cursors.advance("dev2", 10);
        let cache = SnapshotCache::capture("dev1", &snapshot, &cursors);
        package.write_snapshot_cache(&cache).unwrap();
        assert_eq!(package.read_snapshot_cache("dev1"), Some(cache));

        fs::write(package.snapshot_cache_path("dev1"), b"garbage").unwrap();
        assert!(package.read_snapshot_cache("dev1").is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, package) = package();
        package.create("dev1").unwrap();
        package.remove().unwrap();
        assert!(!package.exists());
        package.remove().unwrap();
    }
}
