//! Blob Store: named binary payloads kept next to the journals.
//!
//! Blobs are plain files under `blobs/`. They carry no timestamp or device
//! metadata and are never merged; whichever copy the sync transport
//! delivers last is the blob.

use crate::error::{Result, StoreError};
use crate::package::{read_optional, Package};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Check that `path` names a file inside the blob directory and return it
/// as a relative path.
pub fn validate_blob_path(path: &str) -> Result<PathBuf> {
    let relative = Path::new(path);
    let mut normal = 0;
    for component in relative.components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            _ => return Err(StoreError::InvalidBlobPath(path.to_string())),
        }
    }
    if normal == 0 {
        return Err(StoreError::InvalidBlobPath(path.to_string()));
    }
    Ok(relative.to_path_buf())
}

/// Blob storage, on disk or in memory.
#[derive(Debug)]
pub enum BlobStore {
    Disk(Package),
    Memory(BTreeMap<PathBuf, Vec<u8>>),
}

impl BlobStore {
    pub fn disk(package: Package) -> Self {
        BlobStore::Disk(package)
    }

    pub fn memory() -> Self {
        BlobStore::Memory(BTreeMap::new())
    }

    /// Store `data` at `path`, replacing any existing blob.
    pub fn write(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let relative = validate_blob_path(path)?;
        match self {
            BlobStore::Disk(package) => {
                let target = package.blobs_dir().join(&relative);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
                }
                package.atomic_write(&target, data)?;
            }
            BlobStore::Memory(blobs) => {
                blobs.insert(relative, data.to_vec());
            }
        }
        tracing::debug!(blob = %path, bytes = data.len(), "Wrote blob");
        Ok(())
    }

    /// Copy the file at `source` into the blob store at `path`.
    pub fn write_from_path(&mut self, source: &Path, path: &str) -> Result<()> {
        validate_blob_path(path)?;
        let data = fs::read(source).map_err(|e| StoreError::io(source, e))?;
        self.write(path, &data)
    }

    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        let relative = validate_blob_path(path)?;
        let found = match self {
            BlobStore::Disk(package) => read_optional(&package.blobs_dir().join(relative))?,
            BlobStore::Memory(blobs) => blobs.get(&relative).cloned(),
        };
        found.ok_or_else(|| StoreError::BlobNotFound(path.to_string()))
    }

    pub fn delete(&mut self, path: &str) -> Result<()> {
        let relative = validate_blob_path(path)?;
        match self {
            BlobStore::Disk(package) => {
                let target = package.blobs_dir().join(relative);
                match fs::remove_file(&target) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        Err(StoreError::BlobNotFound(path.to_string()))
                    }
                    Err(e) => Err(StoreError::io(target, e)),
                }
            }
            BlobStore::Memory(blobs) => blobs
                .remove(&relative)
                .map(|_| ())
                .ok_or_else(|| StoreError::BlobNotFound(path.to_string())),
        }
    }
}
