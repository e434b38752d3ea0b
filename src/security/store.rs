//! Persistence for access descriptors.
//!
//! The resolver only talks to `DescriptorStore`, so the sidecar-file layout can be
//! swapped for another backing store without touching the decision logic. Lookups are
//! uncached: each one re-reads the sidecar, so a descriptor written by one request is
//! visible to the very next check.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::descriptor::AccessDescriptor;
use crate::error::{StorageError, StorageResult};
use crate::storage::StorageLayout;

/// Identifies the descriptor of a container (`blob == None`) or of one blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorKey {
    pub container: String,
    pub blob: Option<String>,
}

impl DescriptorKey {
    pub fn container(container: &str) -> Self {
        Self { container: container.to_string(), blob: None }
    }

    pub fn blob(container: &str, blob_path: &str) -> Self {
        Self { container: container.to_string(), blob: Some(blob_path.to_string()) }
    }
}

impl std::fmt::Display for DescriptorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.blob {
            Some(b) => write!(f, "{}/{}", self.container, b),
            None => write!(f, "{}", self.container),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorLookup {
    Found(AccessDescriptor),
    Missing,
    /// The record exists but could not be read or parsed.
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Another writer published a descriptor first; theirs is kept.
    AlreadyExisted,
}

pub trait DescriptorStore: Send + Sync {
    fn load(&self, key: &DescriptorKey) -> DescriptorLookup;

    /// True if a record is present, readable or not.
    fn exists(&self, key: &DescriptorKey) -> bool;

    /// Create-if-absent. Must fail closed: never replace an existing record.
    fn create(&self, key: &DescriptorKey, descriptor: &AccessDescriptor) -> StorageResult<CreateOutcome>;

    /// Delete a record this process just created. Missing records are not an error.
    fn remove(&self, key: &DescriptorKey) -> StorageResult<()>;
}

/// Descriptors as `.container.auth` / `<blob>.auth` sidecar files.
#[derive(Debug, Clone)]
pub struct FileDescriptorStore {
    layout: StorageLayout,
}

impl FileDescriptorStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    pub fn sidecar_path(&self, key: &DescriptorKey) -> StorageResult<PathBuf> {
        match &key.blob {
            Some(blob) => self.layout.blob_auth_path(&key.container, blob),
            None => self.layout.container_auth_path(&key.container),
        }
    }
}

impl DescriptorStore for FileDescriptorStore {
    fn load(&self, key: &DescriptorKey) -> DescriptorLookup {
        let path = match self.sidecar_path(key) {
            Ok(p) => p,
            Err(e) => return DescriptorLookup::Corrupt(e.to_string()),
        };
        let raw = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => return DescriptorLookup::Missing,
            Err(e) => return DescriptorLookup::Corrupt(format!("read {}: {}", path.display(), e)),
        };
        match AccessDescriptor::from_json(&raw) {
            Ok(d) => DescriptorLookup::Found(d),
            Err(e) => DescriptorLookup::Corrupt(format!("parse {}: {}", path.display(), e)),
        }
    }

    fn exists(&self, key: &DescriptorKey) -> bool {
        // Anything occupying the slot counts; a non-file there loads as corrupt.
        self.sidecar_path(key)
            .map(|p| fs::symlink_metadata(p).is_ok())
            .unwrap_or(false)
    }

    fn create(&self, key: &DescriptorKey, descriptor: &AccessDescriptor) -> StorageResult<CreateOutcome> {
        let path = self.sidecar_path(key)?;
        let json = descriptor
            .to_json()
            .map_err(|source| StorageError::Sidecar { path: path.display().to_string(), source })?;
        let outcome = publish_exclusive(&path, json.as_bytes())?;
        debug!(target: "authz", key = %key, ?outcome, "descriptor create");
        Ok(outcome)
    }

    fn remove(&self, key: &DescriptorKey) -> StorageResult<()> {
        let path = self.sidecar_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }
}

/// Write `bytes` to a private temp file, then hard-link it into place. The link
/// fails if `dest` exists, so the check and the publish are one step and readers
/// never see a half-written descriptor.
fn publish_exclusive(dest: &Path, bytes: &[u8]) -> StorageResult<CreateOutcome> {
    let dir = dest
        .parent()
        .ok_or_else(|| StorageError::InvalidPath(dest.display().to_string()))?;
    fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;
    let tmp = dir.join(format!(".auth-{}.tmp", uuid::Uuid::new_v4()));
    {
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .map_err(|e| StorageError::io(&tmp, e))?;
        let written = f.write_all(bytes).and_then(|_| f.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(StorageError::io(&tmp, e));
        }
    }
    let linked = fs::hard_link(&tmp, dest);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(CreateOutcome::Created),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            // Only a regular file is a descriptor another writer published first.
            let is_file = fs::symlink_metadata(dest).map(|m| m.file_type().is_file()).unwrap_or(false);
            if is_file {
                Ok(CreateOutcome::AlreadyExisted)
            } else {
                Err(StorageError::io(dest, std::io::Error::new(ErrorKind::AlreadyExists, "descriptor path is occupied by a non-file")))
            }
        }
        Err(e) => Err(StorageError::io(dest, e)),
    }
}
