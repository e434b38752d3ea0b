//! Mapping of (container, blob path) onto the storage root, plus the sidecar paths
//! that sit next to each blob. All validation happens here so the rest of the
//! storage layer only ever sees safe, normalized segments.

use std::path::{Path, PathBuf};

use unicode_normalization::UnicodeNormalization;

use crate::error::{StorageError, StorageResult};

pub const CONTAINER_AUTH_FILE: &str = ".container.auth";
pub const AUTH_SUFFIX: &str = ".auth";
pub const PROP_SUFFIX: &str = ".prop";

/// Normalize a UTF-8 string to NFC.
pub fn normalize_nfc(input: &str) -> String {
    input.nfc().collect::<String>()
}

fn invalid(what: &str, value: &str) -> StorageError {
    StorageError::InvalidPath(format!("{}: '{}'", what, value))
}

/// Container names are a single directory level: non-empty, no separators, no NUL,
/// and not starting with '.' or '_' (reserved for sidecars and service routes).
pub fn validate_container_name(name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(invalid("container name cannot be empty", name));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(invalid("container name cannot contain separators", name));
    }
    if name.chars().any(|c| c == '\u{0000}' || c.is_control()) {
        return Err(invalid("container name cannot contain control characters", name));
    }
    if name.starts_with('.') || name.starts_with('_') {
        return Err(invalid("container name cannot start with '.' or '_'", name));
    }
    Ok(())
}

/// Normalize a blob path: backslashes become '/', the result is NFC and validated.
/// Rules: '/'-separated, no empty, '.' or '..' segments, no NUL, and no segment
/// may end in a sidecar suffix.
pub fn normalize_blob_path(path: &str) -> StorageResult<String> {
    let unified = normalize_nfc(&path.replace('\\', "/"));
    if unified.is_empty() {
        return Err(invalid("blob path cannot be empty", path));
    }
    if unified.chars().any(|c| c == '\u{0000}') {
        return Err(invalid("blob path cannot contain NUL characters", path));
    }
    if unified.starts_with('/') || unified.ends_with('/') {
        return Err(invalid("leading or trailing '/' is not allowed in blob paths", path));
    }
    for seg in unified.split('/') {
        if seg.is_empty() {
            return Err(invalid("empty segment in blob path", path));
        }
        if seg == "." || seg == ".." {
            return Err(invalid("segments '.' and '..' are not allowed", path));
        }
        // A directory named like a sidecar would occupy a sibling blob's `.auth`/`.prop` slot.
        let lower = seg.to_ascii_lowercase();
        if lower.ends_with(AUTH_SUFFIX) || lower.ends_with(PROP_SUFFIX) {
            return Err(invalid("path segments ending in .auth or .prop are reserved", path));
        }
    }
    Ok(unified)
}

/// Append a suffix to the final component: `a/b.txt` + `.auth` -> `a/b.txt.auth`.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Deterministic physical layout under a storage root.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn container_dir(&self, container: &str) -> StorageResult<PathBuf> {
        validate_container_name(container)?;
        Ok(self.root.join(container))
    }

    pub fn container_auth_path(&self, container: &str) -> StorageResult<PathBuf> {
        Ok(self.container_dir(container)?.join(CONTAINER_AUTH_FILE))
    }

    /// Physical content path. Segments are pushed one by one so forward-slash blob
    /// paths land on the host's native separator.
    pub fn blob_path(&self, container: &str, blob_path: &str) -> StorageResult<PathBuf> {
        let mut p = self.container_dir(container)?;
        for seg in normalize_blob_path(blob_path)?.split('/') {
            p.push(seg);
        }
        Ok(p)
    }

    pub fn blob_auth_path(&self, container: &str, blob_path: &str) -> StorageResult<PathBuf> {
        Ok(with_suffix(&self.blob_path(container, blob_path)?, AUTH_SUFFIX))
    }

    pub fn blob_prop_path(&self, container: &str, blob_path: &str) -> StorageResult<PathBuf> {
        Ok(with_suffix(&self.blob_path(container, blob_path)?, PROP_SUFFIX))
    }
}
