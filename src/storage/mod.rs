//!
//! blobhouse storage module
//! ------------------------
//! The blob layout manager. A container is a directory under the storage root and
//! a blob is a file under its container, addressed by a '/'-separated path. Each
//! blob may carry two sidecars next to it:
//!
//! - `<blob>.prop`: JSON metadata map (system fields plus caller `x-ms-meta-*` keys)
//! - `<blob>.auth`: blob-level access descriptor (owned by the `security` module)
//!
//! Content and metadata are replaced wholesale on every write; there is no versioning.
//! Writes publish via temp-file-then-rename so readers never observe a partial file.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::Stream;
use path_absolutize::Absolutize;
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};

mod io;
pub mod etag;
pub mod metadata;
pub mod paths;

pub use etag::{etag_for, if_none_match_hits};
pub use metadata::{Metadata, META_HEADER_PREFIX};
pub use paths::{normalize_blob_path, validate_container_name, StorageLayout};

/// System metadata keys written on every save. Caller keys with the same name win.
pub const SYS_CREATED_BY: &str = "createdBy";
pub const SYS_CREATED_UTC: &str = "createdUtc";
pub const SYS_FILE_NAME: &str = "fileName";
pub const SYS_CONTENT_TYPE: &str = "contentType";

/// Everything about a blob except its bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobProperties {
    pub size: u64,
    pub last_modified: SystemTime,
    /// Unquoted; the HTTP layer adds quotes.
    pub etag: String,
    pub metadata: Metadata,
}

impl BlobProperties {
    pub fn last_modified_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.last_modified)
    }
}

/// An open blob. Dropping it releases the file handle.
#[derive(Debug)]
pub struct BlobHandle {
    pub file: tokio::fs::File,
    pub properties: BlobProperties,
}

/// Core on-disk handle for the container/blob tree.
#[derive(Debug, Clone)]
pub struct BlobStore {
    layout: StorageLayout,
}

impl BlobStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> anyhow::Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create or access storage root: {}", root.display()))?;
        let abs = root
            .absolutize()
            .with_context(|| format!("Failed to absolutize storage root: {}", root.display()))?
            .to_path_buf();
        Ok(Self { layout: StorageLayout::new(abs) })
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn root_path(&self) -> &Path {
        self.layout.root()
    }

    /// Deterministic physical content path for a blob.
    pub fn physical_path(&self, container: &str, blob_path: &str) -> StorageResult<PathBuf> {
        self.layout.blob_path(container, blob_path)
    }

    pub async fn container_exists(&self, container: &str) -> StorageResult<bool> {
        let dir = self.layout.container_dir(container)?;
        Ok(tokio::fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false))
    }

    /// Create the container directory. Fails with `AlreadyExists` if it is already there.
    pub async fn create_container(&self, container: &str) -> StorageResult<PathBuf> {
        let dir = self.layout.container_dir(container)?;
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => {
                debug!(target: "storage", container, "container created");
                Ok(dir)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StorageError::AlreadyExists(container.to_string()))
            }
            Err(e) => Err(StorageError::io(&dir, e)),
        }
    }

    /// Stat the content file; `None` when there is no regular file at the path.
    async fn stat(path: &Path) -> StorageResult<Option<(u64, SystemTime)>> {
        match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => {
                let modified = m.modified().map_err(|e| StorageError::io(path, e))?;
                Ok(Some((m.len(), modified)))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    /// Read the `.prop` sidecar. A missing sidecar is an empty map; an unreadable
    /// one is logged and treated as empty, since metadata never gates access.
    async fn read_prop(&self, container: &str, blob_path: &str) -> StorageResult<Metadata> {
        let prop = self.layout.blob_prop_path(container, blob_path)?;
        match io::read_json::<Metadata>(&prop).await {
            Ok(m) => Ok(m.unwrap_or_default()),
            Err(e @ StorageError::Sidecar { .. }) => {
                warn!(target: "storage", container, blob = blob_path, "ignoring unreadable metadata sidecar: {}", e);
                Ok(Metadata::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn write_prop(&self, container: &str, blob_path: &str, metadata: &Metadata) -> StorageResult<()> {
        let prop = self.layout.blob_prop_path(container, blob_path)?;
        let json = serde_json::to_vec_pretty(metadata)
            .map_err(|source| StorageError::Sidecar { path: prop.display().to_string(), source })?;
        io::write_atomic(&prop, &json).await
    }

    /// Write content and its metadata sidecar, replacing any previous version.
    ///
    /// System fields (`createdBy`, `createdUtc`, `fileName`) are merged under the
    /// caller's metadata, so caller keys win on collision.
    pub async fn save<S, E>(
        &self,
        container: &str,
        blob_path: &str,
        body: S,
        metadata: &Metadata,
        created_by: &str,
    ) -> StorageResult<BlobProperties>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let path = self.physical_path(container, blob_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }
        let written = io::write_stream_atomic(&path, body).await?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut merged = Metadata::new();
        merged.insert(SYS_CREATED_BY, created_by);
        merged.insert(SYS_CREATED_UTC, Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        merged.insert(SYS_FILE_NAME, file_name);
        merged.merge(metadata);
        self.write_prop(container, blob_path, &merged).await?;

        let (size, modified) = Self::stat(&path)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}", container, blob_path)))?;
        debug!(target: "storage", container, blob = blob_path, size, written, "blob saved");
        Ok(BlobProperties { size, last_modified: modified, etag: etag_for(size, modified), metadata: merged })
    }

    /// Properties without opening the content. `None` when the blob does not exist.
    pub async fn properties(&self, container: &str, blob_path: &str) -> StorageResult<Option<BlobProperties>> {
        let path = self.physical_path(container, blob_path)?;
        let Some((size, modified)) = Self::stat(&path).await? else { return Ok(None) };
        let metadata = self.read_prop(container, blob_path).await?;
        Ok(Some(BlobProperties { size, last_modified: modified, etag: etag_for(size, modified), metadata }))
    }

    /// Open a blob for streaming. `None` signals not-found.
    pub async fn get(&self, container: &str, blob_path: &str) -> StorageResult<Option<BlobHandle>> {
        let path = self.physical_path(container, blob_path)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(&path, e)),
        };
        // Stat the handle we will stream from so size and etag describe these bytes.
        let meta = file.metadata().await.map_err(|e| StorageError::io(&path, e))?;
        if !meta.is_file() {
            return Ok(None);
        }
        let modified = meta.modified().map_err(|e| StorageError::io(&path, e))?;
        let size = meta.len();
        let metadata = self.read_prop(container, blob_path).await?;
        Ok(Some(BlobHandle {
            file,
            properties: BlobProperties { size, last_modified: modified, etag: etag_for(size, modified), metadata },
        }))
    }

    /// Metadata map for an existing blob; `None` when the content does not exist.
    pub async fn get_metadata(&self, container: &str, blob_path: &str) -> StorageResult<Option<Metadata>> {
        let path = self.physical_path(container, blob_path)?;
        if Self::stat(&path).await?.is_none() {
            return Ok(None);
        }
        Ok(Some(self.read_prop(container, blob_path).await?))
    }

    /// Merge `metadata` into the sidecar without touching content.
    pub async fn update_metadata(&self, container: &str, blob_path: &str, metadata: &Metadata) -> StorageResult<BlobProperties> {
        let path = self.physical_path(container, blob_path)?;
        let (size, modified) = Self::stat(&path)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}", container, blob_path)))?;
        let mut merged = self.read_prop(container, blob_path).await?;
        merged.merge(metadata);
        self.write_prop(container, blob_path, &merged).await?;
        debug!(target: "storage", container, blob = blob_path, keys = metadata.len(), "metadata updated");
        Ok(BlobProperties { size, last_modified: modified, etag: etag_for(size, modified), metadata: merged })
    }
}
