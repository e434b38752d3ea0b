//! Publish-on-close file writes. Content and sidecars are written to a hidden
//! sibling temp file and renamed over the destination only once fully flushed, so
//! a reader sees either the old file or the new one, never a partial write.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;

use crate::error::{StorageError, StorageResult};

pub(crate) fn temp_sibling(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.{}.partial", name, uuid::Uuid::new_v4().simple()))
}

/// Removes the temp file when dropped unless the write was published. Covers
/// error returns and futures dropped mid-upload alike.
struct TempGuard {
    path: PathBuf,
    armed: bool,
}

impl TempGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

async fn publish(guard: &mut TempGuard, dest: &Path) -> StorageResult<()> {
    tokio::fs::rename(&guard.path, dest)
        .await
        .map_err(|e| StorageError::io(dest, e))?;
    guard.disarm();
    Ok(())
}

/// Stream `body` into `dest`. Returns the number of bytes written.
pub(crate) async fn write_stream_atomic<S, E>(dest: &Path, mut body: S) -> StorageResult<u64>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut guard = TempGuard::new(temp_sibling(dest));
    let written = {
        let mut f = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&guard.path)
            .await
            .map_err(|e| StorageError::io(&guard.path, e))?;
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| StorageError::Upload(e.to_string()))?;
            f.write_all(&chunk).await.map_err(|e| StorageError::io(&guard.path, e))?;
            written += chunk.len() as u64;
        }
        f.flush().await.map_err(|e| StorageError::io(&guard.path, e))?;
        f.sync_all().await.map_err(|e| StorageError::io(&guard.path, e))?;
        written
    };
    publish(&mut guard, dest).await?;
    Ok(written)
}

/// Replace `dest` with `bytes`.
pub(crate) async fn write_atomic(dest: &Path, bytes: &[u8]) -> StorageResult<()> {
    let mut guard = TempGuard::new(temp_sibling(dest));
    {
        let mut f = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&guard.path)
            .await
            .map_err(|e| StorageError::io(&guard.path, e))?;
        f.write_all(bytes).await.map_err(|e| StorageError::io(&guard.path, e))?;
        f.sync_all().await.map_err(|e| StorageError::io(&guard.path, e))?;
    }
    publish(&mut guard, dest).await
}

/// Read and parse a JSON sidecar. Missing file -> Ok(None).
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
    let raw = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| StorageError::Sidecar { path: path.display().to_string(), source })
}
