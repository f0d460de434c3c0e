//! Atomic JSON file writes.
//!
//! Write-temp-then-rename: the full pretty-printed document goes to a
//! uniquely named sibling file, is flushed and fsynced, then renamed over
//! the target. Rename is atomic within the containing filesystem, so a
//! reader sees either the prior committed bytes or the new complete bytes,
//! never a truncated prefix. After the rename the parent directory is
//! fsynced best-effort.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::StoreError;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Atomically replace `path` with the pretty-printed JSON of `value`.
///
/// The rename+fsync sequence is synchronous and runs on the blocking pool.
///
/// # Errors
/// Propagates serialization and I/O failures; a failed parent-directory
/// fsync is logged and ignored.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || write_bytes_atomic(&path, &bytes))
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
    Ok(())
}

fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = tmp_path(path);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    if let Some(parent) = path.parent() {
        if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
            tracing::debug!(dir = %parent.display(), error = %e, "parent directory fsync failed");
        }
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let name = path
        .file_name()
        .map_or_else(|| "state".to_owned(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!("{name}.tmp.{pid}.{seq}"))
}
