//! Inspection of snapshots already present in the download directory.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::artifact::SnapshotArtifact;
use crate::error::FinderError;

/// Newest full snapshot found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSnapshot {
    pub path: PathBuf,
    pub slot: u64,
}

/// Find the most recently modified full snapshot in `dir`.
///
/// Only `snapshot-*tar*` files are considered. If the newest one has an
/// unparsable name this reports nothing rather than falling back to an older
/// file.
pub fn latest_full_snapshot(dir: &Path) -> Option<LocalSnapshot> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("can't read snapshot dir {}: {}", dir.display(), e);
            return None;
        }
    };

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with("snapshot-") || !name.contains("tar") {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
            newest = Some((modified, entry.path()));
        }
    }

    let (_, path) = newest?;
    let name = path.file_name()?.to_str()?;
    match SnapshotArtifact::parse_full(name) {
        Some(artifact) => Some(LocalSnapshot {
            slot: artifact.slot,
            path,
        }),
        None => {
            tracing::warn!(
                "could not parse slot from local snapshot {}; it will not be used for incremental matching",
                path.display()
            );
            None
        }
    }
}

/// Slot of the newest local full snapshot, 0 when there is none.
pub fn local_full_slot(dir: &Path) -> u64 {
    latest_full_snapshot(dir).map(|s| s.slot).unwrap_or(0)
}

/// Create `dir` and confirm files can be written to it.
pub fn ensure_writable(dir: &Path) -> Result<(), FinderError> {
    std::fs::create_dir_all(dir).map_err(|e| FinderError::resource(dir, e))?;

    let marker = dir.join(".write_perm_test");
    std::fs::write(&marker, b"test").map_err(|e| FinderError::resource(&marker, e))?;
    std::fs::remove_file(&marker).map_err(|e| FinderError::resource(&marker, e))?;
    Ok(())
}

/// [`local_full_slot`] on the blocking pool.
pub async fn local_full_slot_blocking(dir: PathBuf) -> u64 {
    match tokio::task::spawn_blocking(move || local_full_slot(&dir)).await {
        Ok(slot) => slot,
        Err(e) => {
            tracing::warn!("local snapshot scan failed: {}", e);
            0
        }
    }
}

/// [`ensure_writable`] on the blocking pool.
pub async fn ensure_writable_blocking(dir: PathBuf) -> Result<(), FinderError> {
    let target = dir.clone();
    tokio::task::spawn_blocking(move || ensure_writable(&target))
        .await
        .map_err(|e| FinderError::resource(&dir, std::io::Error::other(e)))?
}
