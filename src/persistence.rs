//! Cache snapshots on disk.
//!
//! The snapshot is a versioned JSON document holding every cache entry with
//! its absolute expiry. It is written to a temporary file and renamed into
//! place so a crash never leaves a truncated snapshot behind.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheKey, CacheSnapshot};
use crate::error::Result;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    saved_at: SystemTime,
    entries: Vec<PersistedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    key: CacheKey,
    entry: CacheEntry,
}

/// Load a snapshot from `path`.
///
/// A missing or empty file is an empty snapshot. An unreadable or corrupt
/// file is an error; callers start with an empty cache in that case.
pub async fn load(path: &Path) -> Result<CacheSnapshot> {
    let data = match fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No cache snapshot, starting empty");
            return Ok(CacheSnapshot::default());
        }
        Err(e) => return Err(e.into()),
    };

    if data.iter().all(u8::is_ascii_whitespace) {
        debug!(path = %path.display(), "Cache snapshot is empty");
        return Ok(CacheSnapshot::default());
    }

    let file: SnapshotFile = serde_json::from_slice(&data)?;
    if file.version != SNAPSHOT_VERSION {
        warn!(
            path = %path.display(),
            version = file.version,
            "Unsupported cache snapshot version, ignoring"
        );
        return Ok(CacheSnapshot::default());
    }

    Ok(CacheSnapshot {
        entries: file
            .entries
            .into_iter()
            .map(|persisted| (persisted.key, persisted.entry))
            .collect(),
    })
}

/// Write `snapshot` to `path` atomically.
pub async fn save(path: &Path, snapshot: CacheSnapshot) -> Result<()> {
    let file = SnapshotFile {
        version: SNAPSHOT_VERSION,
        saved_at: SystemTime::now(),
        entries: snapshot
            .entries
            .into_iter()
            .map(|(key, entry)| PersistedEntry { key, entry })
            .collect(),
    };
    let data = serde_json::to_vec(&file)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = temp_path(path);
    fs::write(&temp_path, &data).await?;
    fs::rename(&temp_path, path).await?;

    debug!(
        path = %path.display(),
        entries = file.entries.len(),
        bytes = data.len(),
        "Saved cache snapshot"
    );
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("cache"));
    name.push(".tmp");
    path.with_file_name(name)
}
