//! File-index cache
//!
//! Maps a record id to the computed index of its on-disk payload files
//! (total size plus per-file hashes). Bounded by entry count and a
//! time-to-live; concurrent misses on the same key are coalesced by the
//! cache loader so the index is computed once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::record::{DeviceId, RecordId};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to index payload files: {0}")]
    Io(#[from] std::io::Error),
}

/// Computed index of a record's payload directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIndex {
    pub total_size: u64,
    /// `(relative_path, sha256)` per regular file, sorted by path.
    pub files: Vec<(String, String)>,
}

pub struct FileIndexCache {
    data_dir: PathBuf,
    cache: Cache<(DeviceId, RecordId), Arc<FileIndex>>,
}

impl FileIndexCache {
    pub fn new(data_dir: PathBuf, max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();
        Self { data_dir, cache }
    }

    /// Directory holding one record's payload files.
    pub fn record_dir(&self, owner: DeviceId, record_id: RecordId) -> PathBuf {
        self.data_dir.join(owner.to_string()).join(record_id.to_string())
    }

    /// Get the index for a record, computing it at most once per
    /// expiry window even under concurrent callers.
    pub async fn get(
        &self,
        owner: DeviceId,
        record_id: RecordId,
    ) -> Result<Arc<FileIndex>, Arc<CacheError>> {
        let dir = self.record_dir(owner, record_id);
        self.cache
            .try_get_with((owner, record_id), async move {
                debug!(record_id, "computing file index");
                build_index(&dir).await.map(Arc::new)
            })
            .await
    }

    /// Drop a cached index (after payload files changed on disk).
    pub async fn invalidate(&self, owner: DeviceId, record_id: RecordId) {
        self.cache.invalidate(&(owner, record_id)).await;
    }
}

async fn build_index(dir: &Path) -> Result<FileIndex, CacheError> {
    let mut files = Vec::new();
    let mut total_size = 0u64;

    if dir.is_dir() {
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let bytes = tokio::fs::read(entry.path()).await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            total_size += meta.len();
            files.push((name, hex::encode(Sha256::digest(&bytes))));
        }
    }

    files.sort();
    Ok(FileIndex { total_size, files })
}
