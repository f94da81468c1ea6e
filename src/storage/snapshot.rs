//! On-disk JSON snapshots of upstream content.
//!
//! Every successful CMS read is written to `<dir>/<key>.json` so the last
//! known-good copy survives restarts and upstream outages.
//!
//! # Atomicity
//!
//! Writes go to a uniquely named temporary file in the snapshot directory and
//! are then renamed over the target. Readers observe either the previous or
//! the new complete file, never a partial one. Concurrent writers of the same
//! key race on the rename; the last one wins.
//!
//! # Key Validation
//!
//! Keys become file names. Empty keys, keys containing path separators and
//! keys containing `..` are rejected.
//!
//! # Async Callers
//!
//! [`SnapshotStore::save_async`] and [`SnapshotStore::load_async`] run the
//! file I/O on tokio's blocking pool and are what request paths use. The
//! synchronous variants are for CLI commands and threads outside a runtime.

use crate::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Maximum snapshot file size accepted by [`SnapshotStore::load`] (16MB).
const MAX_SNAPSHOT_SIZE: u64 = 16 * 1024 * 1024;

/// Where a returned value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Fetched from upstream just now, or a memory hit within TTL.
    Fresh,
    /// Last known-good copy; a refresh may be running in the background.
    Stale,
    /// Nothing was available; a static placeholder was returned.
    Placeholder,
}

impl Freshness {
    /// Returns the lowercase name used in headers and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Placeholder => "placeholder",
        }
    }
}

/// Result of [`SnapshotStore::snapshot_first`].
#[derive(Debug)]
pub struct Snapshotted<T> {
    /// The returned value.
    pub value: T,
    /// Whether the value came from disk or from the fetcher.
    pub freshness: Freshness,
    /// Background refresh task, present only when a snapshot was served.
    pub refresh: Option<JoinHandle<()>>,
}

/// Disk-backed snapshot store.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: Arc<PathBuf>,
}

impl SnapshotStore {
    /// Creates a store rooted at `dir`, creating the directory best-effort.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = fs::create_dir_all(&dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to create snapshot directory");
        }
        Self { dir: Arc::new(dir) }
    }

    /// Returns the snapshot directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the file path for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the key is empty or could escape the
    /// snapshot directory.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        if !is_valid_key(key) {
            return Err(Error::InvalidInput(format!("invalid snapshot key: {key:?}")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    /// Serializes `value` and atomically replaces the snapshot for `key`.
    ///
    /// Failures are logged and swallowed; a failed snapshot write must never
    /// fail the request that produced the data.
    pub fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        let result = encode(value).and_then(|json| self.write_atomic(key, &json));
        record_save(key, result);
    }

    /// [`save`](Self::save) with the write moved to the blocking pool.
    ///
    /// The value is serialized on the calling task.
    pub async fn save_async<T: Serialize + Sync + ?Sized>(&self, key: &str, value: &T) {
        let result = match encode(value) {
            Ok(json) => {
                let store = self.clone();
                let owned_key = key.to_string();
                tokio::task::spawn_blocking(move || store.write_atomic(&owned_key, &json))
                    .await
                    .map_err(|e| Error::operation("snapshot_write_task", e))
                    .and_then(|written| written)
            },
            Err(e) => Err(e),
        };
        record_save(key, result);
    }

    fn write_atomic(&self, key: &str, json: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;

        // The directory may have been removed since construction.
        fs::create_dir_all(self.dir.as_path())
            .map_err(|e| Error::operation("create_snapshot_dir", e))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{key}."))
            .suffix(".tmp")
            .tempfile_in(self.dir.as_path())
            .map_err(|e| Error::operation("create_snapshot_tmp", e))?;
        tmp.write_all(json)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| Error::operation("write_snapshot_tmp", e))?;
        tmp.persist(&path)
            .map_err(|e| Error::operation("persist_snapshot", e.error))?;
        Ok(())
    }

    /// Loads the snapshot for `key`.
    ///
    /// Returns `None` if the key is invalid, the file is missing, oversized or
    /// does not decode as `T`.
    #[must_use]
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.path_for(key).ok()?;
        let metadata = fs::metadata(&path).ok()?;
        if metadata.len() > MAX_SNAPSHOT_SIZE {
            tracing::warn!(key, size = metadata.len(), "Snapshot exceeds size limit");
            return None;
        }
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "Snapshot is not valid JSON for the requested type");
                None
            },
        }
    }

    /// [`load`](Self::load) with the read moved to the blocking pool.
    pub async fn load_async<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let store = self.clone();
        let owned_key = key.to_string();
        match tokio::task::spawn_blocking(move || store.load::<T>(&owned_key)).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, error = %e, "Snapshot read task failed");
                None
            },
        }
    }

    /// Deletes the snapshot for `key`. Returns `true` if a file was removed.
    pub fn remove(&self, key: &str) -> bool {
        self.path_for(key)
            .ok()
            .is_some_and(|path| fs::remove_file(path).is_ok())
    }

    /// Stale-while-revalidate read.
    ///
    /// - A snapshot exists: it is returned immediately as [`Freshness::Stale`]
    ///   and `fetcher` runs in a detached task that saves a `Some` result.
    /// - No snapshot: `fetcher` is awaited, a `Some` result is saved and
    ///   returned as [`Freshness::Fresh`].
    /// - No snapshot and nothing fetched: `None`.
    ///
    /// Fetcher errors are logged, never surfaced.
    pub async fn snapshot_first<T, F, Fut>(&self, key: &str, fetcher: F) -> Option<Snapshotted<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        if let Some(value) = self.load_async::<T>(key).await {
            metrics::counter!("snapshot_reads_total", "result" => "hit").increment(1);
            let store = self.clone();
            let owned_key = key.to_string();
            let refresh = fetcher();
            let handle = tokio::spawn(async move {
                match refresh.await {
                    Ok(Some(fresh)) => store.save_async(&owned_key, &fresh).await,
                    Ok(None) => {
                        tracing::debug!(key = %owned_key, "Background refresh returned nothing");
                    },
                    Err(e) => {
                        tracing::debug!(key = %owned_key, error = %e, "Background refresh failed");
                    },
                }
            });
            return Some(Snapshotted {
                value,
                freshness: Freshness::Stale,
                refresh: Some(handle),
            });
        }

        metrics::counter!("snapshot_reads_total", "result" => "miss").increment(1);
        match fetcher().await {
            Ok(Some(value)) => {
                self.save_async(key, &value).await;
                Some(Snapshotted {
                    value,
                    freshness: Freshness::Fresh,
                    refresh: None,
                })
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Fetch failed with no snapshot to fall back on");
                None
            },
        }
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::operation("serialize_snapshot", e))
}

fn record_save(key: &str, result: Result<()>) {
    match result {
        Ok(()) => {
            metrics::counter!("snapshot_writes_total", "status" => "success").increment(1);
            tracing::debug!(key, "Saved snapshot");
        },
        Err(e) => {
            metrics::counter!("snapshot_writes_total", "status" => "error").increment(1);
            tracing::warn!(key, error = %e, "Failed to save snapshot");
        },
    }
}

/// Checks that a key is usable as a file stem inside the snapshot directory.
fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 200
        && !key.contains(['/', '\\', '\0'])
        && !key.contains("..")
}
