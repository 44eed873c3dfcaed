//! Filesystem-backed, content-addressed artifact cache.
//!
//! The key is the index and the file is the slot. Slots are written once
//! through a temporary file and an atomic rename, and are re-validated on
//! every read. Concurrent requests for one key are single-flight: the first
//! caller computes, later callers wait and reuse its file.

pub mod key;

use crate::error::{Result, StorageError};
use crate::sync::KeyedLocks;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

pub use key::{sanitize_component, ArtifactKind, CacheKey, Fingerprint, FingerprintBuilder};

/// Prefix of in-progress slot files.
const PARTIAL_PREFIX: &str = ".partial-";

/// Where a returned artifact came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactOrigin {
    /// Valid slot found
    Hit,
    /// Computed by this call
    Computed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifact {
    pub path: PathBuf,
    pub origin: ArtifactOrigin,
}

impl CachedArtifact {
    pub fn is_hit(&self) -> bool {
        self.origin == ArtifactOrigin::Hit
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub computations: u64,
    pub corrupt_evictions: u64,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    computations: AtomicU64,
    corrupt_evictions: AtomicU64,
}

pub struct ArtifactCache {
    root: PathBuf,
    locks: KeyedLocks,
    counters: CacheCounters,
}

impl ArtifactCache {
    /// Open (creating if needed) a cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| StorageError::io(format!("creating cache root {}", root.display()), e))?;
        Ok(Self {
            root,
            locks: KeyedLocks::new(),
            counters: CacheCounters::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slot_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    /// Validated slot for `key`, if any. Does not compute.
    pub async fn lookup(&self, key: &CacheKey) -> Result<Option<PathBuf>> {
        let slot = self.slot_path(key);
        self.validate_slot(key, &slot).await
    }

    /// Return the slot for `key`, running `compute` to fill it on a miss.
    ///
    /// `compute` produces the artifact bytes. Its error is returned to this
    /// caller only; a waiting caller then retries the computation itself.
    pub async fn get_or_compute<F, Fut, E>(&self, key: &CacheKey, compute: F) -> std::result::Result<CachedArtifact, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Vec<u8>, E>>,
        E: From<StorageError>,
    {
        let slot = self.slot_path(key);

        if let Some(path) = self.validate_slot(key, &slot).await? {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(artifact = %key, "cache hit");
            return Ok(CachedArtifact {
                path,
                origin: ArtifactOrigin::Hit,
            });
        }

        let _guard = self.locks.lock(&key.storage_key()).await;

        // A leader may have filled the slot while we waited.
        if let Some(path) = self.validate_slot(key, &slot).await? {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(artifact = %key, "cache hit after waiting for in-flight computation");
            return Ok(CachedArtifact {
                path,
                origin: ArtifactOrigin::Hit,
            });
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!(artifact = %key, "cache miss, computing");

        let bytes = compute().await?;
        if bytes.is_empty() {
            return Err(StorageError::config(format!("refusing to cache empty artifact {}", key)).into());
        }
        write_atomic(&slot, bytes).await?;
        self.counters.computations.fetch_add(1, Ordering::Relaxed);

        Ok(CachedArtifact {
            path: slot,
            origin: ArtifactOrigin::Computed,
        })
    }

    /// Remove the slot for `key`. Returns whether a file was removed.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        let slot = self.slot_path(key);
        let _guard = self.locks.lock(&key.storage_key()).await;
        match tokio::fs::remove_file(&slot).await {
            Ok(()) => {
                self.counters.corrupt_evictions.fetch_add(1, Ordering::Relaxed);
                warn!(artifact = %key, "invalidated cached artifact");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(format!("removing slot for {}", key), e)),
        }
    }

    /// Delete partial files left behind by interrupted writers.
    pub async fn sweep_temporaries(&self) -> Result<usize> {
        let root = self.root.clone();
        let removed = tokio::task::spawn_blocking(move || sweep_dir(&root))
            .await
            .map_err(|e| StorageError::config(format!("sweep task failed: {}", e)))??;
        if removed > 0 {
            info!(removed, "removed partial cache files");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            computations: self.counters.computations.load(Ordering::Relaxed),
            corrupt_evictions: self.counters.corrupt_evictions.load(Ordering::Relaxed),
        }
    }

    /// Existing non-empty regular file, or `None`. Empty or non-file slots
    /// are evicted.
    async fn validate_slot(&self, key: &CacheKey, slot: &Path) -> Result<Option<PathBuf>> {
        match tokio::fs::metadata(slot).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(Some(slot.to_path_buf())),
            Ok(meta) => {
                let err = StorageError::cache_corruption(
                    key.to_string(),
                    if meta.is_file() { "empty file" } else { "not a regular file" },
                );
                warn!(error = %err, "evicting cache slot");
                self.counters.corrupt_evictions.fetch_add(1, Ordering::Relaxed);
                let removal = if meta.is_dir() {
                    tokio::fs::remove_dir_all(slot).await
                } else {
                    tokio::fs::remove_file(slot).await
                };
                if let Err(e) = removal {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(StorageError::io(format!("evicting slot for {}", key), e));
                    }
                }
                Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(format!("checking slot for {}", key), e)),
        }
    }
}

/// Write through a sibling temporary file, then rename into place.
pub async fn write_atomic(path: &Path, bytes: Vec<u8>) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic_blocking(&path, &bytes))
        .await
        .map_err(|e| StorageError::config(format!("write task failed: {}", e)))?
}

pub fn write_atomic_blocking(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::config(format!("slot {} has no parent", path.display())))?;
    std::fs::create_dir_all(parent)
        .map_err(|e| StorageError::io(format!("creating {}", parent.display()), e))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(PARTIAL_PREFIX)
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(|e| StorageError::io("creating temporary slot", e))?;
    tmp.write_all(bytes)
        .map_err(|e| StorageError::io("writing temporary slot", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StorageError::io("syncing temporary slot", e))?;
    tmp.persist(path)
        .map_err(|e| StorageError::io(format!("publishing {}", path.display()), e.error))?;
    Ok(())
}

fn sweep_dir(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(StorageError::io(format!("reading {}", dir.display()), e)),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            removed += sweep_dir(&path)?;
        } else if entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(PARTIAL_PREFIX))
        {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
