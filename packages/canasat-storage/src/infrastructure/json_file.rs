//! History kept as one JSON array on disk.
//!
//! Every mutation rewrites the whole document through the same atomic
//! write the artifact cache uses. An unreadable document is logged and
//! treated as empty rather than failing the caller.

use crate::cache::write_atomic;
use crate::domain::{sort_most_recent_first, JobHistoryEntry, JobHistoryStore};
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

pub struct JsonFileHistoryStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl JsonFileHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<JobHistoryEntry>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io("reading job history", e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        match serde_json::from_slice::<Vec<JobHistoryEntry>>(&bytes) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                warn!(error = %e, "job history file is unreadable, starting empty");
                Ok(Vec::new())
            }
        }
    }

    async fn store(&self, entries: &[JobHistoryEntry]) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        write_atomic(&self.path, bytes).await
    }
}

#[async_trait]
impl JobHistoryStore for JsonFileHistoryStore {
    async fn record(&self, entry: &JobHistoryEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        match entries.iter_mut().find(|e| e.job_id == entry.job_id) {
            Some(existing) => *existing = entry.clone(),
            None => entries.push(entry.clone()),
        }
        sort_most_recent_first(&mut entries);
        self.store(&entries).await
    }

    async fn get(&self, job_id: &str) -> Result<JobHistoryEntry> {
        self.load()
            .await?
            .into_iter()
            .find(|e| e.job_id == job_id)
            .ok_or_else(|| StorageError::entry_not_found(job_id))
    }

    async fn list(&self, limit: Option<usize>) -> Result<Vec<JobHistoryEntry>> {
        let mut entries = self.load().await?;
        sort_most_recent_first(&mut entries);
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    async fn prune(&self, retain: usize) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        if entries.len() <= retain {
            return Ok(0);
        }
        sort_most_recent_first(&mut entries);
        let dropped = entries.len() - retain;
        entries.truncate(retain);
        self.store(&entries).await?;
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn entry(id: &str, minutes_ago: i64) -> JobHistoryEntry {
        let mut e = JobHistoryEntry::new(id, "succeeded");
        e.finished_at = Some(Utc::now() - Duration::minutes(minutes_ago));
        e.product = Some(format!("S2A_{}", id));
        e
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileHistoryStore::new(dir.path().join("jobs_history.json"));
        assert!(store.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs_history.json");
        {
            let store = JsonFileHistoryStore::new(&path);
            store.record(&entry("a", 5)).await.unwrap();
            store.record(&entry("b", 1)).await.unwrap();
        }
        let reopened = JsonFileHistoryStore::new(&path);
        let listed = reopened.list(Some(1)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].job_id, "b");
        assert_eq!(reopened.get("a").await.unwrap().product.as_deref(), Some("S2A_a"));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs_history.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = JsonFileHistoryStore::new(&path);
        assert!(store.list(None).await.unwrap().is_empty());
        store.record(&entry("fresh", 0)).await.unwrap();
        assert_eq!(store.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_prune_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs_history.json");
        let store = JsonFileHistoryStore::new(&path);
        for i in 0..5 {
            store.record(&entry(&format!("j{}", i), 10 - i)).await.unwrap();
        }
        assert_eq!(store.prune(3).await.unwrap(), 2);

        let raw: Vec<JobHistoryEntry> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let ids: Vec<_> = raw.iter().map(|e| e.job_id.as_str()).collect();
        assert_eq!(ids, vec!["j4", "j3", "j2"]);
    }
}
