//! In-memory history store

use crate::domain::{sort_most_recent_first, JobHistoryEntry, JobHistoryStore};
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemoryHistoryStore {
    entries: RwLock<HashMap<String, JobHistoryEntry>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobHistoryStore for InMemoryHistoryStore {
    async fn record(&self, entry: &JobHistoryEntry) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(entry.job_id.clone(), entry.clone());
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<JobHistoryEntry> {
        self.entries
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| StorageError::entry_not_found(job_id))
    }

    async fn list(&self, limit: Option<usize>) -> Result<Vec<JobHistoryEntry>> {
        let mut entries: Vec<_> = self.entries.read().await.values().cloned().collect();
        sort_most_recent_first(&mut entries);
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    async fn prune(&self, retain: usize) -> Result<usize> {
        let mut guard = self.entries.write().await;
        if guard.len() <= retain {
            return Ok(0);
        }
        let mut entries: Vec<_> = guard.values().cloned().collect();
        sort_most_recent_first(&mut entries);
        let dropped: Vec<String> = entries[retain..].iter().map(|e| e.job_id.clone()).collect();
        for id in &dropped {
            guard.remove(id);
        }
        Ok(dropped.len())
    }
}
