//! Domain layer for job history persistence
//!
//! # Domain Models
//!
//! - `JobHistoryEntry`: terminal (or last-known) summary of one job
//!
//! # Port Trait
//!
//! - `JobHistoryStore`: bounded history, most recent first
//!
//! # Examples
//!
//! ```rust,ignore
//! use canasat_storage::domain::{JobHistoryEntry, JobHistoryStore};
//!
//! async fn example(store: impl JobHistoryStore) -> Result<()> {
//!     store.record(&entry).await?;
//!     let recent = store.list(Some(20)).await?;
//!     store.prune(500).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

// ═══════════════════════════════════════════════════════════════════════════
// Domain Models
// ═══════════════════════════════════════════════════════════════════════════

/// Persisted summary of a job.
///
/// `params` and `result` are opaque JSON owned by the orchestration layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHistoryEntry {
    pub job_id: String,
    pub status: String,
    #[serde(default)]
    pub product: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub result: serde_json::Value,
}

impl JobHistoryEntry {
    pub fn new(job_id: impl Into<String>, status: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            status: status.into(),
            product: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
            error: None,
            error_kind: None,
            params: serde_json::Value::Null,
            result: serde_json::Value::Null,
        }
    }

    /// Recency used for ordering: finished, else last update.
    pub fn recency(&self) -> DateTime<Utc> {
        self.finished_at.unwrap_or(self.updated_at)
    }
}

/// Most recent first; ties broken by job id for a stable order.
pub fn sort_most_recent_first(entries: &mut [JobHistoryEntry]) {
    entries.sort_by(|a, b| {
        b.recency()
            .cmp(&a.recency())
            .then_with(|| a.job_id.cmp(&b.job_id))
    });
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait
// ═══════════════════════════════════════════════════════════════════════════

/// Bounded job history.
#[async_trait]
pub trait JobHistoryStore: Send + Sync {
    /// Insert or replace the entry with the same `job_id`.
    async fn record(&self, entry: &JobHistoryEntry) -> Result<()>;

    /// Fetch one entry (`EntryNotFound` if absent).
    async fn get(&self, job_id: &str) -> Result<JobHistoryEntry>;

    /// Most recent first, at most `limit` entries.
    async fn list(&self, limit: Option<usize>) -> Result<Vec<JobHistoryEntry>>;

    /// Keep the `retain` most recent entries. Returns how many were dropped.
    async fn prune(&self, retain: usize) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_recency_prefers_finished_at() {
        let mut e = JobHistoryEntry::new("a", "succeeded");
        let finished = e.updated_at + Duration::seconds(5);
        assert_eq!(e.recency(), e.updated_at);
        e.finished_at = Some(finished);
        assert_eq!(e.recency(), finished);
    }

    #[test]
    fn test_sort_most_recent_first() {
        let base = Utc::now();
        let mut old = JobHistoryEntry::new("old", "failed");
        old.updated_at = base - Duration::minutes(10);
        let mut new = JobHistoryEntry::new("new", "succeeded");
        new.finished_at = Some(base);
        let mut mid = JobHistoryEntry::new("mid", "running");
        mid.updated_at = base - Duration::minutes(1);

        let mut entries = vec![old, new, mid];
        sort_most_recent_first(&mut entries);
        let ids: Vec<_> = entries.iter().map(|e| e.job_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn test_entry_json_tolerates_missing_optionals() {
        let json = r#"{
            "job_id": "j1",
            "status": "succeeded",
            "created_at": "2024-08-15T10:00:00Z",
            "updated_at": "2024-08-15T10:05:00Z"
        }"#;
        let entry: JobHistoryEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.job_id, "j1");
        assert!(entry.finished_at.is_none());
        assert!(entry.params.is_null());
    }
}
