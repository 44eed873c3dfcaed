//! SQLite adapter for JobHistoryStore
//!
//! One row per job: the full entry as JSON plus a sortable recency column.
//! Statements run on the blocking pool behind a connection mutex.

use crate::domain::{JobHistoryEntry, JobHistoryStore};
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use chrono::SecondsFormat;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS job_history (
    job_id   TEXT PRIMARY KEY,
    recency  TEXT NOT NULL,
    body     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_job_history_recency ON job_history (recency DESC);
";

pub struct SqliteHistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn new_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StorageError::database("SQLite connection mutex poisoned"))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::database(format!("SQLite task failed: {}", e)))?
    }
}

/// Fixed-width UTC timestamp so text order equals time order.
fn recency_key(entry: &JobHistoryEntry) -> String {
    entry.recency().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode(body: String) -> Result<JobHistoryEntry> {
    Ok(serde_json::from_str(&body)?)
}

#[async_trait]
impl JobHistoryStore for SqliteHistoryStore {
    async fn record(&self, entry: &JobHistoryEntry) -> Result<()> {
        let job_id = entry.job_id.clone();
        let recency = recency_key(entry);
        let body = serde_json::to_string(entry)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO job_history (job_id, recency, body) VALUES (?1, ?2, ?3)
                 ON CONFLICT(job_id) DO UPDATE SET recency = excluded.recency, body = excluded.body",
                params![job_id, recency, body],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, job_id: &str) -> Result<JobHistoryEntry> {
        let id = job_id.to_string();
        let body: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT body FROM job_history WHERE job_id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        match body {
            Some(body) => decode(body),
            None => Err(StorageError::entry_not_found(job_id)),
        }
    }

    async fn list(&self, limit: Option<usize>) -> Result<Vec<JobHistoryEntry>> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let bodies: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT body FROM job_history ORDER BY recency DESC, job_id ASC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], |row| row.get::<_, String>(0))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;
        bodies.into_iter().map(decode).collect()
    }

    async fn prune(&self, retain: usize) -> Result<usize> {
        let retain = retain as i64;
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM job_history WHERE job_id NOT IN (
                     SELECT job_id FROM job_history ORDER BY recency DESC, job_id ASC LIMIT ?1
                 )",
                params![retain],
            )?;
            Ok(removed)
        })
        .await
    }
}
