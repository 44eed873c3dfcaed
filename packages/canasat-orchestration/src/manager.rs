//! Job manager: bounded worker pool, duplicate collapsing, cancellation and
//! persisted history.

use crate::config::{HistoryBackend, JobsConfig, PipelineConfig, StorageConfig};
use crate::error::{OrchestratorError, Result};
use crate::job::{Job, JobSnapshot, JobState, JobStateMachine, JobSummary};
use crate::orchestrator::{LogLine, RunLog, WorkflowOrchestrator, WorkflowResult, WorkflowRunner};
use crate::request::WorkflowParams;
use canasat_storage::{
    ErrorKind as StorageErrorKind, InMemoryHistoryStore, JobHistoryEntry, JobHistoryStore,
    JsonFileHistoryStore, SqliteHistoryStore,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobManagerConfig {
    pub max_workers: usize,
    pub history_retention: usize,
    pub log_capacity: usize,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self::from(&JobsConfig::default())
    }
}

impl From<&JobsConfig> for JobManagerConfig {
    fn from(config: &JobsConfig) -> Self {
        Self {
            max_workers: config.max_workers.max(1),
            history_retention: config.history_retention.max(1),
            log_capacity: config.log_capacity,
        }
    }
}

/// Build the configured history backend.
pub fn history_store_from_config(config: &StorageConfig) -> Result<Arc<dyn JobHistoryStore>> {
    let store: Arc<dyn JobHistoryStore> = match config.history_backend {
        HistoryBackend::Json => Arc::new(JsonFileHistoryStore::new(&config.history_path)),
        HistoryBackend::Sqlite => Arc::new(SqliteHistoryStore::open(&config.history_path)?),
        HistoryBackend::Memory => Arc::new(InMemoryHistoryStore::new()),
    };
    Ok(store)
}

struct JobSlot {
    job: Job,
    cancel: CancellationToken,
    state_tx: watch::Sender<JobState>,
}

struct Inner {
    runner: Arc<dyn WorkflowRunner>,
    history: Arc<dyn JobHistoryStore>,
    config: JobManagerConfig,
    permits: Arc<Semaphore>,
    jobs: Mutex<HashMap<String, JobSlot>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Accepts workflow requests and runs them in the background.
///
/// Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    /// Create a manager over `runner`, settling history left behind by a
    /// previous process.
    pub async fn init(
        runner: Arc<dyn WorkflowRunner>,
        history: Arc<dyn JobHistoryStore>,
        config: JobManagerConfig,
    ) -> Result<Self> {
        let interrupted = settle_interrupted(history.as_ref()).await?;
        if interrupted > 0 {
            warn!("Marked {} unfinished job(s) from a previous run as failed", interrupted);
        }
        let pruned = history.prune(config.history_retention).await?;
        if pruned > 0 {
            debug!("Pruned {} old history entries", pruned);
        }

        info!(
            "Job manager ready: {} worker(s), retaining {} finished job(s)",
            config.max_workers, config.history_retention
        );

        Ok(Self {
            inner: Arc::new(Inner {
                runner,
                history,
                permits: Arc::new(Semaphore::new(config.max_workers)),
                config,
                jobs: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Wire the default orchestrator and history backend from configuration.
    pub async fn from_config(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;
        let runner = Arc::new(WorkflowOrchestrator::from_config(config)?);
        let history = history_store_from_config(&config.storage)?;
        Self::init(runner, history, JobManagerConfig::from(&config.jobs)).await
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.inner.config
    }

    /// Queue a run and return its job id.
    ///
    /// A request equal to a pending or running job returns that job's id
    /// instead of starting another run.
    pub async fn submit(&self, params: WorkflowParams) -> Result<String> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(OrchestratorError::invalid_request("job manager is shutting down"));
        }

        let fingerprint = params.fingerprint();
        let (job_id, cancel, entry) = {
            let mut jobs = self.inner.jobs.lock();
            if let Some(existing) = jobs
                .values()
                .find(|slot| slot.job.is_active() && slot.job.fingerprint == fingerprint)
            {
                info!("Request matches active job {}, reusing it", existing.job.id);
                return Ok(existing.job.id.clone());
            }

            let job = Job::new(params, self.inner.config.log_capacity);
            let job_id = job.id.clone();
            let entry = job.to_history_entry()?;
            let cancel = CancellationToken::new();
            let (state_tx, _) = watch::channel(JobState::Pending);
            jobs.insert(
                job_id.clone(),
                JobSlot {
                    job,
                    cancel: cancel.clone(),
                    state_tx,
                },
            );
            (job_id, cancel, entry)
        };

        info!("Job {} submitted", job_id);
        self.inner.record(&entry).await;
        // A cancel may have finalised the job while the pending row was in flight.
        if let Some(settled) = self.inner.terminal_entry(&job_id) {
            self.inner.record(&settled).await;
        }

        let handle = tokio::spawn(run_job(self.inner.clone(), job_id.clone(), cancel));
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);

        Ok(job_id)
    }

    /// Current state of a job, live or from history.
    pub async fn get(&self, job_id: &str) -> Result<JobSnapshot> {
        let live = self.inner.jobs.lock().get(job_id).map(|slot| slot.job.snapshot());
        if let Some(snapshot) = live {
            return Ok(snapshot);
        }
        let entry = self.inner.history_entry(job_id).await?;
        JobSnapshot::from_history(&entry)
    }

    /// Log lines with `seq >= from`. Jobs only present in history have none.
    pub async fn logs_since(&self, job_id: &str, from: u64) -> Result<Vec<LogLine>> {
        let live = self.inner.jobs.lock().get(job_id).map(|slot| slot.job.log.since(from));
        match live {
            Some(lines) => Ok(lines),
            None => {
                self.inner.history_entry(job_id).await?;
                Ok(Vec::new())
            }
        }
    }

    /// Most recent jobs first, optionally only those in `status`; live state
    /// wins over persisted state.
    pub async fn list_history(&self, limit: Option<usize>, status: Option<JobState>) -> Result<Vec<JobSummary>> {
        let mut merged: HashMap<String, JobSummary> = HashMap::new();
        for entry in self.inner.history.list(None).await? {
            match JobSummary::from_history(&entry) {
                Ok(summary) => {
                    merged.insert(summary.job_id.clone(), summary);
                }
                Err(e) => warn!("Skipping unreadable history entry {}: {}", entry.job_id, e),
            }
        }
        for slot in self.inner.jobs.lock().values() {
            merged.insert(slot.job.id.clone(), slot.job.summary());
        }

        let mut summaries: Vec<JobSummary> = merged
            .into_values()
            .filter(|summary| status.map_or(true, |wanted| summary.status == wanted))
            .collect();
        summaries.sort_by(|a, b| {
            b.recency()
                .cmp(&a.recency())
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        if let Some(limit) = limit {
            summaries.truncate(limit);
        }
        Ok(summaries)
    }

    /// Request cancellation.
    ///
    /// Pending jobs fail immediately; running jobs stop at the next step
    /// boundary. Returns `false` when the job had already finished.
    pub async fn cancel(&self, job_id: &str) -> Result<bool> {
        enum Outcome {
            Finalized(Box<JobHistoryEntry>),
            Requested,
            AlreadyFinished,
        }

        let outcome = {
            let mut jobs = self.inner.jobs.lock();
            match jobs.get_mut(job_id) {
                None => None,
                Some(slot) => Some(match slot.job.state {
                    JobState::Pending => {
                        JobStateMachine::new(&mut slot.job).cancel_pending()?;
                        slot.cancel.cancel();
                        slot.state_tx.send_replace(slot.job.state);
                        Outcome::Finalized(Box::new(slot.job.to_history_entry()?))
                    }
                    JobState::Running => {
                        slot.cancel.cancel();
                        Outcome::Requested
                    }
                    JobState::Succeeded | JobState::Failed => Outcome::AlreadyFinished,
                }),
            }
        };

        match outcome {
            Some(Outcome::Finalized(entry)) => {
                info!("Job {} cancelled before start", job_id);
                self.inner.record(&entry).await;
                self.inner.prune().await;
                Ok(true)
            }
            Some(Outcome::Requested) => {
                warn!("Cancellation requested for running job {}", job_id);
                Ok(true)
            }
            Some(Outcome::AlreadyFinished) => Ok(false),
            None => {
                self.inner.history_entry(job_id).await?;
                Ok(false)
            }
        }
    }

    /// Block until the job is terminal or `timeout` elapses.
    pub async fn wait(&self, job_id: &str, timeout: Duration) -> Result<JobSnapshot> {
        let rx = self.inner.jobs.lock().get(job_id).map(|slot| slot.state_tx.subscribe());
        if let Some(mut rx) = rx {
            match tokio::time::timeout(timeout, rx.wait_for(|state| state.is_terminal())).await {
                Err(_) => {
                    return Err(OrchestratorError::Timeout(format!(
                        "job {} not finished after {:?}",
                        job_id, timeout
                    )))
                }
                // Sender dropped: the job was pruned, history has it.
                Ok(Err(_)) => {}
                Ok(Ok(_)) => {}
            }
        }
        self.get(job_id).await
    }

    /// Stop accepting work, cancel everything in flight and wait for workers.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);

        let mut ids = Vec::new();
        for slot in self.inner.jobs.lock().values() {
            if slot.job.is_active() {
                ids.push(slot.job.id.clone());
            }
        }
        for id in &ids {
            if let Err(e) = self.cancel(id).await {
                warn!("Failed to cancel job {} during shutdown: {}", id, e);
            }
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("Job worker ended abnormally: {}", e);
            }
        }
        info!("Job manager stopped ({} job(s) cancelled)", ids.len());
    }
}

impl Inner {
    async fn record(&self, entry: &JobHistoryEntry) {
        if let Err(e) = self.history.record(entry).await {
            warn!("Failed to persist job {}: {}", entry.job_id, e);
        }
    }

    async fn history_entry(&self, job_id: &str) -> Result<JobHistoryEntry> {
        match self.history.get(job_id).await {
            Ok(entry) => Ok(entry),
            Err(e) if e.kind == StorageErrorKind::EntryNotFound => {
                Err(OrchestratorError::JobNotFound(job_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// History row for a live job that has already finished.
    fn terminal_entry(&self, job_id: &str) -> Option<JobHistoryEntry> {
        let jobs = self.jobs.lock();
        let slot = jobs.get(job_id)?;
        if slot.job.is_active() {
            return None;
        }
        match slot.job.to_history_entry() {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Failed to serialise job {}: {}", job_id, e);
                None
            }
        }
    }

    /// Keep history and in-memory terminal jobs within retention.
    async fn prune(&self) {
        let retain = self.config.history_retention;
        if let Err(e) = self.history.prune(retain).await {
            warn!("Failed to prune job history: {}", e);
        }

        let mut jobs = self.jobs.lock();
        let mut finished: Vec<(chrono::DateTime<Utc>, String)> = jobs
            .values()
            .filter(|slot| !slot.job.is_active())
            .map(|slot| (slot.job.recency(), slot.job.id.clone()))
            .collect();
        if finished.len() <= retain {
            return;
        }
        finished.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, id) in finished.into_iter().skip(retain) {
            jobs.remove(&id);
        }
    }

    fn start(&self, job_id: &str) -> Option<(WorkflowParams, RunLog, JobHistoryEntry)> {
        let mut jobs = self.jobs.lock();
        let slot = jobs.get_mut(job_id)?;
        // Cancelled while waiting for a worker.
        JobStateMachine::new(&mut slot.job).start().ok()?;
        slot.state_tx.send_replace(JobState::Running);
        let entry = match slot.job.to_history_entry() {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Failed to serialise job {}: {}", job_id, e);
                JobHistoryEntry::new(job_id, JobState::Running.as_str())
            }
        };
        Some((slot.job.params.clone(), slot.job.log.clone(), entry))
    }

    /// Pool closed under a pending job.
    async fn fail_pending(&self, job_id: &str) {
        let entry = {
            let mut jobs = self.jobs.lock();
            let Some(slot) = jobs.get_mut(job_id) else {
                return;
            };
            if JobStateMachine::new(&mut slot.job).cancel_pending().is_err() {
                return;
            }
            slot.state_tx.send_replace(slot.job.state);
            slot.job.to_history_entry()
        };
        if let Ok(entry) = entry {
            self.record(&entry).await;
        }
    }

    async fn finish(&self, job_id: &str, outcome: Result<WorkflowResult>) {
        let entry = {
            let mut jobs = self.jobs.lock();
            let Some(slot) = jobs.get_mut(job_id) else {
                return;
            };
            let mut sm = JobStateMachine::new(&mut slot.job);
            let transition = match outcome {
                Ok(result) => {
                    info!(
                        "Job {} succeeded: scene {}, {} index(es)",
                        job_id,
                        result.scene.id(),
                        result.succeeded_indices().len()
                    );
                    sm.succeed(result)
                }
                Err(e) => {
                    warn!("Job {} failed: {}", job_id, e);
                    sm.fail(&e)
                }
            };
            if let Err(e) = transition {
                warn!("Job {} could not be finalised: {}", job_id, e);
            }
            slot.state_tx.send_replace(slot.job.state);
            slot.job.to_history_entry()
        };

        match entry {
            Ok(entry) => self.record(&entry).await,
            Err(e) => warn!("Failed to serialise job {}: {}", job_id, e),
        }
        self.prune().await;
    }
}

async fn run_job(inner: Arc<Inner>, job_id: String, cancel: CancellationToken) {
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        permit = inner.permits.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                inner.fail_pending(&job_id).await;
                return;
            }
        },
    };

    let Some((params, log, entry)) = inner.start(&job_id) else {
        return;
    };
    debug!("Job {} started", job_id);
    inner.record(&entry).await;

    let runner = inner.runner.clone();
    let token = cancel.clone();
    let outcome = match tokio::spawn(async move { runner.run(&params, &log, &token).await }).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(OrchestratorError::internal("workflow panicked")),
        Err(_) => Err(OrchestratorError::internal("workflow task aborted")),
    };

    inner.finish(&job_id, outcome).await;
    drop(permit);
}

/// Rewrite non-terminal history rows as failed.
async fn settle_interrupted(history: &dyn JobHistoryStore) -> Result<usize> {
    let mut settled = 0;
    for mut entry in history.list(None).await? {
        let active = JobState::from_str(&entry.status).map(|s| !s.is_terminal()).unwrap_or(false);
        if !active {
            continue;
        }
        let now = Utc::now();
        entry.status = JobState::Failed.as_str().to_string();
        entry.error = Some("internal error: interrupted by restart".to_string());
        entry.error_kind = Some(crate::error::ErrorKind::Internal.as_str().to_string());
        entry.finished_at = Some(now);
        entry.updated_at = now;
        history.record(&entry).await?;
        settled += 1;
    }
    Ok(settled)
}
