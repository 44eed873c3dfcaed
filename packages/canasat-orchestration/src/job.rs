use crate::error::{ErrorCategory, ErrorKind, OrchestratorError, Result};
use crate::orchestrator::{LogLine, RunLog, WorkflowResult};
use crate::request::WorkflowParams;
use canasat_storage::{Fingerprint, JobHistoryEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job lifecycle: Pending -> Running -> {Succeeded, Failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            _ => Err(OrchestratorError::serialization(format!("Invalid job state: {}", s))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Redacted terminal error shown to pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub category: ErrorCategory,
    pub retryable: bool,
    pub message: String,
}

impl From<&OrchestratorError> for JobError {
    fn from(err: &OrchestratorError) -> Self {
        Self {
            kind: err.kind(),
            category: err.category(),
            retryable: err.is_retryable(),
            message: err.summary(),
        }
    }
}

/// Job model
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub params: WorkflowParams,
    /// Identity for duplicate detection
    pub fingerprint: Fingerprint,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub product: Option<String>,
    pub error: Option<JobError>,
    pub result: Option<WorkflowResult>,
    pub log: RunLog,
}

impl Job {
    pub fn new(params: WorkflowParams, log_capacity: usize) -> Self {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            fingerprint: params.fingerprint(),
            log: RunLog::for_job(&id, log_capacity),
            id,
            params,
            state: JobState::Pending,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
            product: None,
            error: None,
            result: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Ordering key for history: finished, else updated, else created.
    pub fn recency(&self) -> DateTime<Utc> {
        self.finished_at.unwrap_or(self.updated_at.max(self.created_at))
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id.clone(),
            status: self.state,
            params: Some(self.params.clone()),
            product: self.product.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            updated_at: self.updated_at,
            logs: self.log.lines(),
            error: self.error.clone(),
            result: self.result.clone(),
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.id.clone(),
            status: self.state,
            product: self.product.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
            updated_at: self.updated_at,
        }
    }

    pub fn to_history_entry(&self) -> Result<JobHistoryEntry> {
        let params = serde_json::to_value(&self.params).map_err(OrchestratorError::serialization)?;
        let result = match &self.result {
            Some(r) => serde_json::to_value(r).map_err(OrchestratorError::serialization)?,
            None => serde_json::Value::Null,
        };
        Ok(JobHistoryEntry {
            job_id: self.id.clone(),
            status: self.state.as_str().to_string(),
            product: self.product.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            updated_at: self.updated_at,
            error: self.error.as_ref().map(|e| e.message.clone()),
            error_kind: self.error.as_ref().map(|e| e.kind.as_str().to_string()),
            params,
            result,
        })
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobState,
    pub params: Option<WorkflowParams>,
    pub product: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub logs: Vec<LogLine>,
    pub error: Option<JobError>,
    pub result: Option<WorkflowResult>,
}

impl JobSnapshot {
    /// Rebuild from persisted history. Logs are not persisted.
    pub fn from_history(entry: &JobHistoryEntry) -> Result<Self> {
        let status = JobState::from_str(&entry.status)?;
        let error = match (&entry.error, &entry.error_kind) {
            (Some(message), kind) => {
                let kind = kind
                    .as_deref()
                    .and_then(|k| ErrorKind::from_str(k).ok())
                    .unwrap_or(ErrorKind::Internal);
                let category = kind.category();
                Some(JobError {
                    kind,
                    category,
                    retryable: category == ErrorCategory::Transient,
                    message: message.clone(),
                })
            }
            (None, _) => None,
        };
        // Entries written by older versions may not decode; keep the rest.
        let params = serde_json::from_value(entry.params.clone()).ok();
        let result = if entry.result.is_null() {
            None
        } else {
            serde_json::from_value(entry.result.clone()).ok()
        };
        Ok(Self {
            job_id: entry.job_id.clone(),
            status,
            params,
            product: entry.product.clone(),
            created_at: entry.created_at,
            started_at: entry.started_at,
            finished_at: entry.finished_at,
            updated_at: entry.updated_at,
            logs: Vec::new(),
            error,
            result,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// History row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobState,
    pub product: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobSummary {
    pub fn from_history(entry: &JobHistoryEntry) -> Result<Self> {
        Ok(Self {
            job_id: entry.job_id.clone(),
            status: JobState::from_str(&entry.status)?,
            product: entry.product.clone(),
            created_at: entry.created_at,
            finished_at: entry.finished_at,
            updated_at: entry.updated_at,
        })
    }

    pub fn recency(&self) -> DateTime<Utc> {
        self.finished_at.unwrap_or(self.updated_at.max(self.created_at))
    }
}

/// Job state machine for transitions
pub struct JobStateMachine<'a> {
    job: &'a mut Job,
}

impl<'a> JobStateMachine<'a> {
    pub fn new(job: &'a mut Job) -> Self {
        Self { job }
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    fn invalid(&self, to: JobState) -> OrchestratorError {
        OrchestratorError::InvalidStateTransition {
            from: self.job.state.as_str().to_string(),
            to: to.as_str().to_string(),
        }
    }

    /// Transition: PENDING → RUNNING
    pub fn start(&mut self) -> Result<()> {
        if self.job.state != JobState::Pending {
            return Err(self.invalid(JobState::Running));
        }
        let now = Utc::now();
        self.job.state = JobState::Running;
        self.job.started_at = Some(now);
        self.job.updated_at = now;
        Ok(())
    }

    /// Transition: RUNNING → SUCCEEDED
    pub fn succeed(&mut self, result: WorkflowResult) -> Result<()> {
        if self.job.state != JobState::Running {
            return Err(self.invalid(JobState::Succeeded));
        }
        let now = Utc::now();
        self.job.state = JobState::Succeeded;
        self.job.product = Some(result.scene.id().to_string());
        self.job.result = Some(result);
        self.job.finished_at = Some(now);
        self.job.updated_at = now;
        Ok(())
    }

    /// Transition: RUNNING → FAILED
    pub fn fail(&mut self, err: &OrchestratorError) -> Result<()> {
        if self.job.state != JobState::Running {
            return Err(self.invalid(JobState::Failed));
        }
        self.finish_failed(err);
        Ok(())
    }

    /// Transition: PENDING → FAILED (cancelled before it ran)
    pub fn cancel_pending(&mut self) -> Result<()> {
        if self.job.state != JobState::Pending {
            return Err(self.invalid(JobState::Failed));
        }
        self.finish_failed(&OrchestratorError::Cancelled);
        Ok(())
    }

    fn finish_failed(&mut self, err: &OrchestratorError) {
        let now = Utc::now();
        self.job.state = JobState::Failed;
        self.job.error = Some(JobError::from(err));
        self.job.finished_at = Some(now);
        self.job.updated_at = now;
    }
}
