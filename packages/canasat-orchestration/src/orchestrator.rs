//! One workflow run: resolve -> extract -> index -> export.

use crate::aoi::{CloudBounds, DateWindow};
use crate::config::PipelineConfig;
use crate::error::{OrchestratorError, Result};
use crate::request::WorkflowParams;
use crate::scene::{LocalCatalog, Scene, SceneRepository};
use crate::stages::{
    ArtifactManifest, BandExtractor, BandSet, ExportOptions, Exporter, ExtractionOptions, IndexEngine, IndexManifest,
    IndexOutcome, ManifestExporter,
};
use async_trait::async_trait;
use canasat_storage::ArtifactCache;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ═══════════════════════════════════════════════════════════════════════════
// Steps
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    Resolving,
    Extracting,
    Indexing,
    Exporting,
    Completed,
    Failed,
}

impl WorkflowStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStep::Resolving => "resolving",
            WorkflowStep::Extracting => "extracting",
            WorkflowStep::Indexing => "indexing",
            WorkflowStep::Exporting => "exporting",
            WorkflowStep::Completed => "completed",
            WorkflowStep::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "resolving" => Ok(WorkflowStep::Resolving),
            "extracting" => Ok(WorkflowStep::Extracting),
            "indexing" => Ok(WorkflowStep::Indexing),
            "exporting" => Ok(WorkflowStep::Exporting),
            "completed" => Ok(WorkflowStep::Completed),
            "failed" => Ok(WorkflowStep::Failed),
            _ => Err(OrchestratorError::invalid_request(format!("Invalid workflow step: {}", s))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStep::Completed | WorkflowStep::Failed)
    }

    /// Forward by one step, or to Failed from any live step.
    pub fn can_transition_to(&self, next: WorkflowStep) -> bool {
        use WorkflowStep::*;
        matches!(
            (self, next),
            (Resolving, Extracting)
                | (Extracting, Indexing)
                | (Indexing, Exporting)
                | (Exporting, Completed)
                | (Resolving | Extracting | Indexing | Exporting, Failed)
        )
    }
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

struct StepTracker {
    current: WorkflowStep,
}

impl StepTracker {
    fn advance(&mut self, next: WorkflowStep) -> Result<()> {
        if !self.current.can_transition_to(next) {
            return Err(OrchestratorError::InvalidStateTransition {
                from: self.current.to_string(),
                to: next.to_string(),
            });
        }
        self.current = next;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Run log
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    /// Monotonic within one log
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub step: WorkflowStep,
    pub message: String,
}

struct LogBuffer {
    lines: VecDeque<LogLine>,
    capacity: usize,
    next_seq: u64,
    dropped: u64,
}

/// Bounded, ordered log of one run. Clones share the buffer; every line is
/// also emitted as a tracing event.
#[derive(Clone)]
pub struct RunLog {
    buffer: Arc<Mutex<LogBuffer>>,
    job_id: Arc<str>,
}

pub const DEFAULT_LOG_CAPACITY: usize = 500;

impl RunLog {
    pub fn new(capacity: usize) -> Self {
        Self::for_job("-", capacity)
    }

    pub fn for_job(job_id: &str, capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(LogBuffer {
                lines: VecDeque::new(),
                capacity: capacity.max(1),
                next_seq: 0,
                dropped: 0,
            })),
            job_id: Arc::from(job_id),
        }
    }

    pub fn push(&self, level: LogLevel, step: WorkflowStep, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => debug!(job_id = %self.job_id, step = %step, "{}", message),
            LogLevel::Info => info!(job_id = %self.job_id, step = %step, "{}", message),
            LogLevel::Warn => warn!(job_id = %self.job_id, step = %step, "{}", message),
            LogLevel::Error => error!(job_id = %self.job_id, step = %step, "{}", message),
        }

        let mut buffer = self.buffer.lock();
        let seq = buffer.next_seq;
        buffer.next_seq += 1;
        if buffer.lines.len() == buffer.capacity {
            buffer.lines.pop_front();
            buffer.dropped += 1;
        }
        buffer.lines.push_back(LogLine {
            seq,
            at: Utc::now(),
            level,
            step,
            message,
        });
    }

    pub fn info(&self, step: WorkflowStep, message: impl Into<String>) {
        self.push(LogLevel::Info, step, message);
    }

    pub fn warn(&self, step: WorkflowStep, message: impl Into<String>) {
        self.push(LogLevel::Warn, step, message);
    }

    pub fn error(&self, step: WorkflowStep, message: impl Into<String>) {
        self.push(LogLevel::Error, step, message);
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.buffer.lock().lines.iter().cloned().collect()
    }

    /// Lines with `seq >= from`, for incremental polling.
    pub fn since(&self, from: u64) -> Vec<LogLine> {
        self.buffer
            .lock()
            .lines
            .iter()
            .filter(|l| l.seq >= from)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines evicted by the capacity bound.
    pub fn dropped(&self) -> u64 {
        self.buffer.lock().dropped
    }
}

impl Default for RunLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl fmt::Debug for RunLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLog")
            .field("job_id", &self.job_id)
            .field("lines", &self.len())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub scene: Scene,
    pub bands: BandSet,
    pub indices: IndexManifest,
    pub artifacts: ArtifactManifest,
    pub export_outputs: Vec<PathBuf>,
    pub export_error: Option<String>,
}

impl WorkflowResult {
    pub fn succeeded_indices(&self) -> Vec<&str> {
        self.indices.succeeded()
    }

    pub fn failed_indices(&self) -> Vec<&str> {
        self.indices.failed()
    }
}

/// Executes one run. Implemented by `WorkflowOrchestrator`; the job manager
/// only depends on this seam.
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    async fn run(&self, params: &WorkflowParams, log: &RunLog, cancel: &CancellationToken) -> Result<WorkflowResult>;
}

pub struct WorkflowOrchestrator {
    repository: Arc<SceneRepository>,
    extractor: BandExtractor,
    engine: IndexEngine,
    exporter: Option<Arc<dyn Exporter>>,
    export_options: ExportOptions,
}

impl WorkflowOrchestrator {
    pub fn new(repository: Arc<SceneRepository>, extractor: BandExtractor, engine: IndexEngine) -> Self {
        Self {
            repository,
            extractor,
            engine,
            exporter: None,
            export_options: ExportOptions::default(),
        }
    }

    pub fn with_exporter(mut self, exporter: Arc<dyn Exporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn with_export_options(mut self, options: ExportOptions) -> Self {
        self.export_options = options;
        self
    }

    /// Wire every component from configuration. A configured local mirror
    /// takes precedence over the remote catalog.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(ArtifactCache::open(&config.storage.cache_dir)?);

        let mut repository = SceneRepository::new(&config.storage.scene_store)?
            .with_timeouts(config.network.timeout(), config.network.download_timeout());
        if let Some(mirror) = &config.catalog.local_mirror {
            repository = repository.with_catalog(Arc::new(LocalCatalog::new(mirror)));
        } else {
            #[cfg(feature = "odata")]
            {
                let catalog = crate::scene::ODataCatalog::from_env(&config.catalog, &config.network)?;
                repository = repository.with_catalog(Arc::new(catalog));
            }
        }

        let extractor = BandExtractor::new(cache.clone(), ExtractionOptions::from_config(&config.extraction)?);
        let engine = IndexEngine::new(cache).with_mask_epsilon(config.indexing.mask_epsilon);
        Ok(Self::new(Arc::new(repository), extractor, engine)
            .with_exporter(Arc::new(ManifestExporter::new(&config.storage.export_dir))))
    }

    pub fn repository(&self) -> &SceneRepository {
        &self.repository
    }

    pub fn engine(&self) -> &IndexEngine {
        &self.engine
    }

    async fn run_steps(
        &self,
        params: &WorkflowParams,
        log: &RunLog,
        cancel: &CancellationToken,
        steps: &mut StepTracker,
    ) -> Result<WorkflowResult> {
        log.info(
            WorkflowStep::Resolving,
            describe_request(&params.window, &params.cloud, params.reuse_path.is_some()),
        );
        checkpoint(cancel)?;
        let scene = self
            .repository
            .resolve(&params.aoi, &params.window, &params.cloud, params.reuse_path.as_deref())
            .await?;
        log.info(
            WorkflowStep::Resolving,
            format!(
                "scene {} acquired {} with {:.1}% cloud cover",
                scene.id(),
                scene.acquired_at().format("%Y-%m-%d"),
                scene.cloud_cover()
            ),
        );

        checkpoint(cancel)?;
        steps.advance(WorkflowStep::Extracting)?;
        let bands = self.extractor.extract(&scene).await?;
        for (band, reason) in &bands.missing {
            log.warn(WorkflowStep::Extracting, format!("band {} unavailable: {}", band, crate::error::redact(reason)));
        }
        if bands.is_empty() {
            return Err(OrchestratorError::NoArtifacts(format!("no band could be extracted from {}", scene.id())));
        }
        log.info(
            WorkflowStep::Extracting,
            format!("{} band(s) on grid {}", bands.len(), bands.grid),
        );

        checkpoint(cancel)?;
        steps.advance(WorkflowStep::Indexing)?;
        let indices = self.engine.compute(&bands, &params.indices).await?;
        for entry in &indices.entries {
            if let IndexOutcome::Failed { message, .. } = &entry.outcome {
                log.warn(WorkflowStep::Indexing, format!("index {} failed: {}", entry.name, message));
            }
        }
        log.info(
            WorkflowStep::Indexing,
            format!(
                "{} index(es) succeeded, {} failed",
                indices.metrics.artifacts, indices.metrics.failures
            ),
        );

        checkpoint(cancel)?;
        steps.advance(WorkflowStep::Exporting)?;
        let artifacts = ArtifactManifest::new(&bands, &indices);
        let (export_outputs, export_error) = match &self.exporter {
            Some(exporter) => match exporter.export(&artifacts, &self.export_options).await {
                Ok(outputs) => {
                    log.info(
                        WorkflowStep::Exporting,
                        format!("{} wrote {} output(s)", exporter.name(), outputs.len()),
                    );
                    (outputs, None)
                }
                Err(e) => {
                    let message = crate::error::redact(&format!("{:#}", e));
                    log.warn(WorkflowStep::Exporting, format!("export failed: {}", message));
                    (Vec::new(), Some(message))
                }
            },
            None => {
                log.info(WorkflowStep::Exporting, "no exporter configured");
                (Vec::new(), None)
            }
        };

        steps.advance(WorkflowStep::Completed)?;
        log.info(
            WorkflowStep::Completed,
            format!("produced {} artifact(s) for {}", artifacts.artifact_count(), scene.id()),
        );

        Ok(WorkflowResult {
            scene,
            bands,
            indices,
            artifacts,
            export_outputs,
            export_error,
        })
    }
}

#[async_trait]
impl WorkflowRunner for WorkflowOrchestrator {
    async fn run(&self, params: &WorkflowParams, log: &RunLog, cancel: &CancellationToken) -> Result<WorkflowResult> {
        let mut steps = StepTracker {
            current: WorkflowStep::Resolving,
        };
        match self.run_steps(params, log, cancel, &mut steps).await {
            Ok(result) => Ok(result),
            Err(e) => {
                let failed_at = steps.current;
                if steps.advance(WorkflowStep::Failed).is_ok() {
                    log.error(WorkflowStep::Failed, format!("{} failed: {}", failed_at, e.summary()));
                }
                Err(e)
            }
        }
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(OrchestratorError::Cancelled)
    } else {
        Ok(())
    }
}

fn describe_request(window: &DateWindow, cloud: &CloudBounds, reuse: bool) -> String {
    if reuse {
        "resolving scene from local product".to_string()
    } else {
        format!("searching scenes for {} with cloud cover {}", window, cloud)
    }
}
