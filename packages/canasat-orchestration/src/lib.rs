/*
 * Canasat Orchestration - scene processing jobs
 *
 * Turns an area of interest, a date window and a cloud-cover bound into
 * reflectance bands and spectral indices for one Sentinel-2 scene.
 *
 * Architecture:
 * - Scene repository (catalog query, single download per product)
 * - Band extraction onto a reference grid (cached)
 * - Index engine (per-index success or failure)
 * - Workflow orchestrator (resolve -> extract -> index -> export)
 * - Job manager (bounded workers, cancellation, history)
 */

// Public modules
pub mod aoi;
pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod manager;
pub mod orchestrator;
pub mod request;
pub mod scene;
pub mod stages;

// Re-exports
pub use aoi::{AreaOfInterest, CloudBounds, DateWindow};
pub use config::{ConfigError, PipelineConfig};
pub use error::{redact, ErrorCategory, ErrorKind, OrchestratorError, Result};
pub use job::{Job, JobError, JobSnapshot, JobState, JobStateMachine, JobSummary};
pub use logging::init_tracing;
pub use manager::{history_store_from_config, JobManager, JobManagerConfig};
pub use orchestrator::{
    LogLevel, LogLine, RunLog, WorkflowOrchestrator, WorkflowResult, WorkflowRunner, WorkflowStep,
};
pub use request::WorkflowParams;
pub use scene::{Candidate, CatalogClient, LocalCatalog, Scene, SceneQuery, SceneRepository};
pub use stages::{
    ArtifactManifest, BandExtractor, BandSet, ExportOptions, Exporter, IndexEngine, IndexManifest,
    IndexOutcome, ManifestExporter, StageMetrics,
};

#[cfg(feature = "odata")]
pub use scene::ODataCatalog;

/// Run synchronous file or raster work on the blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| OrchestratorError::internal(format!("blocking task failed: {}", e)))?
}
