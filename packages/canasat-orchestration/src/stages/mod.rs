// Stage implementations
pub mod band_stage;
pub mod export_stage;
pub mod index_stage;

// Re-exports
pub use band_stage::{BandExtractor, BandSet, ExtractionOptions};
pub use export_stage::{ArtifactManifest, ExportOptions, Exporter, ManifestExporter, MANIFEST_FILE};
pub use index_stage::{IndexEngine, IndexManifest, IndexOutcome, IndexResult};

use serde::{Deserialize, Serialize};

/// Per-stage counters reported with stage output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub artifacts: usize,
    pub cache_hits: usize,
    pub failures: usize,
    pub duration_ms: u64,
}
