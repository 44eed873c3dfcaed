//! Export handoff to renderers.

use super::band_stage::BandSet;
use super::index_stage::{IndexManifest, IndexOutcome};
use crate::error::ErrorKind;
use async_trait::async_trait;
use canasat_raster::{Band, GridSpec};
use canasat_storage::{sanitize_component, write_atomic};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Render options passed through to the exporter untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    pub upsample: u32,
    pub smooth_radius: f64,
    pub sharpen: bool,
    pub sharpen_radius: f64,
    pub sharpen_amount: f64,
    pub tiles: String,
    pub padding: f64,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            upsample: 12,
            smooth_radius: 1.0,
            sharpen: true,
            sharpen_radius: 1.2,
            sharpen_amount: 1.5,
            tiles: "none".to_string(),
            padding: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Everything a renderer needs: produced files and what failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub scene_id: String,
    pub grid: GridSpec,
    pub band_paths: BTreeMap<Band, PathBuf>,
    pub index_paths: BTreeMap<String, PathBuf>,
    /// Keyed by band or index name
    pub failures: BTreeMap<String, ArtifactFailure>,
}

impl ArtifactManifest {
    pub fn new(bands: &BandSet, indices: &IndexManifest) -> Self {
        let mut failures = BTreeMap::new();
        for (band, reason) in &bands.missing {
            failures.insert(
                band.as_str().to_string(),
                ArtifactFailure {
                    kind: ErrorKind::MissingBand,
                    message: crate::error::redact(reason),
                },
            );
        }
        for entry in &indices.entries {
            if let IndexOutcome::Failed { kind, message } = &entry.outcome {
                failures.insert(
                    entry.name.clone(),
                    ArtifactFailure {
                        kind: *kind,
                        message: message.clone(),
                    },
                );
            }
        }
        Self {
            scene_id: bands.scene_id.clone(),
            grid: bands.grid,
            band_paths: bands.bands.clone(),
            index_paths: indices.paths(),
            failures,
        }
    }

    pub fn artifact_count(&self) -> usize {
        self.band_paths.len() + self.index_paths.len()
    }
}

/// External renderer/exporter collaborator.
#[async_trait]
pub trait Exporter: Send + Sync {
    fn name(&self) -> &str;

    /// Produce outputs for `manifest` and return their paths.
    async fn export(&self, manifest: &ArtifactManifest, options: &ExportOptions) -> anyhow::Result<Vec<PathBuf>>;
}

/// Writes `<output_dir>/<scene>/manifest.json` for downstream renderers.
pub struct ManifestExporter {
    output_dir: PathBuf,
}

impl ManifestExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

#[derive(Serialize)]
struct ManifestDocument<'a> {
    #[serde(flatten)]
    manifest: &'a ArtifactManifest,
    options: &'a ExportOptions,
}

#[async_trait]
impl Exporter for ManifestExporter {
    fn name(&self) -> &str {
        "manifest"
    }

    async fn export(&self, manifest: &ArtifactManifest, options: &ExportOptions) -> anyhow::Result<Vec<PathBuf>> {
        let path = self
            .output_dir
            .join(sanitize_component(&manifest.scene_id))
            .join(MANIFEST_FILE);
        let body = serde_json::to_vec_pretty(&ManifestDocument { manifest, options })?;
        write_atomic(&path, body).await?;
        Ok(vec![path])
    }
}
