//! Spectral index computation over a band set.

use super::band_stage::{valid_on_grid, BandSet};
use super::StageMetrics;
use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::run_blocking;
use canasat_raster::{Band, IndexDefinition, IndexRegistry, Raster, DEFAULT_MASK_EPSILON, RASTER_EXTENSION};
use canasat_storage::{ArtifactCache, ArtifactKind, CacheKey, Fingerprint};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IndexOutcome {
    Succeeded { path: PathBuf },
    Failed { kind: ErrorKind, message: String },
}

impl IndexOutcome {
    fn failed(err: &OrchestratorError) -> Self {
        IndexOutcome::Failed {
            kind: err.kind(),
            message: err.summary(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexResult {
    pub name: String,
    #[serde(flatten)]
    pub outcome: IndexOutcome,
}

/// Per-index outcomes in request order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub entries: Vec<IndexResult>,
    #[serde(default)]
    pub metrics: StageMetrics,
}

impl IndexManifest {
    pub fn succeeded(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, IndexOutcome::Succeeded { .. }))
            .map(|e| e.name.as_str())
            .collect()
    }

    pub fn failed(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, IndexOutcome::Failed { .. }))
            .map(|e| e.name.as_str())
            .collect()
    }

    pub fn outcome(&self, name: &str) -> Option<&IndexOutcome> {
        self.entries.iter().find(|e| e.name == name).map(|e| &e.outcome)
    }

    pub fn path(&self, name: &str) -> Option<&Path> {
        match self.outcome(name)? {
            IndexOutcome::Succeeded { path } => Some(path),
            IndexOutcome::Failed { .. } => None,
        }
    }

    pub fn paths(&self) -> BTreeMap<String, PathBuf> {
        self.entries
            .iter()
            .filter_map(|e| match &e.outcome {
                IndexOutcome::Succeeded { path } => Some((e.name.clone(), path.clone())),
                IndexOutcome::Failed { .. } => None,
            })
            .collect()
    }
}

pub struct IndexEngine {
    registry: Arc<IndexRegistry>,
    cache: Arc<ArtifactCache>,
    mask_epsilon: f64,
}

impl IndexEngine {
    /// Engine over the built-in registry.
    pub fn new(cache: Arc<ArtifactCache>) -> Self {
        Self {
            registry: Arc::new(IndexRegistry::with_builtins()),
            cache,
            mask_epsilon: DEFAULT_MASK_EPSILON,
        }
    }

    pub fn with_registry(mut self, registry: Arc<IndexRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_mask_epsilon(mut self, mask_epsilon: f64) -> Self {
        self.mask_epsilon = mask_epsilon;
        self
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    /// Lowercased, first occurrence kept; empty means every registered index.
    pub fn resolve_names(&self, requested: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let names: Vec<String> = requested
            .iter()
            .map(|n| n.trim().to_ascii_lowercase())
            .filter(|n| !n.is_empty())
            .filter(|n| seen.insert(n.clone()))
            .collect();
        if names.is_empty() {
            self.registry.names().into_iter().map(str::to_string).collect()
        } else {
            names
        }
    }

    /// Compute `requested` over `bands`.
    ///
    /// Per-index problems are recorded in the manifest. Errors only when no
    /// band of the set can be read.
    pub async fn compute(&self, bands: &BandSet, requested: &[String]) -> Result<IndexManifest> {
        let start = Instant::now();
        let loaded = self.load_bands(bands).await;
        if loaded.is_empty() {
            return Err(OrchestratorError::NoArtifacts(format!(
                "no readable band for scene {}",
                bands.scene_id
            )));
        }

        let names = self.resolve_names(requested);
        let jobs = names.iter().map(|name| self.compute_one(bands, &loaded, name));
        let outcomes = join_all(jobs).await;

        let mut manifest = IndexManifest::default();
        for (name, outcome) in names.into_iter().zip(outcomes) {
            let outcome = match outcome {
                Ok((path, hit)) => {
                    if hit {
                        manifest.metrics.cache_hits += 1;
                    }
                    IndexOutcome::Succeeded { path }
                }
                Err(e) => {
                    warn!(scene = %bands.scene_id, index = %name, error = %e, "index failed");
                    IndexOutcome::failed(&e)
                }
            };
            manifest.entries.push(IndexResult { name, outcome });
        }
        manifest.metrics.artifacts = manifest.succeeded().len();
        manifest.metrics.failures = manifest.failed().len();
        manifest.metrics.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            scene = %bands.scene_id,
            succeeded = manifest.metrics.artifacts,
            failed = manifest.metrics.failures,
            "index computation finished"
        );
        Ok(manifest)
    }

    async fn load_bands(&self, bands: &BandSet) -> BTreeMap<Band, Arc<Raster>> {
        let reads = bands.bands.iter().map(|(&band, path)| {
            let path = path.clone();
            let grid = bands.grid;
            async move {
                let result = run_blocking(move || {
                    let raster = Raster::read(&path)?;
                    grid.ensure_matches(raster.grid())?;
                    Ok(raster)
                })
                .await;
                (band, result)
            }
        });

        let mut loaded = BTreeMap::new();
        for (band, result) in join_all(reads).await {
            match result {
                Ok(raster) => {
                    loaded.insert(band, Arc::new(raster));
                }
                Err(e) => warn!(scene = %bands.scene_id, band = %band, error = %e, "band unreadable"),
            }
        }
        loaded
    }

    async fn compute_one(
        &self,
        bands: &BandSet,
        loaded: &BTreeMap<Band, Arc<Raster>>,
        name: &str,
    ) -> Result<(PathBuf, bool)> {
        let definition = self
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::unsupported_index(name, "unknown index formula"))?;

        let missing = definition.missing_bands(|b| loaded.contains_key(&b));
        if !missing.is_empty() {
            let listed: Vec<&str> = missing.iter().map(|b| b.as_str()).collect();
            return Err(OrchestratorError::unsupported_index(
                name,
                format!("missing band(s): {}", listed.join(", ")),
            ));
        }

        let inputs: Vec<Arc<Raster>> = definition
            .required_bands()
            .iter()
            .filter_map(|b| loaded.get(b).cloned())
            .collect();
        let input_files: Vec<String> = definition
            .required_bands()
            .iter()
            .filter_map(|b| bands.get(*b))
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();

        let fingerprint = Fingerprint::builder()
            .param("version", definition.version())
            .param("epsilon", self.mask_epsilon)
            .param("grid", bands.grid.cache_descriptor())
            .param("inputs", input_files.join(","))
            .finish();
        let key = CacheKey::new(&bands.scene_id, ArtifactKind::Index, definition.name(), fingerprint)
            .with_extension(RASTER_EXTENSION);
        let eps = self.mask_epsilon;

        let artifact = self
            .cache
            .get_or_compute(&key, || apply(definition.clone(), inputs.clone(), eps))
            .await?;
        if !artifact.is_hit() {
            debug!(index = name, path = %artifact.path.display(), "index computed");
            return Ok((artifact.path, false));
        }
        if valid_on_grid(&artifact.path, bands.grid).await {
            return Ok((artifact.path, true));
        }

        warn!(
            error = %OrchestratorError::CacheCorruption(key.to_string()),
            "cached index failed validation, recomputing"
        );
        self.cache.invalidate(&key).await?;
        let artifact = self
            .cache
            .get_or_compute(&key, || apply(definition, inputs, eps))
            .await?;
        Ok((artifact.path, false))
    }
}

async fn apply(definition: IndexDefinition, inputs: Vec<Arc<Raster>>, eps: f64) -> Result<Vec<u8>> {
    run_blocking(move || {
        let refs: Vec<&Raster> = inputs.iter().map(|r| r.as_ref()).collect();
        let raster = definition.compute(&refs, eps)?;
        Ok(raster.encode()?)
    })
    .await
}
