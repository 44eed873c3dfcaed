//! Band extraction onto one reference grid.

use super::StageMetrics;
use crate::config::ExtractionConfig;
use crate::error::{OrchestratorError, Result};
use crate::run_blocking;
use crate::scene::{LocalProduct, Scene};
use canasat_raster::{
    resample_to_grid, to_reflectance, Band, GridSpec, Radiometry, Raster, ResamplingMethod, RASTER_EXTENSION,
};
use canasat_storage::{ArtifactCache, ArtifactKind, CacheKey, Fingerprint};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Co-registered reflectance bands of one scene.
///
/// Every file in `bands` holds a raster on `grid`. Bands that could not be
/// produced are listed in `missing` with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandSet {
    pub scene_id: String,
    pub grid: GridSpec,
    pub bands: BTreeMap<Band, PathBuf>,
    pub missing: BTreeMap<Band, String>,
    #[serde(default)]
    pub metrics: StageMetrics,
}

impl BandSet {
    pub fn get(&self, band: Band) -> Option<&Path> {
        self.bands.get(&band).map(PathBuf::as_path)
    }

    pub fn contains(&self, band: Band) -> bool {
        self.bands.contains_key(&band)
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionOptions {
    pub bands: Vec<Band>,
    pub reference_band: Band,
    pub resampling: ResamplingMethod,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            bands: Band::ALL.to_vec(),
            reference_band: Band::Nir,
            resampling: ResamplingMethod::default(),
        }
    }
}

impl ExtractionOptions {
    pub fn from_config(config: &ExtractionConfig) -> Result<Self> {
        let mut bands = config.bands.clone();
        bands.sort();
        bands.dedup();
        Ok(Self {
            bands,
            reference_band: config.reference_band,
            resampling: config.resampling_method()?,
        })
    }
}

/// Reads product bands, converts them to reflectance and warps them onto the
/// reference grid, memoized in the artifact cache.
pub struct BandExtractor {
    cache: Arc<ArtifactCache>,
    options: ExtractionOptions,
}

impl BandExtractor {
    pub fn new(cache: Arc<ArtifactCache>, options: ExtractionOptions) -> Self {
        Self { cache, options }
    }

    pub fn options(&self) -> &ExtractionOptions {
        &self.options
    }

    /// Extract every configured band. Per-band failures land in
    /// `BandSet::missing`; only an unreadable product is an error.
    pub async fn extract(&self, scene: &Scene) -> Result<BandSet> {
        let start = Instant::now();
        let location = scene.location().to_path_buf();
        let product = Arc::new(run_blocking(move || LocalProduct::open(&location)).await?);

        let grid = self.reference_grid(scene, &product).await?;
        debug!(scene = %scene.id(), grid = %grid, "reference grid");

        let jobs = self
            .options
            .bands
            .iter()
            .map(|&band| self.extract_band(scene, &product, band, grid));
        let results = join_all(jobs).await;

        let mut set = BandSet {
            scene_id: scene.id().to_string(),
            grid,
            bands: BTreeMap::new(),
            missing: BTreeMap::new(),
            metrics: StageMetrics::default(),
        };
        for (&band, result) in self.options.bands.iter().zip(results) {
            match result {
                Ok((path, hit)) => {
                    if hit {
                        set.metrics.cache_hits += 1;
                    }
                    set.bands.insert(band, path);
                }
                Err(e) => {
                    warn!(scene = %scene.id(), band = %band, error = %e, "band unavailable");
                    set.missing.insert(band, e.to_string());
                }
            }
        }
        set.metrics.artifacts = set.bands.len();
        set.metrics.failures = set.missing.len();
        set.metrics.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            scene = %scene.id(),
            extracted = set.bands.len(),
            missing = set.missing.len(),
            cache_hits = set.metrics.cache_hits,
            "band extraction finished"
        );
        Ok(set)
    }

    /// Grid of the reference band at its native resolution in the product
    /// CRS. Without a readable reference band the finest available band is
    /// used.
    async fn reference_grid(&self, scene: &Scene, product: &LocalProduct) -> Result<GridSpec> {
        let reference = self.options.reference_band;
        let mut order: Vec<(Band, PathBuf, u32)> = self
            .options
            .bands
            .iter()
            .chain(std::iter::once(&reference))
            .filter_map(|&band| product.locate_band(band).map(|f| (band, f.path.clone(), f.resolution)))
            .collect();
        order.sort_by_key(|(band, _, resolution)| (*band != reference, *resolution, *band));
        order.dedup_by_key(|(band, _, _)| *band);

        for (band, path, resolution) in order {
            let read_path = path.clone();
            match run_blocking(move || Ok(Raster::read(&read_path)?)).await {
                Ok(raster) => {
                    if band != reference {
                        warn!(
                            scene = %scene.id(),
                            reference = %reference,
                            fallback = %band,
                            "reference band unavailable, using finest available band"
                        );
                    }
                    let grid = *raster.grid();
                    if grid.crs == scene.crs() {
                        return Ok(grid);
                    }
                    let metres = resolution as f64;
                    let target_res = if scene.crs().is_geographic() { metres / 111_320.0 } else { metres };
                    return Ok(grid.reprojected(scene.crs(), target_res)?);
                }
                Err(e) => {
                    warn!(scene = %scene.id(), band = %band, path = %path.display(), error = %e, "unreadable band raster");
                }
            }
        }
        Err(OrchestratorError::NoArtifacts(format!(
            "product {} contains none of the requested bands",
            scene.id()
        )))
    }

    async fn extract_band(
        &self,
        scene: &Scene,
        product: &LocalProduct,
        band: Band,
        grid: GridSpec,
    ) -> Result<(PathBuf, bool)> {
        let source = product
            .locate_band(band)
            .ok_or_else(|| OrchestratorError::missing_band(band.as_str(), "not present in product"))?
            .path
            .clone();
        let radiometry = scene.radiometry(band)?;
        let source_size = tokio::fs::metadata(&source)
            .await
            .map_err(|e| OrchestratorError::missing_band(band.as_str(), e))?
            .len();
        let source_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let fingerprint = Fingerprint::builder()
            .param("grid", grid.cache_descriptor())
            .param("resampling", self.options.resampling)
            .param("radiometry", radiometry.cache_descriptor())
            .param("source", format!("{}:{}", source_name, source_size))
            .finish();
        let key = CacheKey::new(scene.id(), ArtifactKind::Band, band.as_str(), fingerprint)
            .with_extension(RASTER_EXTENSION);

        let method = self.options.resampling;
        let artifact = self
            .cache
            .get_or_compute(&key, || warp_band(band, source.clone(), grid, radiometry, method))
            .await?;
        if !artifact.is_hit() {
            return Ok((artifact.path, false));
        }

        if valid_on_grid(&artifact.path, grid).await {
            return Ok((artifact.path, true));
        }
        warn!(
            error = %OrchestratorError::CacheCorruption(key.to_string()),
            "cached band failed validation, recomputing"
        );
        self.cache.invalidate(&key).await?;
        let artifact = self
            .cache
            .get_or_compute(&key, || warp_band(band, source, grid, radiometry, method))
            .await?;
        Ok((artifact.path, false))
    }
}

async fn warp_band(
    band: Band,
    source: PathBuf,
    grid: GridSpec,
    radiometry: Radiometry,
    method: ResamplingMethod,
) -> Result<Vec<u8>> {
    run_blocking(move || {
        let raw = Raster::read(&source).map_err(|e| OrchestratorError::missing_band(band.as_str(), e))?;
        let reflectance = to_reflectance(raw, &radiometry)?;
        let warped = resample_to_grid(&reflectance, &grid, method)?;
        Ok(warped.encode()?)
    })
    .await
}

/// Decodes and sits on `grid`.
pub(crate) async fn valid_on_grid(path: &Path, grid: GridSpec) -> bool {
    let path = path.to_path_buf();
    run_blocking(move || Ok(Raster::read(&path)?))
        .await
        .map(|r| r.grid().matches(&grid))
        .unwrap_or(false)
}
