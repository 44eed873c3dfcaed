//! Shared fixtures: a local catalog mirror of synthetic Sentinel-2 products.

#![allow(dead_code)]

use canasat_orchestration::scene::{ProductMetadata, ProductWriter};
use canasat_orchestration::stages::ExtractionOptions;
use canasat_orchestration::{
    AreaOfInterest, BandExtractor, CloudBounds, DateWindow, IndexEngine, LocalCatalog,
    ManifestExporter, SceneRepository, WorkflowOrchestrator, WorkflowParams,
};
use canasat_raster::{Band, Crs, GeoTransform, GridSpec, Raster, RasterUnits};
use canasat_storage::ArtifactCache;
use chrono::{TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const UTM_23S: u32 = 32723;
pub const ORIGIN_X: f64 = 200_000.0;
pub const ORIGIN_Y: f64 = 7_500_000.0;

/// Digital numbers per band; reflectance is DN / 10000.
pub fn band_dn(band: Band) -> f32 {
    match band {
        Band::Blue => 800.0,
        Band::Green => 1200.0,
        Band::Red => 1000.0,
        Band::Nir => 3000.0,
        Band::Swir1 => 2000.0,
        Band::Swir2 => 1500.0,
        _ => 2500.0,
    }
}

pub fn band_grid(resolution: u32) -> GridSpec {
    let size = (40 / resolution) as usize;
    GridSpec::new(
        size,
        size,
        GeoTransform::north_up(ORIGIN_X, ORIGIN_Y, resolution as f64),
        Crs::from_epsg(UTM_23S).unwrap(),
    )
    .unwrap()
}

fn band_raster(band: Band, resolution: u32) -> Raster {
    let base = band_dn(band);
    // Small per-pixel variation so resampling and indices are not trivially constant.
    Raster::from_fn(band_grid(resolution), RasterUnits::DigitalNumber, move |col, row| {
        base + (col + row) as f32
    })
}

pub fn metadata(id: &str, cloud_cover: f64, day: u32) -> ProductMetadata {
    ProductMetadata::new(
        id,
        Utc.with_ymd_and_hms(2024, 8, day, 13, 12, 51).unwrap(),
        cloud_cover,
        vec![[-47.6, -22.6], [-46.9, -22.6], [-46.9, -21.9], [-47.6, -21.9]],
        Crs::from_epsg(UTM_23S).unwrap(),
    )
}

pub struct Fixture {
    _tmp: TempDir,
    pub mirror: PathBuf,
    pub store: PathBuf,
    pub cache_dir: PathBuf,
    pub export_dir: PathBuf,
    pub catalog: Arc<LocalCatalog>,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mirror = tmp.path().join("mirror");
        std::fs::create_dir_all(&mirror).unwrap();
        Self {
            store: tmp.path().join("scenes"),
            cache_dir: tmp.path().join("cache"),
            export_dir: tmp.path().join("exports"),
            catalog: Arc::new(LocalCatalog::new(&mirror)),
            mirror,
            _tmp: tmp,
        }
    }

    pub fn root(&self) -> &Path {
        self._tmp.path()
    }

    /// Add a zipped product carrying `bands` at their native resolutions.
    pub fn add_product(&self, id: &str, cloud_cover: f64, day: u32, bands: &[Band]) -> PathBuf {
        let writer = bands.iter().fold(ProductWriter::new(metadata(id, cloud_cover, day)), |w, &band| {
            let res = band.native_resolution();
            w.band(band, res, band_raster(band, res))
        });
        writer.write_zip(&self.mirror.join(format!("{}.zip", id))).unwrap()
    }

    /// Standard product: every 10 m band plus the 20 m SWIR pair.
    pub fn add_full_product(&self, id: &str, cloud_cover: f64) -> PathBuf {
        self.add_product(
            id,
            cloud_cover,
            7,
            &[Band::Blue, Band::Green, Band::Red, Band::Nir, Band::Swir1, Band::Swir2],
        )
    }

    pub fn cache(&self) -> Arc<ArtifactCache> {
        Arc::new(ArtifactCache::open(&self.cache_dir).unwrap())
    }

    pub fn repository(&self) -> Arc<SceneRepository> {
        Arc::new(
            SceneRepository::new(&self.store)
                .unwrap()
                .with_catalog(self.catalog.clone()),
        )
    }

    pub fn orchestrator(&self) -> WorkflowOrchestrator {
        let cache = self.cache();
        WorkflowOrchestrator::new(
            self.repository(),
            BandExtractor::new(cache.clone(), ExtractionOptions::default()),
            IndexEngine::new(cache),
        )
        .with_exporter(Arc::new(ManifestExporter::new(&self.export_dir)))
    }
}

pub fn params(cloud: (f64, f64), indices: &[&str]) -> WorkflowParams {
    WorkflowParams::new(
        AreaOfInterest::from_bbox(-47.5, -22.5, -47.0, -22.0).unwrap(),
        DateWindow::parse("2024-08-01", Some("2024-08-15")).unwrap(),
    )
    .with_cloud(CloudBounds::new(cloud.0, cloud.1).unwrap())
    .with_indices(indices.iter().copied())
}
