//! Scene resolution: catalog search, download, unpack and validation.
//!
//! ```text
//! resolve(aoi, window, cloud, reuse_path?)
//!     │
//!     ├─ reuse_path: directory ──────────────► open in place
//!     ├─ reuse_path: archive ─► unpack once ─► <store>/<id>/
//!     └─ catalog.query ─► re-filter ─► select ─► download ─► unpack ─► <store>/<id>/
//! ```
//!
//! `<store>/<id>/.complete` marks a validated product; its presence skips
//! the download on later runs.

pub mod catalog;
#[cfg(feature = "odata")]
pub mod odata;
pub mod product;

pub use catalog::{compare_candidates, select_candidate, Candidate, CatalogClient, LocalCatalog, SceneQuery};
#[cfg(feature = "odata")]
pub use odata::ODataCatalog;
pub use product::{LocalProduct, ProductMetadata, ProductWriter, PRODUCT_METADATA_FILE};

use crate::aoi::{AreaOfInterest, CloudBounds, DateWindow};
use crate::error::{OrchestratorError, Result};
use crate::run_blocking;
use canasat_raster::{Band, Bounds, Crs, Radiometry};
use canasat_storage::{sanitize_component, KeyedLocks};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const COMPLETION_MARKER: &str = ".complete";

const STAGING_PREFIX: &str = ".staging-";

/// A resolved, validated product on local disk. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    metadata: ProductMetadata,
    location: PathBuf,
}

impl Scene {
    pub fn from_product(product: &LocalProduct) -> Self {
        Self {
            metadata: product.metadata().clone(),
            location: product.root().to_path_buf(),
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn title(&self) -> Option<&str> {
        self.metadata.title.as_deref()
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.metadata.acquired_at
    }

    pub fn cloud_cover(&self) -> f64 {
        self.metadata.cloud_cover
    }

    pub fn footprint(&self) -> &[[f64; 2]] {
        &self.metadata.footprint
    }

    pub fn footprint_bounds(&self) -> Option<Bounds> {
        self.metadata.footprint_bounds()
    }

    pub fn crs(&self) -> Crs {
        self.metadata.crs
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn metadata(&self) -> &ProductMetadata {
        &self.metadata
    }

    pub fn radiometry(&self, band: Band) -> Result<Radiometry> {
        self.metadata.radiometry(band)
    }
}

/// Resolves requests to scenes stored below one scene store directory.
pub struct SceneRepository {
    store: PathBuf,
    catalog: Option<Arc<dyn CatalogClient>>,
    locks: KeyedLocks,
    query_timeout: Duration,
    download_timeout: Duration,
}

impl SceneRepository {
    pub fn new(store: impl Into<PathBuf>) -> Result<Self> {
        let store = store.into();
        fs::create_dir_all(&store)?;
        Ok(Self {
            store,
            catalog: None,
            locks: KeyedLocks::new(),
            query_timeout: Duration::from_secs(60),
            download_timeout: Duration::from_secs(600),
        })
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn CatalogClient>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_timeouts(mut self, query: Duration, download: Duration) -> Self {
        self.query_timeout = query;
        self.download_timeout = download;
        self
    }

    pub fn store(&self) -> &Path {
        &self.store
    }

    /// Deterministic location of a product in the store.
    pub fn product_dir(&self, product_id: &str) -> PathBuf {
        self.store.join(sanitize_component(product_id))
    }

    pub async fn resolve(
        &self,
        aoi: &AreaOfInterest,
        window: &DateWindow,
        cloud: &CloudBounds,
        reuse_path: Option<&Path>,
    ) -> Result<Scene> {
        match reuse_path {
            Some(path) => self.resolve_local(path).await,
            None => {
                let query = SceneQuery {
                    aoi: aoi.clone(),
                    window: *window,
                    cloud: *cloud,
                };
                self.resolve_remote(&query).await
            }
        }
    }

    async fn resolve_local(&self, path: &Path) -> Result<Scene> {
        if !path.exists() {
            return Err(OrchestratorError::corrupt_product(format!(
                "product {} does not exist",
                path.display()
            )));
        }

        if product::is_archive(path) {
            let archive = path.to_path_buf();
            let metadata = run_blocking(move || product::read_archive_metadata(&archive)).await?;
            let _guard = self.locks.lock(&metadata.id).await;
            if let Some(scene) = self.completed(&metadata.id).await? {
                debug!(product = %metadata.id, "archive already unpacked");
                return Ok(scene);
            }
            let scene = self.install(&metadata.id, StagedSource::Archive(path.to_path_buf())).await?;
            info!(product = %scene.id(), location = %scene.location().display(), "unpacked local archive");
            return Ok(scene);
        }

        let dir = path.to_path_buf();
        let product = run_blocking(move || LocalProduct::open(&dir)).await?;
        info!(product = %product.metadata().id, "using local product in place");
        Ok(Scene::from_product(&product))
    }

    async fn resolve_remote(&self, query: &SceneQuery) -> Result<Scene> {
        let catalog = self
            .catalog
            .as_ref()
            .ok_or_else(|| OrchestratorError::source_unavailable("no catalog configured"))?;

        let mut candidates = tokio::time::timeout(self.query_timeout, catalog.query(query))
            .await
            .map_err(|_| OrchestratorError::source_unavailable(format!("{} catalog query timed out", catalog.name())))??;
        let offered = candidates.len();
        // Catalog filters may be looser than ours.
        candidates.retain(|c| c.matches(query));
        if candidates.len() < offered {
            debug!(dropped = offered - candidates.len(), "discarded candidates outside the request");
        }

        let chosen = select_candidate(&candidates).cloned().ok_or_else(|| {
            OrchestratorError::NoMatchingScene(format!(
                "window {}, cloud cover {}, {} candidate(s) offered",
                query.window, query.cloud, offered
            ))
        })?;
        info!(
            product = %chosen.id,
            cloud_cover = chosen.cloud_cover,
            acquired_at = %chosen.acquired_at,
            "selected scene"
        );

        let _guard = self.locks.lock(&chosen.id).await;
        if let Some(scene) = self.completed(&chosen.id).await? {
            info!(product = %chosen.id, "product already in store, skipping download");
            return Ok(scene);
        }
        let chosen_id = chosen.id.clone();
        self.install(&chosen_id, StagedSource::Catalog(catalog.clone(), chosen)).await
    }

    /// Scene for an already completed product directory, if valid.
    async fn completed(&self, product_id: &str) -> Result<Option<Scene>> {
        let marker = self.product_dir(product_id).join(COMPLETION_MARKER);
        if !tokio::fs::try_exists(&marker).await? {
            return Ok(None);
        }
        let open_dir = self.product_dir(product_id);
        match run_blocking(move || LocalProduct::open(&open_dir)).await {
            Ok(product) => Ok(Some(Scene::from_product(&product))),
            Err(e) => {
                warn!(product = product_id, error = %e, "completed product failed validation, fetching again");
                if let Err(e) = tokio::fs::remove_file(&marker).await {
                    warn!(path = %marker.display(), error = %e, "failed to clear completion marker");
                }
                Ok(None)
            }
        }
    }

    /// Stage, validate and publish a product. Caller holds the product lock.
    async fn install(&self, product_id: &str, source: StagedSource) -> Result<Scene> {
        let staging = self
            .store
            .join(format!("{}{}-{}", STAGING_PREFIX, sanitize_component(product_id), uuid::Uuid::new_v4()));
        let result = self.install_staged(product_id, source, &staging).await;
        match tokio::fs::remove_dir_all(&staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %staging.display(), error = %e, "failed to remove staging directory"),
        }
        result
    }

    async fn install_staged(&self, product_id: &str, source: StagedSource, staging: &Path) -> Result<Scene> {
        tokio::fs::create_dir_all(staging).await?;
        let fetched = match source {
            StagedSource::Archive(path) => path,
            StagedSource::Catalog(catalog, candidate) => {
                let download_dir = staging.join("download");
                tokio::time::timeout(self.download_timeout, catalog.download(&candidate, &download_dir))
                    .await
                    .map_err(|_| OrchestratorError::source_unavailable(format!("download of {} timed out", candidate.id)))??
            }
        };

        let final_dir = self.product_dir(product_id);
        let unpack_dir = staging.join("product");
        let product = run_blocking(move || {
            let root = if product::is_archive(&fetched) {
                product::unpack_archive(&fetched, &unpack_dir)?;
                unpack_dir
            } else {
                fetched
            };
            let staged = LocalProduct::open(&root)?;

            if final_dir.exists() {
                fs::remove_dir_all(&final_dir)?;
            }
            fs::rename(staged.root(), &final_dir)?;
            fs::write(final_dir.join(COMPLETION_MARKER), Utc::now().to_rfc3339())?;
            LocalProduct::open(&final_dir)
        })
        .await?;

        Ok(Scene::from_product(&product))
    }
}

enum StagedSource {
    Archive(PathBuf),
    Catalog(Arc<dyn CatalogClient>, Candidate),
}
