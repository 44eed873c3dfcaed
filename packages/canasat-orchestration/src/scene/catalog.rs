//! Catalog port and the offline directory catalog.

use super::product::{is_archive, read_archive_metadata, LocalProduct, ProductMetadata};
use crate::aoi::{AreaOfInterest, CloudBounds, DateWindow};
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use canasat_raster::Bounds;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct SceneQuery {
    pub aoi: AreaOfInterest,
    pub window: DateWindow,
    pub cloud: CloudBounds,
}

/// One product offered by a catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub title: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub cloud_cover: f64,
    /// Lon/lat bounding box, when the catalog reports a footprint
    pub footprint: Option<Bounds>,
    /// Catalog-specific download handle
    pub source: String,
}

impl Candidate {
    /// Whether the candidate satisfies `query`. Unknown footprints pass.
    pub fn matches(&self, query: &SceneQuery) -> bool {
        query.window.contains(self.acquired_at)
            && query.cloud.contains(self.cloud_cover)
            && self
                .footprint
                .map_or(true, |fp| fp.intersects(&query.aoi.bounds()))
    }
}

/// Lowest cloud cover first, then most recent acquisition, then id.
pub fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    a.cloud_cover
        .total_cmp(&b.cloud_cover)
        .then_with(|| b.acquired_at.cmp(&a.acquired_at))
        .then_with(|| a.id.cmp(&b.id))
}

pub fn select_candidate(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates.iter().min_by(|a, b| compare_candidates(a, b))
}

/// Product search and download.
///
/// Implementations are already authenticated and must bound every network
/// call with a timeout.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    fn name(&self) -> &str;

    /// Candidates for `query`, in catalog order.
    async fn query(&self, query: &SceneQuery) -> Result<Vec<Candidate>>;

    /// Fetch `candidate` into `dest_dir` and return the product path
    /// (directory or archive).
    async fn download(&self, candidate: &Candidate, dest_dir: &Path) -> Result<PathBuf>;
}

// ═══════════════════════════════════════════════════════════════════════════
// LocalCatalog
// ═══════════════════════════════════════════════════════════════════════════

/// A directory of product directories and archives acting as an offline
/// mirror of the remote catalog.
pub struct LocalCatalog {
    root: PathBuf,
    downloads: AtomicUsize,
}

impl LocalCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            downloads: AtomicUsize::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of completed `download` calls.
    pub fn download_count(&self) -> usize {
        self.downloads.load(AtomicOrdering::SeqCst)
    }

    fn scan(root: &Path) -> Result<Vec<Candidate>> {
        let entries = fs::read_dir(root).map_err(|e| {
            OrchestratorError::source_unavailable(format!("catalog directory {}: {}", root.display(), e))
        })?;
        let mut candidates = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let metadata = if path.is_dir() {
                LocalProduct::open(&path).map(|p| p.metadata().clone())
            } else if is_archive(&path) {
                read_archive_metadata(&path)
            } else {
                continue;
            };
            match metadata {
                Ok(meta) => candidates.push(candidate_from_metadata(&meta, &path)),
                // One broken mirror entry must not hide the others.
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable catalog entry"),
            }
        }
        Ok(candidates)
    }
}

fn candidate_from_metadata(meta: &ProductMetadata, path: &Path) -> Candidate {
    Candidate {
        id: meta.id.clone(),
        title: meta.title.clone(),
        acquired_at: meta.acquired_at,
        cloud_cover: meta.cloud_cover,
        footprint: meta.footprint_bounds(),
        source: path.display().to_string(),
    }
}

#[async_trait]
impl CatalogClient for LocalCatalog {
    fn name(&self) -> &str {
        "local"
    }

    async fn query(&self, query: &SceneQuery) -> Result<Vec<Candidate>> {
        let root = self.root.clone();
        let mut candidates = tokio::task::spawn_blocking(move || Self::scan(&root))
            .await
            .map_err(OrchestratorError::internal)??;
        candidates.retain(|c| c.matches(query));
        // Newest first, like the remote catalog.
        candidates.sort_by(|a, b| b.acquired_at.cmp(&a.acquired_at).then_with(|| a.id.cmp(&b.id)));
        debug!(catalog = self.name(), count = candidates.len(), "catalog query");
        Ok(candidates)
    }

    async fn download(&self, candidate: &Candidate, dest_dir: &Path) -> Result<PathBuf> {
        let source = PathBuf::from(&candidate.source);
        let dest_dir = dest_dir.to_path_buf();
        let path = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            fs::create_dir_all(&dest_dir)?;
            let name = source
                .file_name()
                .ok_or_else(|| OrchestratorError::corrupt_product("catalog entry has no file name"))?;
            let target = dest_dir.join(name);
            if source.is_dir() {
                copy_dir(&source, &target)?;
            } else {
                fs::copy(&source, &target).map_err(|e| {
                    OrchestratorError::source_unavailable(format!("copying {}: {}", source.display(), e))
                })?;
            }
            Ok(target)
        })
        .await
        .map_err(OrchestratorError::internal)??;
        self.downloads.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(path)
    }
}

fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::product::ProductWriter;
    use canasat_raster::Crs;
    use chrono::TimeZone;

    fn candidate(id: &str, cloud: f64, day: u32) -> Candidate {
        Candidate {
            id: id.to_string(),
            title: None,
            acquired_at: Utc.with_ymd_and_hms(2024, 8, day, 13, 0, 0).unwrap(),
            cloud_cover: cloud,
            footprint: Some(Bounds::new(-48.0, -23.0, -46.0, -21.0)),
            source: String::new(),
        }
    }

    fn query(cloud_max: f64) -> SceneQuery {
        SceneQuery {
            aoi: AreaOfInterest::from_bbox(-47.5, -22.5, -47.0, -22.0).unwrap(),
            window: DateWindow::parse("2024-08-01", Some("2024-08-15")).unwrap(),
            cloud: CloudBounds::new(0.0, cloud_max).unwrap(),
        }
    }

    #[test]
    fn test_select_lowest_cloud_then_most_recent() {
        let candidates = vec![
            candidate("a", 12.0, 3),
            candidate("b", 4.0, 2),
            candidate("c", 4.0, 9),
            candidate("d", 20.0, 10),
        ];
        assert_eq!(select_candidate(&candidates).unwrap().id, "c");
        assert!(select_candidate(&[]).is_none());
    }

    #[test]
    fn test_candidate_matching() {
        let q = query(30.0);
        assert!(candidate("in", 8.0, 5).matches(&q));
        assert!(!candidate("cloudy", 31.0, 5).matches(&q));
        assert!(!candidate("late", 8.0, 16).matches(&q));

        let mut far = candidate("far", 8.0, 5);
        far.footprint = Some(Bounds::new(10.0, 10.0, 11.0, 11.0));
        assert!(!far.matches(&q));

        let mut unknown = candidate("unknown", 8.0, 5);
        unknown.footprint = None;
        assert!(unknown.matches(&q));
    }

    fn write_product(dir: &Path, id: &str, cloud: f64, day: u32, zipped: bool) {
        let meta = ProductMetadata::new(
            id,
            Utc.with_ymd_and_hms(2024, 8, day, 13, 0, 0).unwrap(),
            cloud,
            vec![[-47.6, -22.6], [-46.9, -22.6], [-46.9, -21.9], [-47.6, -21.9]],
            Crs::from_epsg(32723).unwrap(),
        );
        let writer = ProductWriter::new(meta);
        if zipped {
            writer.write_zip(&dir.join(format!("{}.zip", id))).unwrap();
        } else {
            writer.write_dir(dir).unwrap();
        }
    }

    #[tokio::test]
    async fn test_local_catalog_filters_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        write_product(dir.path(), "P_OLD", 8.0, 2, false);
        write_product(dir.path(), "P_NEW", 10.0, 12, true);
        write_product(dir.path(), "P_CLOUDY", 60.0, 5, false);
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        fs::write(dir.path().join("broken.zip"), "not a zip").unwrap();

        let catalog = LocalCatalog::new(dir.path());
        let found = catalog.query(&query(30.0)).await.unwrap();
        let ids: Vec<_> = found.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["P_NEW", "P_OLD"]);
    }

    #[tokio::test]
    async fn test_local_catalog_download_copies_product() {
        let mirror = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        write_product(mirror.path(), "P_DIR", 8.0, 2, false);
        write_product(mirror.path(), "P_ZIP", 8.0, 3, true);

        let catalog = LocalCatalog::new(mirror.path());
        for candidate in catalog.query(&query(30.0)).await.unwrap() {
            let path = catalog.download(&candidate, dest.path()).await.unwrap();
            assert!(path.starts_with(dest.path()));
            assert!(path.exists());
        }
        assert_eq!(catalog.download_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_catalog_root_is_source_unavailable() {
        let catalog = LocalCatalog::new("/nonexistent/canasat/mirror");
        let err = catalog.query(&query(30.0)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::SourceUnavailable(_)));
    }
}
