//! Run request shared by the orchestrator and the job manager.

use crate::aoi::{AreaOfInterest, CloudBounds, DateWindow};
use canasat_raster::IndexRegistry;
use canasat_storage::Fingerprint;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowParams {
    pub aoi: AreaOfInterest,
    pub window: DateWindow,
    #[serde(default)]
    pub cloud: CloudBounds,
    /// Requested index names; empty means every registered index.
    #[serde(default)]
    pub indices: Vec<String>,
    /// Local product to analyse instead of querying the catalog.
    #[serde(default)]
    pub reuse_path: Option<PathBuf>,
}

impl WorkflowParams {
    pub fn new(aoi: AreaOfInterest, window: DateWindow) -> Self {
        Self {
            aoi,
            window,
            cloud: CloudBounds::default(),
            indices: Vec::new(),
            reuse_path: None,
        }
    }

    pub fn with_cloud(mut self, cloud: CloudBounds) -> Self {
        self.cloud = cloud;
        self
    }

    pub fn with_indices<I, S>(mut self, indices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indices = indices.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reuse_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.reuse_path = Some(path.into());
        self
    }

    /// Identity used to collapse duplicate submissions: AOI, date window and
    /// index set (case-insensitive, order-insensitive).
    /// Requested indices lowercased, sorted and deduplicated; an empty
    /// request resolves to every built-in index.
    pub fn index_set(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .indices
            .iter()
            .map(|n| n.trim().to_ascii_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        if names.is_empty() {
            names = IndexRegistry::with_builtins()
                .names()
                .into_iter()
                .map(str::to_string)
                .collect();
        }
        names.sort();
        names.dedup();
        names
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let index_set = self.index_set().join(",");

        Fingerprint::builder()
            .param("aoi", self.aoi.to_wkt())
            .param("window", self.window)
            .param("indices", index_set)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> WorkflowParams {
        WorkflowParams::new(
            AreaOfInterest::from_bbox(-47.5, -22.5, -47.0, -22.0).unwrap(),
            DateWindow::parse("2024-08-01", Some("2024-08-15")).unwrap(),
        )
    }

    #[test]
    fn test_fingerprint_ignores_index_order_and_case() {
        let a = params().with_indices(["ndvi", "NDWI"]);
        let b = params().with_indices(["ndwi", "ndvi", "ndvi"]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_ignores_cloud_bounds() {
        let a = params().with_indices(["ndvi"]);
        let b = params()
            .with_indices(["ndvi"])
            .with_cloud(CloudBounds::new(0.0, 5.0).unwrap());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_tracks_window_and_indices() {
        let base = params().with_indices(["ndvi"]);
        let other_window = WorkflowParams {
            window: DateWindow::parse("2024-08-02", Some("2024-08-15")).unwrap(),
            ..base.clone()
        };
        assert_ne!(base.fingerprint(), other_window.fingerprint());
        assert_ne!(base.fingerprint(), params().with_indices(["ndvi", "msi"]).fingerprint());
    }

    #[test]
    fn test_empty_index_request_matches_full_builtin_set() {
        let all: Vec<String> = IndexRegistry::with_builtins()
            .names()
            .into_iter()
            .rev()
            .map(str::to_ascii_uppercase)
            .collect();
        let explicit = params().with_indices(all);
        let implicit = params();
        assert!(implicit.indices.is_empty());
        assert_eq!(implicit.index_set(), explicit.index_set());
        assert_eq!(implicit.fingerprint(), explicit.fingerprint());
        assert_ne!(implicit.fingerprint(), params().with_indices(["ndvi"]).fingerprint());
    }

    #[test]
    fn test_params_json_roundtrip() {
        let p = params()
            .with_indices(["ndvi"])
            .with_reuse_path("/data/S2A.zip");
        let json = serde_json::to_string(&p).unwrap();
        let back: WorkflowParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
