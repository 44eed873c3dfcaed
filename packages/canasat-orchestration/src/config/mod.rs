//! Pipeline configuration
//!
//! Precedence: built-in defaults < YAML file (`version: 1`) < environment.
//! The merged result is validated before use.
//!
//! ```yaml
//! version: 1
//! storage:
//!   scene_store: /var/lib/canasat/scenes
//!   history_backend: sqlite
//! jobs:
//!   max_workers: 4
//! ```

pub mod error;

pub use error::{ConfigError, ConfigResult};

use canasat_raster::{Band, ResamplingMethod};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SUPPORTED_VERSIONS: &[u64] = &[1];

pub const ENV_SCENE_STORE: &str = "CANASAT_SCENE_STORE";
pub const ENV_CACHE_DIR: &str = "CANASAT_CACHE_DIR";
pub const ENV_HISTORY_PATH: &str = "CANASAT_HISTORY_PATH";
pub const ENV_MAX_WORKERS: &str = "CANASAT_MAX_WORKERS";
pub const ENV_NETWORK_TIMEOUT: &str = "CANASAT_NETWORK_TIMEOUT_SECS";
pub const ENV_API_URL: &str = "SENTINEL_API_URL";

pub const DEFAULT_API_URL: &str = "https://catalogue.dataspace.copernicus.eu/odata/v1/";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub storage: StorageConfig,
    pub extraction: ExtractionConfig,
    pub indexing: IndexingConfig,
    pub jobs: JobsConfig,
    pub network: NetworkConfig,
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryBackend {
    Json,
    Sqlite,
    Memory,
}

impl HistoryBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryBackend::Json => "json",
            HistoryBackend::Sqlite => "sqlite",
            HistoryBackend::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Unpacked products, one directory per product id
    pub scene_store: PathBuf,
    pub cache_dir: PathBuf,
    pub export_dir: PathBuf,
    pub history_backend: HistoryBackend,
    pub history_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            scene_store: PathBuf::from("data/scenes"),
            cache_dir: PathBuf::from("data/cache"),
            export_dir: PathBuf::from("data/exports"),
            history_backend: HistoryBackend::Json,
            history_path: PathBuf::from("data/jobs_history.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractionConfig {
    pub bands: Vec<Band>,
    /// Band whose native resolution defines the reference grid
    pub reference_band: Band,
    pub resampling: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            bands: Band::ALL.to_vec(),
            reference_band: Band::Nir,
            resampling: ResamplingMethod::default().as_str().to_string(),
        }
    }
}

impl ExtractionConfig {
    pub fn resampling_method(&self) -> ConfigResult<ResamplingMethod> {
        ResamplingMethod::from_str(&self.resampling).map_err(ConfigError::invalid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexingConfig {
    pub mask_epsilon: f64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            mask_epsilon: canasat_raster::DEFAULT_MASK_EPSILON,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobsConfig {
    pub max_workers: usize,
    /// Terminal jobs kept in memory and in the history store
    pub history_retention: usize,
    /// Log lines kept per job
    pub log_capacity: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_workers: (num_cpus::get() * 3 / 4).max(1), // 75% of cores
            history_retention: 200,
            log_capacity: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub max_redirects: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            download_timeout_secs: 600,
            max_redirects: 5,
        }
    }
}

impl NetworkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    pub api_url: String,
    /// Directory of products served by the offline catalog instead of the API
    pub local_mirror: Option<PathBuf>,
    /// Environment variable holding the bearer token
    pub access_token_env: String,
    pub collection: String,
    pub product_type: String,
    pub max_candidates: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            local_mirror: None,
            access_token_env: "SENTINEL_ACCESS_TOKEN".to_string(),
            collection: "SENTINEL-2".to_string(),
            product_type: "S2MSI2A".to_string(),
            max_candidates: 20,
        }
    }
}

impl PipelineConfig {
    /// Defaults, then `path` if given, then environment, then validation.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from YAML file (v1 schema)
    pub fn from_yaml(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let mut document: serde_yaml::Value = serde_yaml::from_str(content)?;
        let mapping = document
            .as_mapping_mut()
            .ok_or(ConfigError::MissingVersion)?;
        let version = mapping.remove("version").ok_or(ConfigError::MissingVersion)?;
        let found = version
            .as_u64()
            .ok_or_else(|| ConfigError::invalid("'version' must be a positive integer"))?;
        if !SUPPORTED_VERSIONS.contains(&found) {
            return Err(ConfigError::UnsupportedVersion {
                found,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }
        Ok(serde_yaml::from_value(document)?)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        let mut document = serde_yaml::Mapping::new();
        document.insert("version".into(), serde_yaml::Value::Number(1u64.into()));
        if let serde_yaml::Value::Mapping(sections) = serde_yaml::to_value(self)? {
            document.extend(sections);
        }
        Ok(serde_yaml::to_string(&document)?)
    }

    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup` (an environment stand-in).
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty(ENV_SCENE_STORE) {
            self.storage.scene_store = PathBuf::from(v);
        }
        if let Some(v) = non_empty(ENV_CACHE_DIR) {
            self.storage.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = non_empty(ENV_HISTORY_PATH) {
            self.storage.history_path = PathBuf::from(v);
        }
        if let Some(v) = non_empty(ENV_MAX_WORKERS) {
            self.jobs.max_workers = v.trim().parse().map_err(|_| {
                ConfigError::invalid(format!("{} must be an integer, got '{}'", ENV_MAX_WORKERS, v))
            })?;
        }
        if let Some(v) = non_empty(ENV_NETWORK_TIMEOUT) {
            self.network.timeout_secs = v.trim().parse().map_err(|_| {
                ConfigError::invalid(format!(
                    "{} must be an integer, got '{}'",
                    ENV_NETWORK_TIMEOUT, v
                ))
            })?;
        }
        if let Some(v) = non_empty(ENV_API_URL) {
            self.catalog.api_url = v.trim().to_string();
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        check_range("jobs.max_workers", self.jobs.max_workers, 1, 256, "At least one worker is required")?;
        check_range(
            "jobs.history_retention",
            self.jobs.history_retention,
            1,
            100_000,
            "Keep at least the most recent job",
        )?;
        check_range(
            "jobs.log_capacity",
            self.jobs.log_capacity,
            10,
            100_000,
            "Job logs need room for every step",
        )?;
        check_range(
            "network.timeout_secs",
            self.network.timeout_secs,
            1,
            3_600,
            "Every network call carries a timeout",
        )?;
        check_range(
            "network.download_timeout_secs",
            self.network.download_timeout_secs,
            1,
            86_400,
            "Product downloads carry a timeout",
        )?;
        check_range("network.max_redirects", self.network.max_redirects, 0, 20, "")?;
        check_range("catalog.max_candidates", self.catalog.max_candidates, 1, 1_000, "")?;

        let eps = self.indexing.mask_epsilon;
        if !(eps.is_finite() && eps > 0.0 && eps < 1.0) {
            return Err(ConfigError::range_with_hint(
                "indexing.mask_epsilon",
                eps,
                "0 (exclusive)",
                "1 (exclusive)",
                "Denominators below this magnitude are masked",
            ));
        }

        if self.extraction.bands.is_empty() {
            return Err(ConfigError::invalid("extraction.bands must not be empty"));
        }
        self.extraction.resampling_method()?;

        if self.catalog.local_mirror.is_none() && self.catalog.api_url.trim().is_empty() {
            return Err(ConfigError::invalid(
                "catalog.api_url is required when no local mirror is configured",
            ));
        }
        Ok(())
    }
}

fn check_range<T>(field: &str, value: T, min: T, max: T, hint: &str) -> ConfigResult<()>
where
    T: PartialOrd + ToString,
{
    if value < min || value > max {
        return Err(ConfigError::range_with_hint(field, value, min, max, hint));
    }
    Ok(())
}
