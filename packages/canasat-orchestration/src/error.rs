use crate::config::ConfigError;
use canasat_raster::RasterError;
use canasat_storage::StorageError;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Longest redacted message, in characters.
const MAX_REDACTED_LEN: usize = 240;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("No matching scene: {0}")]
    NoMatchingScene(String),

    #[error("Corrupt product: {0}")]
    CorruptProduct(String),

    #[error("Missing band '{band}': {reason}")]
    MissingBand { band: String, reason: String },

    #[error("Unsupported index '{index}': {reason}")]
    UnsupportedIndex { index: String, reason: String },

    #[error("Cache corruption: {0}")]
    CacheCorruption(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("No artifacts produced: {0}")]
    NoArtifacts(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Raster error: {0}")]
    Raster(#[from] RasterError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn source_unavailable<E: std::fmt::Display>(e: E) -> Self {
        Self::SourceUnavailable(e.to_string())
    }

    pub fn corrupt_product<E: std::fmt::Display>(e: E) -> Self {
        Self::CorruptProduct(e.to_string())
    }

    pub fn invalid_request<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidRequest(e.to_string())
    }

    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    pub fn missing_band(band: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::MissingBand {
            band: band.into(),
            reason: reason.to_string(),
        }
    }

    pub fn unsupported_index(index: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::UnsupportedIndex {
            index: index.into(),
            reason: reason.to_string(),
        }
    }

    /// Taxonomy tag exposed to callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceUnavailable(_) | Self::Timeout(_) => ErrorKind::SourceUnavailable,
            Self::NoMatchingScene(_) => ErrorKind::NoMatchingScene,
            Self::CorruptProduct(_) => ErrorKind::CorruptProduct,
            Self::MissingBand { .. } => ErrorKind::MissingBand,
            Self::UnsupportedIndex { .. } => ErrorKind::UnsupportedIndex,
            Self::CacheCorruption(_) => ErrorKind::CacheCorruption,
            Self::Storage(e) if e.is_corruption() => ErrorKind::CacheCorruption,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NoArtifacts(_) => ErrorKind::NoArtifacts,
            Self::InvalidRequest(_) | Self::Config(_) => ErrorKind::InvalidRequest,
            Self::JobNotFound(_) => ErrorKind::NotFound,
            Self::InvalidStateTransition { .. }
            | Self::Raster(_)
            | Self::Storage(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Internal(_)
            | Self::Other(_) => ErrorKind::Internal,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind().category()
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Short, redacted explanation suitable for a job poller.
    pub fn summary(&self) -> String {
        let headline = self.kind().headline();
        let detail = match self {
            Self::Cancelled => String::new(),
            Self::SourceUnavailable(m)
            | Self::NoMatchingScene(m)
            | Self::CorruptProduct(m)
            | Self::CacheCorruption(m)
            | Self::NoArtifacts(m)
            | Self::InvalidRequest(m)
            | Self::Timeout(m)
            | Self::JobNotFound(m)
            | Self::Internal(m) => m.clone(),
            other => other.to_string(),
        };
        let detail = redact(&detail);
        if detail.is_empty() {
            headline.to_string()
        } else {
            redact(&format!("{}: {}", headline, detail))
        }
    }
}

/// Error taxonomy shared by jobs, manifests and history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceUnavailable,
    NoMatchingScene,
    CorruptProduct,
    MissingBand,
    UnsupportedIndex,
    CacheCorruption,
    Cancelled,
    NoArtifacts,
    InvalidRequest,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SourceUnavailable => "source_unavailable",
            ErrorKind::NoMatchingScene => "no_matching_scene",
            ErrorKind::CorruptProduct => "corrupt_product",
            ErrorKind::MissingBand => "missing_band",
            ErrorKind::UnsupportedIndex => "unsupported_index",
            ErrorKind::CacheCorruption => "cache_corruption",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::NoArtifacts => "no_artifacts",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "source_unavailable" => Ok(ErrorKind::SourceUnavailable),
            "no_matching_scene" => Ok(ErrorKind::NoMatchingScene),
            "corrupt_product" => Ok(ErrorKind::CorruptProduct),
            "missing_band" => Ok(ErrorKind::MissingBand),
            "unsupported_index" => Ok(ErrorKind::UnsupportedIndex),
            "cache_corruption" => Ok(ErrorKind::CacheCorruption),
            "cancelled" => Ok(ErrorKind::Cancelled),
            "no_artifacts" => Ok(ErrorKind::NoArtifacts),
            "invalid_request" => Ok(ErrorKind::InvalidRequest),
            "not_found" => Ok(ErrorKind::NotFound),
            "internal" => Ok(ErrorKind::Internal),
            _ => Err(OrchestratorError::serialization(format!(
                "Invalid error kind: {}",
                s
            ))),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorKind::SourceUnavailable | ErrorKind::CacheCorruption => ErrorCategory::Transient,
            ErrorKind::Internal => ErrorCategory::Infrastructure,
            _ => ErrorCategory::Permanent,
        }
    }

    fn headline(&self) -> &'static str {
        match self {
            ErrorKind::SourceUnavailable => "scene source unavailable, try again later",
            ErrorKind::NoMatchingScene => {
                "no scene found for the given window and cloud-cover bound"
            }
            ErrorKind::CorruptProduct => "scene product could not be read",
            ErrorKind::MissingBand => "band unavailable",
            ErrorKind::UnsupportedIndex => "index unavailable",
            ErrorKind::CacheCorruption => "cached artifact was corrupt",
            ErrorKind::Cancelled => "job was cancelled",
            ErrorKind::NoArtifacts => "no bands or indices could be produced",
            ErrorKind::InvalidRequest => "invalid request",
            ErrorKind::NotFound => "not found",
            ErrorKind::Internal => "internal error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error category for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Retry may succeed (network, timeouts, recomputable cache entries)
    Transient,
    /// Same request fails again (no scene, corrupt product, bad input)
    Permanent,
    /// Local environment problem (disk, panics)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(OrchestratorError::serialization(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Redaction
// ═══════════════════════════════════════════════════════════════════════════

static URL_USERINFO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z][A-Za-z0-9+.\-]*://)[^/@\s]+@").expect("valid regex"));

static BEARER_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/=\-]+").expect("valid regex"));

static CREDENTIAL_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b((?:access_|refresh_|id_)?token|password|passwd|secret|client_secret|api[_\-]?key)(\s*[=:]\s*)[^\s,;&]+",
    )
    .expect("valid regex")
});

static UNIX_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(^|[\s'"(\[=])(/[^\s'"()\[\],;]+)"#).expect("valid regex")
});

static WINDOWS_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(^|[\s'"(\[=])([A-Za-z]:\\[^\s'"()\[\],;]+)"#).expect("valid regex")
});

fn file_name_of(path: &str, separator: char) -> &str {
    path.trim_end_matches(separator)
        .rsplit(separator)
        .find(|segment| !segment.is_empty())
        .unwrap_or("")
}

/// Strip credentials, bearer tokens, URL user-info and absolute paths.
///
/// Only the first line is kept and the result is truncated.
pub fn redact(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or("").trim();

    let text = URL_USERINFO.replace_all(first_line, "${1}[redacted]@");
    let text = BEARER_TOKEN.replace_all(&text, "Bearer [redacted]");
    let text = CREDENTIAL_ASSIGNMENT.replace_all(&text, "${1}${2}[redacted]");
    let text = UNIX_PATH.replace_all(&text, |caps: &Captures| {
        format!("{}{}", &caps[1], file_name_of(&caps[2], '/'))
    });
    let text = WINDOWS_PATH.replace_all(&text, |caps: &Captures| {
        format!("{}{}", &caps[1], file_name_of(&caps[2], '\\'))
    });

    if text.chars().count() > MAX_REDACTED_LEN {
        let mut truncated: String = text.chars().take(MAX_REDACTED_LEN).collect();
        truncated.push_str("...");
        truncated
    } else {
        text.into_owned()
    }
}
