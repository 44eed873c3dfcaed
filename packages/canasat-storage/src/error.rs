//! Error types for canasat-storage

use std::fmt;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Database errors (SQLite)
    Database,
    /// Serialization/deserialization errors
    Serialization,
    /// Cached artifact exists but cannot be trusted
    CacheCorruption,
    /// History entry not found
    EntryNotFound,
    /// Invalid cache key or store configuration
    Config,
    /// I/O errors
    IO,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::CacheCorruption => "cache_corruption",
            ErrorKind::EntryNotFound => "entry_not_found",
            ErrorKind::Config => "config",
            ErrorKind::IO => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn cache_corruption(artifact: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::CacheCorruption,
            format!("Cached artifact {} is corrupt: {}", artifact.into(), reason),
        )
    }

    pub fn entry_not_found(id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::EntryNotFound,
            format!("History entry not found: {}", id.into()),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        Self::new(ErrorKind::IO, format!("{}: {}", context.into(), err)).with_source(err)
    }

    pub fn is_corruption(&self) -> bool {
        self.kind == ErrorKind::CacheCorruption
    }
}

// SQLite error conversions
#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::database(format!("SQLite error: {}", err)).with_source(err)
    }
}

// JSON error conversions
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::new(ErrorKind::IO, format!("I/O error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    // ═══════════════════════════════════════════════════════════════════════
    // Error Construction Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_database_error() {
        let err = StorageError::database("Connection failed");
        assert_eq!(err.kind, ErrorKind::Database);
        assert!(err.source.is_none());
        assert_eq!(format!("{}", err), "[database] Connection failed");
    }

    #[test]
    fn test_cache_corruption_error() {
        let err = StorageError::cache_corruption("S2A_X/band/nir", "empty file");
        assert!(err.is_corruption());
        let msg = format!("{}", err);
        assert!(msg.starts_with("[cache_corruption]"));
        assert!(msg.contains("S2A_X/band/nir"));
        assert!(msg.contains("empty file"));
    }

    #[test]
    fn test_entry_not_found() {
        let err = StorageError::entry_not_found("job-42");
        assert_eq!(err.kind, ErrorKind::EntryNotFound);
        assert!(format!("{}", err).contains("job-42"));
    }

    #[test]
    fn test_io_keeps_source() {
        use std::io;

        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err = StorageError::io("writing slot", io_err);
        assert_eq!(err.kind, ErrorKind::IO);
        let source = err.source().unwrap();
        assert!(source.to_string().contains("denied"));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ErrorKind Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_error_kind_as_str() {
        assert_eq!(ErrorKind::Database.as_str(), "database");
        assert_eq!(ErrorKind::Serialization.as_str(), "serialization");
        assert_eq!(ErrorKind::CacheCorruption.as_str(), "cache_corruption");
        assert_eq!(ErrorKind::EntryNotFound.as_str(), "entry_not_found");
        assert_eq!(ErrorKind::Config.as_str(), "config");
        assert_eq!(ErrorKind::IO.as_str(), "io");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Conversion Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_from_rusqlite_error() {
        let err: StorageError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.kind, ErrorKind::Database);
        assert!(err.message.contains("SQLite error"));
        assert!(err.source.is_some());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json")
            .err()
            .unwrap();
        let err: StorageError = json_err.into();
        assert_eq!(err.kind, ErrorKind::Serialization);
        assert!(err.message.contains("JSON error"));
    }

    #[test]
    fn test_result_propagation() {
        fn inner() -> Result<()> {
            Err(StorageError::entry_not_found("x"))
        }

        fn outer() -> Result<()> {
            inner()?;
            Ok(())
        }

        assert_eq!(outer().unwrap_err().kind, ErrorKind::EntryNotFound);
    }
}
