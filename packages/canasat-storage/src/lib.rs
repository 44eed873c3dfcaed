//! Canasat Storage
//!
//! Persistence for scene processing:
//! - Content-addressed artifact cache with single-flight computation
//! - Job history store (JSON file, SQLite, in-memory)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Domain (JobHistoryEntry, port trait)   │
//! └─────────────────┬───────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────┐
//! │  Infrastructure (json_file, sqlite, mem)│
//! └─────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────┐
//! │  Cache (keys, slots, atomic writes)     │
//! │    └─ sync::KeyedLocks (per-key mutex)  │
//! └─────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod sync;

pub use cache::{
    sanitize_component, write_atomic, write_atomic_blocking, ArtifactCache, ArtifactKind,
    ArtifactOrigin, CacheKey, CacheStats, CachedArtifact, Fingerprint, FingerprintBuilder,
};
pub use domain::{JobHistoryEntry, JobHistoryStore};
pub use error::{ErrorKind, Result, StorageError};
pub use infrastructure::{InMemoryHistoryStore, JsonFileHistoryStore};
pub use sync::{KeyedGuard, KeyedLocks};

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteHistoryStore;
