//! Infrastructure layer - history store adapters
//!
//! - `memory`: process-local store for tests and ephemeral runs
//! - `json_file`: single JSON document, rewritten atomically
//! - `sqlite`: SQLite table (feature `sqlite`)

pub mod json_file;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use json_file::JsonFileHistoryStore;
pub use memory::InMemoryHistoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteHistoryStore;
