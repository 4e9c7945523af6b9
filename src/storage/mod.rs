//! Storage module for crawled content
//!
//! This module provides the content repository the crawler writes to:
//! - `Repository`: store bytes with headers, check and read back cached URLs
//! - `SqliteRepository`: SQLite-backed repository with schema management
//! - `MemoryRepository`: in-process repository for tests and dry runs

mod memory;
mod schema;
mod sqlite;
mod traits;

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;
pub use traits::{Repository, StorageError, StorageResult, StoredContent};

use std::path::Path;

/// Opens or creates the SQLite repository at `path`
pub fn open_repository(path: &Path) -> StorageResult<SqliteRepository> {
    SqliteRepository::new(path)
}
