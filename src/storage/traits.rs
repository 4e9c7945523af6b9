//! Storage traits and error types
//!
//! The crawler only needs a narrow repository: store bytes with headers,
//! ask whether a URL is cached, read it back.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// A stored resource: body plus the response headers it was fetched with
///
/// Dropping a `StoredContent` releases it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredContent {
    pub url: String,
    /// Header names are lowercase
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl StoredContent {
    pub fn new(url: &str, headers: BTreeMap<String, String>, body: Vec<u8>) -> Self {
        Self {
            url: url.to_string(),
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
            body,
            fetched_at: Utc::now(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.header("last-modified")
    }
}

/// Content repository shared by every running crawl
///
/// Implementations must be safe to call from many crawls at once; the
/// manager's activity locks keep two crawls off the same AU.
pub trait Repository: Send + Sync {
    /// Stores (or replaces) the content of a URL within an AU
    fn store(&self, au_id: &str, content: &StoredContent) -> StorageResult<()>;

    fn has_content(&self, au_id: &str, url: &str) -> StorageResult<bool>;

    fn get(&self, au_id: &str, url: &str) -> StorageResult<Option<StoredContent>>;

    /// Every stored URL of an AU, sorted
    fn urls(&self, au_id: &str) -> StorageResult<Vec<String>>;

    /// Total body bytes stored for an AU
    fn au_size(&self, au_id: &str) -> StorageResult<u64>;
}
