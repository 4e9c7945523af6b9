//! Sumi-Harvest: a preservation crawler for archival units
//!
//! This crate crawls archival units (AUs), bounded collections of web
//! content defined by base URLs and crawl rules, into a local repository.
//! Crawls are polite (per-host permission pages, shared fetch rate limits,
//! crawl windows) and thorough (minimum-depth traversal, retries, archive
//! explosion), and many of them run at once under a [`crawler::CrawlManager`].

pub mod au;
pub mod config;
pub mod crawler;
pub mod exploder;
pub mod permission;
pub mod rate;
pub mod state;
pub mod status;
pub mod storage;
pub mod url;

use thiserror::Error;

/// Main error type for Sumi-Harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Rate error: {0}")]
    Rate(#[from] rate::RateError),

    #[error("Crawl not admitted: {0}")]
    Admission(#[from] crawler::AdmissionError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("URL error: {0}")]
    UrlError(#[from] UrlError),

    #[error("Unknown archival unit: {0}")]
    UnknownAu(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing host in URL")]
    MissingDomain,

    #[error("Malformed URL: {0}")]
    Malformed(String),
}

/// Result type alias for Sumi-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use au::{ArchivalUnit, AuRegistry, ConfiguredAu};
pub use config::Config;
pub use crawler::{CrawlManager, CrawlServices, FollowLinkCrawler};
pub use status::{CrawlStatusCode, CrawlerStatus};
pub use url::normalize_url;
