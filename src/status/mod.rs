//! Per-crawl status accounting
//!
//! - `CrawlStatusCode`: terminal and in-progress outcome of a crawl
//! - `UrlCount`: a counter that may also retain the URLs it counted
//! - `CrawlerStatus`: every counter of one crawl, sealed once the crawl ends

mod crawler_status;
mod url_count;

pub use crawler_status::{CrawlerStatus, UrlErrorInfo};
pub use url_count::{KeepMode, StatusCategory, UrlCount};

use std::fmt;
use thiserror::Error;

/// Errors raised by status mutation
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Crawl status is sealed, cannot {0}")]
    Sealed(&'static str),
}

pub type StatusResult<T> = std::result::Result<T, StatusError>;

/// Kind of crawl a status or limiter belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrawlType {
    NewContent,
    Repair,
}

impl fmt::Display for CrawlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlType::NewContent => write!(f, "New Content"),
            CrawlType::Repair => write!(f, "Repair"),
        }
    }
}

/// Outcome of a crawl
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrawlStatusCode {
    Unknown,
    Pending,
    Active,
    Successful,
    Error,
    Aborted,
    WindowClosed,
    FetchError,
    NoPermission,
    PluginError,
    RepositoryError,
    ExtractorError,
}

impl CrawlStatusCode {
    /// Message shown when the crawl supplies none of its own
    pub fn default_message(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Pending => "Pending",
            Self::Active => "Active",
            Self::Successful => "Successful",
            Self::Error => "Error",
            Self::Aborted => "Aborted",
            Self::WindowClosed => "Interrupted by crawl window",
            Self::FetchError => "Fetch error",
            Self::NoPermission => "No permission from publisher",
            Self::PluginError => "Plugin error",
            Self::RepositoryError => "Repository error",
            Self::ExtractorError => "Link extractor error",
        }
    }

    /// Crawl has finished, in any way
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Unknown | Self::Pending | Self::Active)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Successful)
    }
}

impl fmt::Display for CrawlStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_message())
    }
}

/// How bad a per-URL error is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}
