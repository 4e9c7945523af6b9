use std::fmt;

/// Result of probing a host's permission page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionStatus {
    Ok,
    /// Fetched, but no checker accepted it
    NotOk,
    /// Transient failure; eligible for one more probe
    FetchFailed,
    /// No permission page is known for the host
    Missing,
    RepositoryError,
    /// The permission page itself fails the crawl rules
    NotInCrawlSpec,
    WindowClosed,
}

impl PermissionStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, PermissionStatus::Ok)
    }
}

impl fmt::Display for PermissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PermissionStatus::Ok => "ok",
            PermissionStatus::NotOk => "not ok",
            PermissionStatus::FetchFailed => "fetch failed",
            PermissionStatus::Missing => "missing",
            PermissionStatus::RepositoryError => "repository error",
            PermissionStatus::NotInCrawlSpec => "not in crawl spec",
            PermissionStatus::WindowClosed => "crawl window closed",
        };
        f.write_str(s)
    }
}

/// Permission state of one host, keyed by its host key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRecord {
    /// Permission page last probed for the host
    pub url: String,
    pub host: String,
    pub status: PermissionStatus,
}

impl PermissionRecord {
    pub fn new(url: &str, host: &str, status: PermissionStatus) -> Self {
        Self {
            url: url.to_string(),
            host: host.to_string(),
            status,
        }
    }
}
