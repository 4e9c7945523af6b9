use crate::au::{CrawlWindow, RuleAction};
use crate::crawler::{FetchResultKind, RedirectPolicy};
use crate::rate::RateLimiterInfo;
use crate::status::{KeepMode, StatusCategory};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Main configuration structure for Sumi-Harvest
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(rename = "user-agent", default)]
    pub user_agent: UserAgentConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(rename = "archival-unit", default)]
    pub archival_units: Vec<ArchivalUnitConfig>,
}

/// Traversal engine behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Nodes deeper than this are parked and not fetched
    #[serde(rename = "max-crawl-depth")]
    pub max_crawl_depth: u32,

    /// Nodes at or above this depth are refetched even when cached
    #[serde(rename = "refetch-depth")]
    pub refetch_depth: u32,

    /// Number of excluded URLs remembered per crawl
    #[serde(rename = "excluded-cache-size")]
    pub excluded_cache_size: usize,

    #[serde(rename = "default-retry-count")]
    pub default_retry_count: u32,

    /// Delay between retries when the error carries none (milliseconds)
    #[serde(rename = "default-retry-delay")]
    pub default_retry_delay: u64,

    /// Floor applied to every retry delay (milliseconds)
    #[serde(rename = "min-retry-delay")]
    pub min_retry_delay: u64,

    /// Cap applied to every retry count
    #[serde(rename = "max-retry-count")]
    pub max_retry_count: u32,

    #[serde(rename = "abort-on-first-no-permission")]
    pub abort_on_first_no_permission: bool,

    /// A start URL that cannot be fetched fails the whole crawl
    #[serde(rename = "fail-on-start-url-error")]
    pub fail_on_start_url_error: bool,

    /// End the crawl if a fetch happened without a rate limiter pause
    #[serde(rename = "throw-if-rate-limiter-not-used")]
    pub throw_if_rate_limiter_not_used: bool,

    #[serde(rename = "explode-archives")]
    pub explode_archives: bool,

    /// Also store the archive itself after exploding it
    #[serde(rename = "store-archives")]
    pub store_archives: bool,

    #[serde(rename = "max-explode-retries")]
    pub max_explode_retries: u32,

    /// Hosts (wildcards allowed) needing no permission page
    #[serde(rename = "globally-permitted-hosts")]
    pub globally_permitted_hosts: Vec<String>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_crawl_depth: 1000,
            refetch_depth: 1,
            excluded_cache_size: 1000,
            default_retry_count: 3,
            default_retry_delay: 10_000,
            min_retry_delay: 1_000,
            max_retry_count: 10,
            abort_on_first_no_permission: false,
            fail_on_start_url_error: true,
            throw_if_rate_limiter_not_used: true,
            explode_archives: true,
            store_archives: false,
            max_explode_retries: 3,
            globally_permitted_hosts: Vec::new(),
        }
    }
}

/// HTTP client configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Seconds allowed to establish a connection
    #[serde(rename = "connect-timeout")]
    pub connect_timeout: u64,

    /// Seconds allowed for a whole response; much larger than the connect timeout
    #[serde(rename = "data-timeout")]
    pub data_timeout: u64,

    #[serde(rename = "redirect-policy")]
    pub redirect_policy: RedirectPolicy,

    #[serde(rename = "max-redirects")]
    pub max_redirects: u32,

    /// Status code overrides, e.g. `"403" = "fatal"`
    #[serde(rename = "result-map")]
    pub result_map: BTreeMap<String, FetchResultKind>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 60,
            data_timeout: 1800,
            redirect_policy: RedirectPolicy::FollowOnHost,
            max_redirects: 10,
            result_map: BTreeMap::new(),
        }
    }
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UserAgentConfig {
    /// Name of the crawler
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

impl Default for UserAgentConfig {
    fn default() -> Self {
        Self {
            crawler_name: "SumiHarvest".to_string(),
            crawler_version: env!("CARGO_PKG_VERSION").to_string(),
            contact_url: "https://example.org/sumi-harvest".to_string(),
            contact_email: "crawler@example.org".to_string(),
        }
    }
}

impl UserAgentConfig {
    /// `Name/Version (+url; email)`
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

/// How much per-URL detail a crawl status keeps
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub fetched: KeepMode,
    pub excluded: KeepMode,
    #[serde(rename = "not-modified")]
    pub not_modified: KeepMode,
    pub parsed: KeepMode,
    pub pending: KeepMode,

    /// Categories whose URL collections survive sealing
    #[serde(rename = "keep-after-seal")]
    pub keep_after_seal: Vec<StatusCategory>,

    /// Off-host excluded URLs retained before only counting
    #[serde(rename = "keep-off-host-excludes")]
    pub keep_off_host_excludes: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            fetched: KeepMode::List,
            excluded: KeepMode::Set,
            not_modified: KeepMode::List,
            parsed: KeepMode::List,
            pending: KeepMode::Set,
            keep_after_seal: vec![StatusCategory::Excluded],
            keep_off_host_excludes: 50,
        }
    }
}

/// Admission control and worker pool
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    #[serde(rename = "pool-size")]
    pub pool_size: usize,

    /// Crawls that may wait for a worker before admission fails
    #[serde(rename = "queue-size")]
    pub queue_size: usize,

    /// Run crawls on the bounded pool rather than directly
    #[serde(rename = "use-pool")]
    pub use_pool: bool,

    /// Per-AU rate of new content crawl starts
    #[serde(rename = "new-content-rate")]
    pub new_content_rate: String,

    /// Per-AU rate of repair crawl starts
    #[serde(rename = "repair-rate")]
    pub repair_rate: String,

    /// Global stagger between crawl starts
    #[serde(rename = "start-rate")]
    pub start_rate: String,

    /// Finished crawl statuses remembered
    #[serde(rename = "history-size")]
    pub history_size: usize,
}

/// Upper bound on `queue-size`
pub const MAX_QUEUE_SIZE: usize = 200;

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            pool_size: 15,
            queue_size: 100,
            use_pool: true,
            new_content_rate: "1/18h".to_string(),
            repair_rate: "50/1d".to_string(),
            start_rate: "1/730".to_string(),
            history_size: 50,
        }
    }
}

/// End-of-crawl report dispatch
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub enabled: bool,
    pub recipient: Option<String>,
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Path to the SQLite content repository
    #[serde(rename = "database-path")]
    pub database_path: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            database_path: "./harvest.db".to_string(),
        }
    }
}

/// One ordered crawl rule of an AU
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlRuleConfig {
    pub action: RuleAction,
    pub pattern: String,
}

/// An `[[archival-unit]]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArchivalUnitConfig {
    pub id: String,
    pub name: Option<String>,

    #[serde(rename = "base-urls")]
    pub base_urls: Vec<String>,

    #[serde(rename = "start-urls")]
    pub start_urls: Vec<String>,

    #[serde(rename = "permission-urls")]
    pub permission_urls: Vec<String>,

    /// Ordered rules; empty means everything under the base URLs
    #[serde(rename = "crawl-rules")]
    pub crawl_rules: Vec<CrawlRuleConfig>,

    /// Overrides `[crawler] refetch-depth` for this AU
    #[serde(rename = "refetch-depth")]
    pub refetch_depth: Option<u32>,

    #[serde(rename = "crawl-window")]
    pub crawl_window: Option<CrawlWindow>,

    /// `rate`, `url-rates`, `mime-rates` and `window-rates`
    #[serde(flatten)]
    pub rate_limits: RateLimiterInfo,

    /// AUs with the same key share a fetch rate limiter
    #[serde(rename = "rate-limiter-key")]
    pub rate_limiter_key: Option<String>,

    /// URLs matching this regex are exploded as archives
    #[serde(rename = "explode-pattern")]
    pub explode_pattern: Option<String>,

    /// First path segment of an archive entry to the base URL it is stored under
    #[serde(rename = "explode-stems")]
    pub explode_stems: BTreeMap<String, String>,

    /// Extra statement the permission page must contain
    #[serde(rename = "permission-statement")]
    pub permission_statement: Option<String>,

    #[serde(rename = "max-repeated-path-segments")]
    pub max_repeated_path_segments: usize,

    /// Hosts whose content needs no permission page of their own
    #[serde(rename = "permitted-hosts")]
    pub permitted_hosts: Vec<String>,

    /// Bookkeeping AUs are admitted ahead of others
    pub bookkeeping: bool,
}

impl Default for ArchivalUnitConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: None,
            base_urls: Vec::new(),
            start_urls: Vec::new(),
            permission_urls: Vec::new(),
            crawl_rules: Vec::new(),
            refetch_depth: None,
            crawl_window: None,
            rate_limits: RateLimiterInfo::default(),
            rate_limiter_key: None,
            explode_pattern: None,
            explode_stems: BTreeMap::new(),
            permission_statement: None,
            max_repeated_path_segments: crate::au::DEFAULT_MAX_REPEATED_PATH_SEGMENTS,
            permitted_hosts: Vec::new(),
            bookkeeping: false,
        }
    }
}
