//! Publisher permission gating
//!
//! Before a crawl fetches any content it probes every permission page the
//! AU declares. Results are kept per host key, so a content URL's permission
//! is a single map lookup. Checkers are combined as follows:
//! - daemon checkers are OR'ed: any one accepting the page is enough
//! - the AU's plugin checker, if any, must accept it as well
//!
//! Verified permission pages are stored in the repository like any other
//! crawled page.

mod checker;
mod record;

pub use checker::{
    default_daemon_checkers, CreativeCommonsPermissionChecker, PermissionChecker,
    StringPermissionChecker, CLOCKSS_PERMISSION_STATEMENT, LOCKSS_PERMISSION_STATEMENT,
};
pub use record::{PermissionRecord, PermissionStatus};

use crate::au::{window_open_at, ArchivalUnit, Clock};
use crate::crawler::{FetchOutcome, FetchRequest, UrlFetcher};
use crate::rate::CrawlRateLimiter;
use crate::status::{CrawlStatusCode, CrawlerStatus, Severity, StatusResult};
use crate::storage::{Repository, StoredContent};
use crate::url::{host_key_str, host_matches_any};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const NO_PERMISSION_STATEMENT: &str = "No permission statement on permission page";
pub const UNABLE_TO_FETCH_PERMISSION: &str = "Unable to fetch permission page";
pub const CANNOT_FETCH_PERMISSION: &str = "Cannot fetch permission page.";
pub const MISSING_PERMISSION_URL: &str = "Plugin error (missing permission URL)";
pub const NO_PERMISSION_FOR_HOST: &str = "No permission for host";
const NOT_IN_CRAWL_SPEC: &str = "Permission page not within crawl spec";
const MALFORMED_PERMISSION_URL: &str = "Malformed permission page URL";

/// Policy knobs for a [`PermissionMap`]
#[derive(Debug, Clone)]
pub struct PermissionOptions {
    pub daemon_checkers: Vec<Arc<dyn PermissionChecker>>,
    /// Host patterns that never need a permission page
    pub globally_permitted_hosts: Vec<String>,
    /// Stop at the first host without permission
    pub abort_on_first_no_permission: bool,
    pub clock: Clock,
}

impl Default for PermissionOptions {
    fn default() -> Self {
        Self {
            daemon_checkers: default_daemon_checkers(),
            globally_permitted_hosts: Vec::new(),
            abort_on_first_no_permission: false,
            clock: Clock::system(),
        }
    }
}

/// Per-host permission records for one crawl of one AU
pub struct PermissionMap {
    au: Arc<dyn ArchivalUnit>,
    fetcher: Arc<dyn UrlFetcher>,
    repository: Arc<dyn Repository>,
    rate_limiter: Arc<CrawlRateLimiter>,
    options: PermissionOptions,
    records: HashMap<String, PermissionRecord>,
}

impl PermissionMap {
    pub fn new(
        au: Arc<dyn ArchivalUnit>,
        fetcher: Arc<dyn UrlFetcher>,
        repository: Arc<dyn Repository>,
        rate_limiter: Arc<CrawlRateLimiter>,
        options: PermissionOptions,
    ) -> Self {
        Self {
            au,
            fetcher,
            repository,
            rate_limiter,
            options,
            records: HashMap::new(),
        }
    }

    /// Probes every permission page of the AU
    ///
    /// Pages are grouped by host and tried in order until one grants
    /// permission. Returns false when the crawl must not proceed: the
    /// window closed, the first denial under abort-on-first, or no host
    /// granted permission. The crawl status carries the reason.
    pub async fn populate(&mut self, status: &mut CrawlerStatus) -> StatusResult<bool> {
        let mut hosts: Vec<(String, Vec<String>)> = Vec::new();
        for page in self.au.permission_urls() {
            let Some(host) = host_key_str(page) else {
                error!("{}: {}", MALFORMED_PERMISSION_URL, page);
                status.signal_error(page, MALFORMED_PERMISSION_URL, Severity::Error)?;
                status.set_crawl_status(
                    CrawlStatusCode::PluginError,
                    Some(MALFORMED_PERMISSION_URL.to_string()),
                )?;
                return Ok(false);
            };
            match hosts.iter_mut().find(|(h, _)| *h == host) {
                Some((_, pages)) => pages.push(page.clone()),
                None => hosts.push((host, vec![page.clone()])),
            }
        }

        info!(
            "Checking permission for {} at {:?}",
            self.au.id(),
            self.au.permission_urls()
        );
        let mut granted = 0;
        let mut first_failure = None;
        for (host, pages) in &hosts {
            let result = self.check_permission_on_host(host, pages, status).await?;
            if result.is_ok() {
                granted += 1;
                continue;
            }
            if result == PermissionStatus::WindowClosed {
                status.set_crawl_status(CrawlStatusCode::WindowClosed, None)?;
                return Ok(false);
            }
            if self.options.abort_on_first_no_permission {
                info!("Aborting because no permission on {}", host);
                self.set_denial_status(result, status)?;
                return Ok(false);
            }
            warn!("No permission on {} ({})", host, result);
            first_failure.get_or_insert(result);
        }

        match first_failure {
            Some(result) if granted == 0 => {
                self.set_denial_status(result, status)?;
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    async fn check_permission_on_host(
        &mut self,
        host: &str,
        pages: &[String],
        status: &mut CrawlerStatus,
    ) -> StatusResult<PermissionStatus> {
        let mut result = PermissionStatus::Missing;
        for page in pages {
            if let Some(existing) = self.records.get(host) {
                if existing.status.is_ok() {
                    warn!(
                        "Already found permission on {}, skipping permission page {}",
                        host, page
                    );
                    break;
                }
                debug!("Previous permission page on {} failed, trying {}", host, page);
            }
            result = self.probe(page, status).await?;
            self.records
                .insert(host.to_string(), PermissionRecord::new(page, host, result));
            match result {
                PermissionStatus::Ok => {
                    debug!("Permission granted on host {}", host);
                    return Ok(result);
                }
                PermissionStatus::WindowClosed => return Ok(result),
                _ => {}
            }
        }
        Ok(result)
    }

    /// Fetches one permission page and runs the checkers over it
    async fn probe(&self, page: &str, status: &mut CrawlerStatus) -> StatusResult<PermissionStatus> {
        debug!("Checking for permission on {}", page);
        if !self.au.should_be_cached(page) {
            error!("{}: {}", NOT_IN_CRAWL_SPEC, page);
            status.signal_error(page, NOT_IN_CRAWL_SPEC, Severity::Error)?;
            return Ok(PermissionStatus::NotInCrawlSpec);
        }
        let now = self.options.clock.now();
        if !window_open_at(self.au.crawl_window(), now) {
            debug!("Crawl window closed, aborting permission check");
            return Ok(PermissionStatus::WindowClosed);
        }
        if let Err(e) = self.rate_limiter.pause_before_fetch_at(page, None, now).await {
            debug!("No rate limiter open for permission page {}: {}", page, e);
            return Ok(PermissionStatus::WindowClosed);
        }

        let au = self.au.clone();
        let in_spec = move |url: &str| au.should_be_cached(url);
        let request = FetchRequest {
            url: page,
            if_modified_since: None,
            in_spec: &in_spec,
        };
        let (headers, body) = match self.fetcher.fetch(&request).await {
            Ok(FetchOutcome::Fetched(content)) => (content.headers, content.body),
            Ok(FetchOutcome::NotModified) => {
                match self.repository.get(self.au.id(), page) {
                    Ok(Some(stored)) => (stored.headers, stored.body),
                    _ => {
                        status.signal_error(page, UNABLE_TO_FETCH_PERMISSION, Severity::Error)?;
                        return Ok(PermissionStatus::FetchFailed);
                    }
                }
            }
            Err(e) => {
                warn!("Error fetching permission page {}: {}", page, e);
                status.signal_error(
                    page,
                    format!("{}: {}", UNABLE_TO_FETCH_PERMISSION, e),
                    Severity::Error,
                )?;
                return Ok(PermissionStatus::FetchFailed);
            }
        };

        let text = String::from_utf8_lossy(&body);
        let daemon_ok = self
            .options
            .daemon_checkers
            .iter()
            .any(|checker| checker.check_permission(&text, page));
        let plugin_ok = self
            .au
            .permission_checker()
            .map_or(true, |checker| checker.check_permission(&text, page));
        if !(daemon_ok && plugin_ok) {
            warn!("No permission statement at {}", page);
            status.signal_error(page, NO_PERMISSION_STATEMENT, Severity::Error)?;
            return Ok(PermissionStatus::NotOk);
        }

        let stored = StoredContent::new(page, headers, body);
        if let Err(e) = self.repository.store(self.au.id(), &stored) {
            error!("Repository error storing permission page {}: {}", page, e);
            status.signal_error(page, format!("Can't store page: {}", e), Severity::Error)?;
            return Ok(PermissionStatus::RepositoryError);
        }
        Ok(PermissionStatus::Ok)
    }

    fn set_denial_status(
        &self,
        result: PermissionStatus,
        status: &mut CrawlerStatus,
    ) -> StatusResult<()> {
        let (code, message) = match result {
            PermissionStatus::NotOk => (CrawlStatusCode::NoPermission, NO_PERMISSION_STATEMENT),
            PermissionStatus::FetchFailed => {
                (CrawlStatusCode::NoPermission, UNABLE_TO_FETCH_PERMISSION)
            }
            PermissionStatus::Missing => (CrawlStatusCode::NoPermission, MISSING_PERMISSION_URL),
            PermissionStatus::NotInCrawlSpec => (CrawlStatusCode::PluginError, NOT_IN_CRAWL_SPEC),
            PermissionStatus::RepositoryError => (
                CrawlStatusCode::RepositoryError,
                CrawlStatusCode::RepositoryError.default_message(),
            ),
            PermissionStatus::WindowClosed => (
                CrawlStatusCode::WindowClosed,
                CrawlStatusCode::WindowClosed.default_message(),
            ),
            PermissionStatus::Ok => return Ok(()),
        };
        status.set_crawl_status(code, Some(message.to_string()))
    }

    /// True if the host is permitted without a permission page of its own
    fn is_permitted_host(&self, url: &str) -> bool {
        let Ok(parsed) = url::Url::parse(url) else {
            return false;
        };
        host_matches_any(&self.options.globally_permitted_hosts, &parsed)
            || host_matches_any(self.au.permitted_hosts(), &parsed)
    }

    /// Current permission status of a URL's host, without probing
    pub fn status_for(&self, url: &str) -> PermissionStatus {
        if self.is_permitted_host(url) {
            return PermissionStatus::Ok;
        }
        host_key_str(url)
            .and_then(|host| self.records.get(&host))
            .map_or(PermissionStatus::Missing, |record| record.status)
    }

    pub fn has_permission(&self, url: &str) -> bool {
        self.status_for(url).is_ok()
    }

    pub fn record(&self, host: &str) -> Option<&PermissionRecord> {
        self.records.get(host)
    }

    /// Checks permission for a URL about to be fetched
    ///
    /// A host whose permission page failed to fetch is probed once more
    /// when `allow_retry` is set. Denials are recorded against the URL and
    /// in the crawl status.
    pub async fn check_host_permission(
        &mut self,
        url: &str,
        allow_retry: bool,
        status: &mut CrawlerStatus,
    ) -> StatusResult<bool> {
        let Some(host) = host_key_str(url) else {
            error!("{}: {}", MALFORMED_PERMISSION_URL, url);
            status.signal_error(url, MALFORMED_PERMISSION_URL, Severity::Error)?;
            return Ok(false);
        };

        let mut retry = allow_retry;
        loop {
            let current = self.status_for(url);
            match current {
                PermissionStatus::Ok => return Ok(true),
                PermissionStatus::FetchFailed if retry => {
                    retry = false;
                    let Some(page) = self.records.get(&host).map(|r| r.url.clone()) else {
                        continue;
                    };
                    warn!("Failed to fetch permission page, retrying: {}", page);
                    let result = self.probe(&page, status).await?;
                    self.records
                        .insert(host.clone(), PermissionRecord::new(&page, &host, result));
                }
                PermissionStatus::FetchFailed => {
                    error!("Can't fetch permission page on second attempt for {}", host);
                    status.signal_error(url, NO_PERMISSION_FOR_HOST, Severity::Error)?;
                    status.set_crawl_status(
                        CrawlStatusCode::NoPermission,
                        Some(CANNOT_FETCH_PERMISSION.to_string()),
                    )?;
                    return Ok(false);
                }
                PermissionStatus::Missing => {
                    error!("No permission page specified for host of {}", url);
                    status.signal_error(url, "No permission URL for this host", Severity::Error)?;
                    status.set_crawl_status(
                        CrawlStatusCode::NoPermission,
                        Some(MISSING_PERMISSION_URL.to_string()),
                    )?;
                    return Ok(false);
                }
                denied => {
                    status.signal_error(url, NO_PERMISSION_FOR_HOST, Severity::Error)?;
                    self.set_denial_status(denied, status)?;
                    return Ok(false);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArchivalUnitConfig, StatusConfig};
    use crate::au::ConfiguredAu;
    use crate::crawler::{FetchError, FetchedContent};
    use crate::rate::RateLimiterInfo;
    use crate::status::CrawlType;
    use crate::storage::MemoryRepository;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Serves canned pages; unknown URLs fail retryably
    #[derive(Default)]
    struct PageFetcher {
        pages: Mutex<HashMap<String, Vec<String>>>,
        requests: Mutex<Vec<String>>,
    }

    impl PageFetcher {
        /// Queues responses for a URL; an empty string means a fetch failure
        fn serve(&self, url: &str, bodies: &[&str]) {
            self.pages.lock().unwrap().insert(
                url.to_string(),
                bodies.iter().rev().map(|b| b.to_string()).collect(),
            );
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UrlFetcher for PageFetcher {
        async fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchOutcome, FetchError> {
            self.requests.lock().unwrap().push(request.url.to_string());
            let body = self
                .pages
                .lock()
                .unwrap()
                .get_mut(request.url)
                .and_then(|bodies| if bodies.len() > 1 { bodies.pop() } else { bodies.last().cloned() });
            match body {
                Some(body) if !body.is_empty() => Ok(FetchOutcome::Fetched(FetchedContent {
                    url: request.url.to_string(),
                    redirects: Vec::new(),
                    headers: BTreeMap::from([("content-type".to_string(), "text/html".to_string())]),
                    body: body.into_bytes(),
                })),
                _ => Err(FetchError::Retryable {
                    url: request.url.to_string(),
                    message: "connection refused".to_string(),
                    retry_count: None,
                    retry_delay: None,
                }),
            }
        }
    }

    fn permission_page() -> String {
        format!("<html><body>{}</body></html>", LOCKSS_PERMISSION_STATEMENT)
    }

    fn create_test_au(permission_urls: &[&str]) -> Arc<dyn ArchivalUnit> {
        let config = ArchivalUnitConfig {
            id: "pub".to_string(),
            base_urls: vec!["http://pub.example/".to_string(), "http://cdn.example/".to_string()],
            start_urls: vec!["http://pub.example/index.html".to_string()],
            permission_urls: permission_urls.iter().map(|s| s.to_string()).collect(),
            ..ArchivalUnitConfig::default()
        };
        Arc::new(ConfiguredAu::from_config(&config).unwrap())
    }

    fn create_test_map(
        au: Arc<dyn ArchivalUnit>,
        fetcher: Arc<PageFetcher>,
        repository: Arc<MemoryRepository>,
        options: PermissionOptions,
    ) -> PermissionMap {
        let limiter = CrawlRateLimiter::new(&RateLimiterInfo::with_rate("unlimited")).unwrap();
        PermissionMap::new(au, fetcher, repository, Arc::new(limiter), options)
    }

    fn create_test_status() -> CrawlerStatus {
        CrawlerStatus::new("pub", "pub", CrawlType::NewContent, &StatusConfig::default())
    }

    #[tokio::test]
    async fn test_permission_granted_and_page_stored() {
        let fetcher = Arc::new(PageFetcher::default());
        fetcher.serve("http://pub.example/lockss.html", &[&permission_page()]);
        let repository = Arc::new(MemoryRepository::new());
        let au = create_test_au(&["http://pub.example/lockss.html"]);
        let mut map = create_test_map(au, fetcher, repository.clone(), PermissionOptions::default());
        let mut status = create_test_status();

        assert!(map.populate(&mut status).await.unwrap());
        assert!(map.has_permission("http://pub.example/a.html"));
        assert!(!map.has_permission("http://other.example/a.html"));
        assert!(repository
            .has_content("pub", "http://pub.example/lockss.html")
            .unwrap());
    }

    #[tokio::test]
    async fn test_missing_statement_denies() {
        let fetcher = Arc::new(PageFetcher::default());
        fetcher.serve("http://pub.example/lockss.html", &["<html>hello</html>"]);
        let repository = Arc::new(MemoryRepository::new());
        let au = create_test_au(&["http://pub.example/lockss.html"]);
        let mut map = create_test_map(au, fetcher, repository.clone(), PermissionOptions::default());
        let mut status = create_test_status();

        assert!(!map.populate(&mut status).await.unwrap());
        assert_eq!(status.code(), CrawlStatusCode::NoPermission);
        assert_eq!(status.message(), NO_PERMISSION_STATEMENT);
        assert!(status.url_errors().contains_key("http://pub.example/lockss.html"));
        assert_eq!(
            map.record("pub.example").map(|r| r.status),
            Some(PermissionStatus::NotOk)
        );
        assert!(repository.is_empty());
    }

    #[tokio::test]
    async fn test_second_page_on_host_is_tried() {
        let fetcher = Arc::new(PageFetcher::default());
        fetcher.serve("http://pub.example/a.html", &["<html>nothing</html>"]);
        fetcher.serve("http://pub.example/b.html", &[&permission_page()]);
        let au = create_test_au(&["http://pub.example/a.html", "http://pub.example/b.html"]);
        let mut map = create_test_map(
            au,
            fetcher,
            Arc::new(MemoryRepository::new()),
            PermissionOptions::default(),
        );
        let mut status = create_test_status();

        assert!(map.populate(&mut status).await.unwrap());
        assert_eq!(
            map.record("pub.example").map(|r| r.url.as_str()),
            Some("http://pub.example/b.html")
        );
    }

    #[tokio::test]
    async fn test_abort_on_first_no_permission() {
        let fetcher = Arc::new(PageFetcher::default());
        fetcher.serve("http://cdn.example/lockss.html", &["<html>nothing</html>"]);
        fetcher.serve("http://pub.example/lockss.html", &[&permission_page()]);
        let pages = ["http://cdn.example/lockss.html", "http://pub.example/lockss.html"];

        let mut status = create_test_status();
        let mut map = create_test_map(
            create_test_au(&pages),
            fetcher.clone(),
            Arc::new(MemoryRepository::new()),
            PermissionOptions {
                abort_on_first_no_permission: true,
                ..PermissionOptions::default()
            },
        );
        assert!(!map.populate(&mut status).await.unwrap());
        assert_eq!(fetcher.requests(), vec!["http://cdn.example/lockss.html"]);

        let mut status = create_test_status();
        let mut map = create_test_map(
            create_test_au(&pages),
            fetcher,
            Arc::new(MemoryRepository::new()),
            PermissionOptions::default(),
        );
        assert!(map.populate(&mut status).await.unwrap());
        assert!(map.has_permission("http://pub.example/x.html"));
        assert!(!map
            .check_host_permission("http://cdn.example/x.css", true, &mut status)
            .await
            .unwrap());
        assert_eq!(status.code(), CrawlStatusCode::NoPermission);
    }

    #[tokio::test]
    async fn test_fetch_failure_retried_once() {
        let fetcher = Arc::new(PageFetcher::default());
        fetcher.serve("http://pub.example/lockss.html", &["", &permission_page()]);
        let au = create_test_au(&["http://pub.example/lockss.html", "http://cdn.example/lockss.html"]);
        let mut map = create_test_map(
            au,
            fetcher.clone(),
            Arc::new(MemoryRepository::new()),
            PermissionOptions::default(),
        );
        let mut status = create_test_status();
        fetcher.serve("http://cdn.example/lockss.html", &[&permission_page()]);

        assert!(map.populate(&mut status).await.unwrap());
        assert_eq!(map.status_for("http://pub.example/a"), PermissionStatus::FetchFailed);
        assert!(map
            .check_host_permission("http://pub.example/a", true, &mut status)
            .await
            .unwrap());
        assert_eq!(map.status_for("http://pub.example/a"), PermissionStatus::Ok);
    }

    #[tokio::test]
    async fn test_fetch_failure_without_retry_denies() {
        let fetcher = Arc::new(PageFetcher::default());
        let au = create_test_au(&["http://pub.example/lockss.html"]);
        let mut map = create_test_map(
            au,
            fetcher,
            Arc::new(MemoryRepository::new()),
            PermissionOptions::default(),
        );
        let mut status = create_test_status();

        assert!(!map.populate(&mut status).await.unwrap());
        assert_eq!(status.message(), UNABLE_TO_FETCH_PERMISSION);
        assert!(!map
            .check_host_permission("http://pub.example/a", false, &mut status)
            .await
            .unwrap());
        assert_eq!(status.message(), CANNOT_FETCH_PERMISSION);
    }

    #[tokio::test]
    async fn test_missing_and_globally_permitted_hosts() {
        let fetcher = Arc::new(PageFetcher::default());
        fetcher.serve("http://pub.example/lockss.html", &[&permission_page()]);
        let au = create_test_au(&["http://pub.example/lockss.html"]);
        let mut map = create_test_map(
            au,
            fetcher,
            Arc::new(MemoryRepository::new()),
            PermissionOptions {
                globally_permitted_hosts: vec!["*.cdn.example".to_string()],
                ..PermissionOptions::default()
            },
        );
        let mut status = create_test_status();
        assert!(map.populate(&mut status).await.unwrap());

        assert!(map
            .check_host_permission("http://img.cdn.example/a.png", true, &mut status)
            .await
            .unwrap());
        assert!(!map
            .check_host_permission("http://elsewhere.example/a.png", true, &mut status)
            .await
            .unwrap());
        assert_eq!(status.message(), MISSING_PERMISSION_URL);
    }

    #[tokio::test]
    async fn test_permission_page_outside_rules() {
        let fetcher = Arc::new(PageFetcher::default());
        let au = create_test_au(&["http://elsewhere.example/lockss.html"]);
        let mut map = create_test_map(
            au,
            fetcher.clone(),
            Arc::new(MemoryRepository::new()),
            PermissionOptions::default(),
        );
        let mut status = create_test_status();

        assert!(!map.populate(&mut status).await.unwrap());
        assert_eq!(status.code(), CrawlStatusCode::PluginError);
        assert!(fetcher.requests().is_empty());
    }
}
