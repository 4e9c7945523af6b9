//! Follow-link crawl engine
//!
//! A [`FollowLinkCrawler`] runs one crawl of one AU to completion: it checks
//! the crawl window, probes permission pages, seeds the queue from the start
//! URLs and then works the queue until it drains or the crawl is stopped.
//!
//! Each queued URL goes through:
//! 1. the rate gate of the AU's [`CrawlRateLimiter`]
//! 2. the fetch, retried under the crawl's retry policy
//! 3. explosion, for archives matching the AU's explode pattern
//! 4. link extraction, which grows the [`CrawlGraph`] and the queue
//!
//! Per-URL work yields a [`StepOutcome`]. Errors are recorded in the
//! [`CrawlerStatus`]; only fatal errors, aborts and a closed window leave
//! the loop early. Crawl-end actions run on every exit path.

use crate::au::{window_open_at, ArchivalUnit, AuRegistry, Clock};
use crate::config::Config;
use crate::crawler::{
    build_report, FetchError, FetchOutcome, FetchRequest, FetchedContent, LinkExtractorRegistry,
    LogReportSender, RedirectPolicy, ReportSender, UrlFetcher,
};
use crate::exploder::{mime_type_for, ExplodeError, ExplodeReport, Exploder};
use crate::permission::{default_daemon_checkers, PermissionChecker, PermissionMap, PermissionOptions};
use crate::rate::CrawlRateLimiter;
use crate::state::{CrawlGraph, CrawlQueue, CrawlUrl, NodeId, QueueError, UrlOrder};
use crate::status::{CrawlStatusCode, CrawlType, CrawlerStatus, Severity, StatusResult};
use crate::storage::{Repository, StoredContent};
use crate::url::{host_key_str, normalize_url, resolve_link};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use url::Url;

pub const ABORTED_BEFORE_START: &str = "Crawl aborted before start";
const START_URL_NOT_IN_RULES: &str = "Start URL from crawl seed not within crawl rules";
const FAILED_START_URL: &str = "Failed to fetch start url";
const COMPARATOR_ERROR: &str = "URL comparator error";
const RATE_LIMITER_NOT_USED: &str = "Rate limiter not used before fetch";
const NEVER_CRAWLED: &str = "Archival unit is filled by explosion only";
const EXPLODED_FROM_HEADER: &str = "x-harvest-exploded-from";

/// What a crawl fetches and whether it follows links
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlKind {
    /// Whole-AU discovery from the start URLs
    NewContent,
    /// Refetch of known URLs; links are not followed
    Repair { urls: Vec<String> },
}

impl CrawlKind {
    pub fn crawl_type(&self) -> CrawlType {
        match self {
            CrawlKind::NewContent => CrawlType::NewContent,
            CrawlKind::Repair { .. } => CrawlType::Repair,
        }
    }

    /// URLs the crawl is seeded with
    pub fn urls_to_follow(&self, au: &dyn ArchivalUnit) -> Vec<String> {
        match self {
            CrawlKind::NewContent => au.start_urls().to_vec(),
            CrawlKind::Repair { urls } => urls.clone(),
        }
    }

    pub fn follows_links(&self) -> bool {
        matches!(self, CrawlKind::NewContent)
    }

    /// Depth up to which cached content is fetched again
    pub fn refetch_depth(&self, au: &dyn ArchivalUnit, default: u32) -> u32 {
        match self {
            CrawlKind::NewContent => au.refetch_depth().unwrap_or(default),
            CrawlKind::Repair { .. } => u32::MAX,
        }
    }
}

/// Cooperative cancellation, polled between units of work
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Collaborators shared by every crawl
#[derive(Clone)]
pub struct CrawlServices {
    pub fetcher: Arc<dyn UrlFetcher>,
    pub repository: Arc<dyn Repository>,
    pub registry: Arc<AuRegistry>,
    pub extractors: Arc<LinkExtractorRegistry>,
    pub report_sender: Arc<dyn ReportSender>,
    pub daemon_checkers: Vec<Arc<dyn PermissionChecker>>,
    /// Time that crawl windows are checked against
    pub clock: Clock,
}

impl CrawlServices {
    /// Services with the default extractors, permission checkers and a
    /// log-backed report sender
    pub fn new(
        fetcher: Arc<dyn UrlFetcher>,
        repository: Arc<dyn Repository>,
        registry: Arc<AuRegistry>,
    ) -> Self {
        Self {
            fetcher,
            repository,
            registry,
            extractors: Arc::new(LinkExtractorRegistry::default()),
            report_sender: Arc::new(LogReportSender),
            daemon_checkers: default_daemon_checkers(),
            clock: Clock::system(),
        }
    }

    pub fn with_report_sender(mut self, sender: Arc<dyn ReportSender>) -> Self {
        self.report_sender = sender;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

/// Result of processing one URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Go on with this URL (parse it) and the rest of the queue
    Continue,
    /// Done with this URL, do not parse it
    SkipUrl,
    /// Stop the crawl: aborted or the window closed
    AbortCrawl,
    /// Stop the crawl with an error already recorded in the status
    FatalError,
}

/// What came of fetching one URL, retries included
enum FetchStep {
    Fetched(FetchedContent),
    NotModified,
    /// Redirected outside the crawl spec
    Excluded(String),
    Failed { message: String, fatal: bool },
    WindowClosed,
    Aborted,
}

/// Bounded memory of URLs known to be excluded
#[derive(Debug)]
struct ExcludedCache {
    urls: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl ExcludedCache {
    fn new(capacity: usize) -> Self {
        Self {
            urls: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn contains(&self, url: &str) -> bool {
        self.urls.contains(url)
    }

    fn insert(&mut self, url: String) {
        if self.capacity == 0 || self.urls.contains(&url) {
            return;
        }
        self.urls.insert(url.clone());
        self.order.push_back(url);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.urls.remove(&oldest);
            }
        }
    }
}

/// One crawl of one archival unit
pub struct FollowLinkCrawler {
    au: Arc<dyn ArchivalUnit>,
    kind: CrawlKind,
    config: Arc<Config>,
    services: CrawlServices,
    rate_limiter: Arc<CrawlRateLimiter>,
    permissions: PermissionMap,
    abort: AbortFlag,
    status: CrawlerStatus,

    graph: CrawlGraph,
    queue: CrawlQueue,
    processed: HashMap<String, NodeId>,
    too_deep: HashMap<String, NodeId>,
    failed_urls: HashSet<String>,
    excluded: ExcludedCache,

    max_depth: u32,
    refetch_depth: u32,
    last_pause_count: u64,
    previous_content_type: Option<String>,
}

impl FollowLinkCrawler {
    /// Creates a crawler for `au`
    ///
    /// # Arguments
    ///
    /// * `au` - The archival unit to crawl
    /// * `kind` - New content discovery or a repair of given URLs
    /// * `config` - Crawler, status and report settings
    /// * `services` - Fetcher, repository and the other shared collaborators
    /// * `rate_limiter` - The fetch limiter this AU shares with other crawls
    pub fn new(
        au: Arc<dyn ArchivalUnit>,
        kind: CrawlKind,
        config: Arc<Config>,
        services: CrawlServices,
        rate_limiter: Arc<CrawlRateLimiter>,
    ) -> Self {
        let crawler = &config.crawler;
        let permissions = PermissionMap::new(
            au.clone(),
            services.fetcher.clone(),
            services.repository.clone(),
            rate_limiter.clone(),
            PermissionOptions {
                daemon_checkers: services.daemon_checkers.clone(),
                globally_permitted_hosts: crawler.globally_permitted_hosts.clone(),
                abort_on_first_no_permission: crawler.abort_on_first_no_permission,
                clock: services.clock.clone(),
            },
        );
        let status = CrawlerStatus::new(au.id(), au.name(), kind.crawl_type(), &config.status);
        let refetch_depth = kind.refetch_depth(au.as_ref(), crawler.refetch_depth);

        Self {
            max_depth: crawler.max_crawl_depth,
            refetch_depth,
            excluded: ExcludedCache::new(crawler.excluded_cache_size),
            last_pause_count: rate_limiter.pause_counter(),
            au,
            kind,
            permissions,
            status,
            services,
            rate_limiter,
            config,
            abort: AbortFlag::new(),
            graph: CrawlGraph::new(),
            queue: CrawlQueue::breadth_first(),
            processed: HashMap::new(),
            too_deep: HashMap::new(),
            failed_urls: HashSet::new(),
            previous_content_type: None,
        }
    }

    /// Replaces the breadth-first fetch order
    pub fn with_order(mut self, order: Box<dyn UrlOrder>) -> Self {
        self.queue = CrawlQueue::new(order);
        self
    }

    /// Shares an existing abort flag with this crawl
    pub fn with_abort_flag(mut self, abort: AbortFlag) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    pub fn au(&self) -> &Arc<dyn ArchivalUnit> {
        &self.au
    }

    pub fn status(&self) -> &CrawlerStatus {
        &self.status
    }

    /// Runs the crawl and returns its sealed status
    pub async fn crawl(mut self) -> CrawlerStatus {
        info!(
            "Starting {} crawl of {}",
            self.kind.crawl_type(),
            self.au.id()
        );
        if let Err(e) = self.run_to_completion().await {
            error!("Crawl of {} stopped updating its status: {}", self.au.id(), e);
        }
        if !self.status.is_sealed() {
            let _ = self.status.seal();
        }
        self.status
    }

    async fn run_to_completion(&mut self) -> StatusResult<()> {
        self.status.signal_crawl_started()?;
        let outcome = self.run().await?;

        match outcome {
            _ if self.status.code().is_terminal() => {}
            StepOutcome::AbortCrawl => {
                self.status.set_crawl_status(CrawlStatusCode::Aborted, None)?;
            }
            _ => self.status.set_crawl_status(CrawlStatusCode::Successful, None)?,
        }

        self.crawl_end_actions()?;
        self.status.signal_crawl_ended()?;
        info!(
            "Finished crawl of {}: {}",
            self.au.id(),
            self.status.summary()
        );
        self.status.seal()
    }

    async fn run(&mut self) -> StatusResult<StepOutcome> {
        if self.abort.is_aborted() {
            info!("Crawl of {} aborted before start", self.au.id());
            self.status.set_crawl_status(
                CrawlStatusCode::Aborted,
                Some(ABORTED_BEFORE_START.to_string()),
            )?;
            return Ok(StepOutcome::AbortCrawl);
        }

        if self.kind.follows_links() {
            if self.au.is_never_crawl() {
                error!("{}: {}", NEVER_CRAWLED, self.au.id());
                self.status.set_crawl_status(
                    CrawlStatusCode::PluginError,
                    Some(NEVER_CRAWLED.to_string()),
                )?;
                return Ok(StepOutcome::FatalError);
            }
            if !self.window_open() {
                info!("Crawl window of {} is closed", self.au.id());
                self.status.set_crawl_status(CrawlStatusCode::WindowClosed, None)?;
                return Ok(StepOutcome::AbortCrawl);
            }
        }

        if !self.permissions.populate(&mut self.status).await? {
            warn!("No permission to crawl {}: {}", self.au.id(), self.status.message());
            if !self.crawl_error() {
                self.status.set_crawl_status(CrawlStatusCode::NoPermission, None)?;
            }
            return Ok(StepOutcome::FatalError);
        }

        let seeded = self.seed_queue()?;
        if seeded != StepOutcome::Continue {
            return Ok(seeded);
        }

        while let Some(id) = self.queue.pop(&self.graph) {
            if self.abort.is_aborted() {
                info!("Crawl of {} aborted", self.au.id());
                return Ok(StepOutcome::AbortCrawl);
            }
            if self.kind.follows_links() && !self.window_open() {
                info!("Crawl window of {} closed mid-crawl", self.au.id());
                self.status.set_crawl_status(CrawlStatusCode::WindowClosed, None)?;
                return Ok(StepOutcome::AbortCrawl);
            }

            let url = self.graph.node(id).url().to_string();
            self.status.remove_pending(&url)?;

            match self.fetch_node(id).await? {
                StepOutcome::Continue => {}
                StepOutcome::SkipUrl => {
                    self.processed.insert(url, id);
                    continue;
                }
                stop => return Ok(stop),
            }

            if self.abort.is_aborted() {
                return Ok(StepOutcome::AbortCrawl);
            }
            let parsed = self.parse_node(id)?;
            self.processed.insert(url, id);
            if parsed == StepOutcome::FatalError {
                return Ok(parsed);
            }
        }

        if !self.too_deep.is_empty() {
            let message = format!("Site depth exceeds max crawl depth ({})", self.max_depth);
            warn!("{}: {} URLs not fetched", message, self.too_deep.len());
            self.set_error_once(CrawlStatusCode::Error, Some(message))?;
        }
        Ok(StepOutcome::Continue)
    }

    fn window_open(&self) -> bool {
        window_open_at(self.au.crawl_window(), self.services.clock.now())
    }

    /// Error status already recorded for this crawl
    fn crawl_error(&self) -> bool {
        let code = self.status.code();
        code.is_terminal() && !code.is_success()
    }

    /// Sets an error status unless an earlier error already set one
    fn set_error_once(&mut self, code: CrawlStatusCode, message: Option<String>) -> StatusResult<()> {
        if self.crawl_error() {
            return Ok(());
        }
        self.status.set_crawl_status(code, message)
    }

    fn seed_queue(&mut self) -> StatusResult<StepOutcome> {
        for raw in self.kind.urls_to_follow(self.au.as_ref()) {
            let url = match normalize_url(&raw) {
                Ok(url) => url.to_string(),
                Err(e) => {
                    error!("Malformed start URL {}: {}", raw, e);
                    self.status
                        .signal_error(&raw, format!("Malformed start URL: {}", e), Severity::Error)?;
                    self.set_error_once(CrawlStatusCode::PluginError, None)?;
                    continue;
                }
            };

            let (id, created) = self.graph.get_or_insert(&url, 1);
            if !created {
                continue;
            }
            self.graph.node_mut(id).start_url = true;
            self.status.add_source(&url)?;

            if !self.au.should_be_cached(&url) {
                error!("{}: {}", START_URL_NOT_IN_RULES, url);
                self.status
                    .signal_error(&url, START_URL_NOT_IN_RULES, Severity::Error)?;
                self.set_error_once(CrawlStatusCode::PluginError, None)?;
                continue;
            }
            if !self.enqueue(id, true)? {
                return Ok(StepOutcome::FatalError);
            }
        }

        if self.crawl_error() {
            return Ok(StepOutcome::FatalError);
        }
        debug!("Seeded {} with {} URLs", self.au.id(), self.queue.len());
        Ok(StepOutcome::Continue)
    }

    /// Adds a node to the queue. Returns false if the queue's ordering
    /// failed, which ends the crawl.
    fn enqueue(&mut self, id: NodeId, track_pending: bool) -> StatusResult<bool> {
        match self.queue.add(&self.graph, id) {
            Ok(()) => {
                if track_pending {
                    self.status.add_pending(self.graph.node(id).url())?;
                }
                Ok(true)
            }
            Err(QueueError::Duplicate(url)) => {
                trace!("Already queued: {}", url);
                Ok(true)
            }
            Err(e) => {
                let url = self.graph.node(id).url().to_string();
                error!("Can't add {} to queue: {}", url, e);
                self.status.signal_error(
                    &url,
                    format!("URL comparator error, can't add to queue: {}", e),
                    Severity::Fatal,
                )?;
                self.status.set_crawl_status(
                    CrawlStatusCode::PluginError,
                    Some(COMPARATOR_ERROR.to_string()),
                )?;
                Ok(false)
            }
        }
    }

    async fn fetch_node(&mut self, id: NodeId) -> StatusResult<StepOutcome> {
        let (url, depth) = {
            let node = self.graph.node(id);
            (node.url().to_string(), node.depth())
        };

        let cached = match self.services.repository.has_content(self.au.id(), &url) {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Repository lookup failed for {}: {}", url, e);
                false
            }
        };
        if cached && depth > self.refetch_depth {
            trace!("Cached beyond refetch depth, not fetching: {}", url);
            return Ok(StepOutcome::Continue);
        }
        if self.failed_urls.contains(&url) {
            debug!("Already failed this crawl, skipping: {}", url);
            return Ok(StepOutcome::SkipUrl);
        }
        if !self
            .permissions
            .check_host_permission(&url, true, &mut self.status)
            .await?
        {
            warn!("No permission to fetch {}", url);
            self.failed_urls.insert(url);
            return Ok(StepOutcome::SkipUrl);
        }

        if self.should_explode(&url) {
            return self.fetch_and_explode(id, &url, cached).await;
        }
        let step = self.fetch_with_retries(&url, cached).await?;
        self.handle_fetch_step(id, &url, step)
    }

    fn should_explode(&self, url: &str) -> bool {
        self.config.crawler.explode_archives
            && self
                .au
                .explode_pattern()
                .map_or(false, |pattern| pattern.is_match(url))
    }

    /// Fetches `url` through the rate gate, retrying retryable errors
    async fn fetch_with_retries(&mut self, url: &str, cached: bool) -> StatusResult<FetchStep> {
        let crawler = &self.config.crawler;
        let default_count = crawler.default_retry_count;
        let max_count = crawler.max_retry_count;
        let default_delay = Duration::from_millis(crawler.default_retry_delay);
        let min_delay = Duration::from_millis(crawler.min_retry_delay);

        let if_modified_since = if cached {
            self.services
                .repository
                .get(self.au.id(), url)
                .ok()
                .flatten()
                .and_then(|stored| stored.last_modified().map(str::to_string))
        } else {
            None
        };
        let au = self.au.clone();
        let in_spec = move |target: &str| au.should_be_cached(target);

        let mut retries_left: Option<u32> = None;
        loop {
            if self.abort.is_aborted() {
                return Ok(FetchStep::Aborted);
            }
            if let Err(e) = self
                .rate_limiter
                .pause_before_fetch_at(
                    url,
                    self.previous_content_type.as_deref(),
                    self.services.clock.now(),
                )
                .await
            {
                warn!("{}", e);
                return Ok(FetchStep::WindowClosed);
            }
            if self.abort.is_aborted() {
                debug!("Crawl aborted while waiting to fetch {}", url);
                return Ok(FetchStep::Aborted);
            }

            let request = FetchRequest {
                url,
                if_modified_since: if_modified_since.as_deref(),
                in_spec: &in_spec,
            };
            let result = self.services.fetcher.fetch(&request).await;

            if !self.rate_limiter_was_used(url) {
                return Ok(FetchStep::Failed {
                    message: RATE_LIMITER_NOT_USED.to_string(),
                    fatal: true,
                });
            }

            match result {
                Ok(FetchOutcome::Fetched(content)) => return Ok(FetchStep::Fetched(content)),
                Ok(FetchOutcome::NotModified) => return Ok(FetchStep::NotModified),
                Err(FetchError::Retryable {
                    message,
                    retry_count,
                    retry_delay,
                    ..
                }) => {
                    let left = retries_left
                        .get_or_insert_with(|| retry_count.unwrap_or(default_count).min(max_count));
                    if *left == 0 {
                        return Ok(FetchStep::Failed {
                            message,
                            fatal: false,
                        });
                    }
                    *left -= 1;
                    let delay = retry_delay.unwrap_or(default_delay).max(min_delay);
                    info!(
                        "Retrying {} in {:?}, {} retries left: {}",
                        url, delay, left, message
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(FetchError::Fail { message, .. }) => {
                    return Ok(FetchStep::Failed {
                        message,
                        fatal: false,
                    })
                }
                Err(FetchError::Fatal { message, .. }) => {
                    return Ok(FetchStep::Failed {
                        message,
                        fatal: true,
                    })
                }
                Err(FetchError::RedirectOutsideSpec { target, .. }) => {
                    return Ok(FetchStep::Excluded(target))
                }
            }
        }
    }

    /// Every fetch must have waited on the rate limiter
    fn rate_limiter_was_used(&mut self, url: &str) -> bool {
        let count = self.rate_limiter.pause_counter();
        let used = count != self.last_pause_count;
        self.last_pause_count = count;
        if !used {
            error!("Fetched {} without pausing on the rate limiter", url);
        }
        used || !self.config.crawler.throw_if_rate_limiter_not_used
    }

    fn handle_fetch_step(&mut self, id: NodeId, url: &str, step: FetchStep) -> StatusResult<StepOutcome> {
        match step {
            FetchStep::Fetched(content) => self.store_fetched(id, url, content),
            FetchStep::NotModified => {
                debug!("Not modified: {}", url);
                self.status.signal_url_not_modified(url)?;
                Ok(StepOutcome::Continue)
            }
            FetchStep::Excluded(target) => {
                info!("Redirect from {} to {} leaves the crawl spec", url, target);
                let off_host = self.is_off_host(&target);
                self.status.signal_url_excluded(url, off_host)?;
                Ok(StepOutcome::SkipUrl)
            }
            FetchStep::Failed { message, fatal } => self.fetch_failed(id, url, message, fatal),
            FetchStep::WindowClosed => {
                self.status.set_crawl_status(CrawlStatusCode::WindowClosed, None)?;
                Ok(StepOutcome::AbortCrawl)
            }
            FetchStep::Aborted => Ok(StepOutcome::AbortCrawl),
        }
    }

    fn fetch_failed(
        &mut self,
        id: NodeId,
        url: &str,
        message: String,
        fatal: bool,
    ) -> StatusResult<StepOutcome> {
        self.failed_urls.insert(url.to_string());
        let node = self.graph.node_mut(id);
        node.failed_fetch = true;
        let start_url = node.start_url;

        let severity = if fatal { Severity::Fatal } else { Severity::Error };
        self.status.signal_error(url, message.as_str(), severity)?;

        if fatal {
            error!("Fatal error fetching {}: {}", url, message);
            self.status
                .set_crawl_status(CrawlStatusCode::FetchError, Some(message))?;
            return Ok(StepOutcome::FatalError);
        }
        if start_url && self.config.crawler.fail_on_start_url_error {
            error!("Failed to fetch start URL {}: {}", url, message);
            self.status.set_crawl_status(
                CrawlStatusCode::FetchError,
                Some(FAILED_START_URL.to_string()),
            )?;
            return Ok(StepOutcome::FatalError);
        }
        warn!("Failed to fetch {}: {}", url, message);
        self.set_error_once(CrawlStatusCode::FetchError, Some(message))?;
        Ok(StepOutcome::Continue)
    }

    /// Stores a fetched page, plus every in-spec redirect hop when the
    /// redirect policy asks for it
    fn store_fetched(
        &mut self,
        id: NodeId,
        url: &str,
        content: FetchedContent,
    ) -> StatusResult<StepOutcome> {
        let content_type = content.content_type().map(str::to_string);
        let hops: Vec<String> = match self.config.http.redirect_policy {
            RedirectPolicy::StoreAllInSpec => content
                .redirects
                .iter()
                .filter(|hop| hop.as_str() != url && self.au.should_be_cached(hop))
                .cloned()
                .collect(),
            RedirectPolicy::FollowOnHost => Vec::new(),
        };
        let bytes = content.body.len() as u64;
        let stored = StoredContent::new(url, content.headers, content.body);

        if let Err(e) = self.services.repository.store(self.au.id(), &stored) {
            error!("Unable to store {}: {}", url, e);
            self.status
                .signal_error(url, format!("Can't store page: {}", e), Severity::Error)?;
            self.set_error_once(CrawlStatusCode::RepositoryError, None)?;
            return Ok(StepOutcome::SkipUrl);
        }
        for hop in hops {
            let copy = StoredContent::new(&hop, stored.headers.clone(), stored.body.clone());
            if let Err(e) = self.services.repository.store(self.au.id(), &copy) {
                error!("Unable to store redirect target {}: {}", hop, e);
                self.status
                    .signal_error(&hop, format!("Can't store page: {}", e), Severity::Error)?;
                self.set_error_once(CrawlStatusCode::RepositoryError, None)?;
            }
        }

        self.graph.node_mut(id).fetched = true;
        self.status.signal_url_fetched(url)?;
        self.status.add_content_bytes(bytes)?;
        if let Some(content_type) = &content_type {
            self.status.signal_mime_type(content_type, url)?;
        }
        self.previous_content_type = content_type;
        Ok(StepOutcome::Continue)
    }

    async fn fetch_and_explode(
        &mut self,
        id: NodeId,
        url: &str,
        cached: bool,
    ) -> StatusResult<StepOutcome> {
        let max_attempts = self.config.crawler.max_explode_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let content = match self.fetch_with_retries(url, cached).await? {
                FetchStep::Fetched(content) => content,
                other => return self.handle_fetch_step(id, url, other),
            };

            if self.config.crawler.store_archives {
                let archive = StoredContent::new(url, content.headers.clone(), content.body.clone());
                if let Err(e) = self.services.repository.store(self.au.id(), &archive) {
                    error!("Unable to store archive {}: {}", url, e);
                    self.status
                        .signal_error(url, format!("Can't store archive: {}", e), Severity::Error)?;
                    self.set_error_once(CrawlStatusCode::RepositoryError, None)?;
                }
            }

            let exploded = Exploder::new(&self.services.registry, self.services.repository.as_ref())
                .explode(&self.au, url, &content.body);
            match exploded {
                Ok(report) => return self.record_explosion(id, url, &content, &report),
                Err(ExplodeError::Storage(e)) => {
                    error!("Unable to store entries of {}: {}", url, e);
                    self.status.signal_error(
                        url,
                        format!("Can't store archive entries: {}", e),
                        Severity::Error,
                    )?;
                    self.set_error_once(CrawlStatusCode::RepositoryError, None)?;
                    return Ok(StepOutcome::SkipUrl);
                }
                Err(e) if attempt < max_attempts => {
                    warn!(
                        "Explosion of {} failed (attempt {} of {}): {}",
                        url, attempt, max_attempts, e
                    );
                }
                Err(e) => {
                    error!("Unable to explode {}: {}", url, e);
                    self.failed_urls.insert(url.to_string());
                    self.graph.node_mut(id).failed_fetch = true;
                    self.status.signal_error(url, e.to_string(), Severity::Fatal)?;
                    self.status.set_crawl_status(
                        CrawlStatusCode::FetchError,
                        Some(format!("Unable to explode archive {}", url)),
                    )?;
                    return Ok(StepOutcome::FatalError);
                }
            }
        }
    }

    fn record_explosion(
        &mut self,
        id: NodeId,
        url: &str,
        content: &FetchedContent,
        report: &ExplodeReport,
    ) -> StatusResult<StepOutcome> {
        self.graph.node_mut(id).fetched = true;
        self.status.signal_url_fetched(url)?;
        self.status.add_content_bytes(content.body.len() as u64)?;
        if let Some(content_type) = content.content_type() {
            self.status.signal_mime_type(content_type, url)?;
        }
        self.previous_content_type = content.content_type().map(str::to_string);

        self.status.add_exploded_entries(report.stored.len())?;
        for au_id in &report.created_aus {
            info!("Created archival unit {} for entries of {}", au_id, url);
            self.status.signal_synthetic_au(au_id)?;
        }
        for name in &report.bad_entries {
            self.status.signal_bad_entry(name)?;
        }
        if !report.is_clean() {
            let message = format!(
                "{} bad entries in archive {}",
                report.bad_entries.len(),
                url
            );
            self.status.signal_error(url, message.as_str(), Severity::Error)?;
            self.set_error_once(CrawlStatusCode::Error, Some(message))?;
        }
        Ok(StepOutcome::SkipUrl)
    }

    /// Extracts the links of a stored page and files each one
    fn parse_node(&mut self, id: NodeId) -> StatusResult<StepOutcome> {
        if !self.kind.follows_links() {
            return Ok(StepOutcome::Continue);
        }
        let url = self.graph.node(id).url().to_string();
        if self.processed.contains_key(&url) {
            return Ok(StepOutcome::Continue);
        }

        let stored = match self.services.repository.get(self.au.id(), &url) {
            Ok(Some(stored)) => stored,
            Ok(None) => return Ok(StepOutcome::Continue),
            Err(e) => {
                warn!("Unable to read {} back for parsing: {}", url, e);
                return Ok(StepOutcome::Continue);
            }
        };
        if stored.header(EXPLODED_FROM_HEADER).is_some() {
            return Ok(StepOutcome::Continue);
        }
        let content_type = stored
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| mime_type_for(&url).to_string());
        let Some(extractor) = self.services.extractors.for_content_type(&content_type) else {
            trace!("No link extractor for {} ({})", url, content_type);
            return Ok(StepOutcome::Continue);
        };
        let Ok(base) = Url::parse(&url) else {
            return Ok(StepOutcome::Continue);
        };

        let text = String::from_utf8_lossy(&stored.body);
        let links = match extractor.extract_links(&text, &base) {
            Ok(links) => links,
            Err(e) => {
                warn!("Link extraction failed for {}: {}", url, e);
                self.graph.node_mut(id).failed_parse = true;
                self.status.signal_error(
                    &url,
                    format!("Plugin LinkExtractor error: {}", e),
                    Severity::Error,
                )?;
                self.set_error_once(CrawlStatusCode::ExtractorError, None)?;
                return Ok(StepOutcome::Continue);
            }
        };

        self.graph.clear_children(id);
        let mut seen = HashSet::new();
        for raw in links {
            let link = match resolve_link(&base, &raw) {
                Ok(link) => link.to_string(),
                Err(e) => {
                    trace!("Ignoring link {} on {}: {}", raw, url, e);
                    continue;
                }
            };
            if link == url || !seen.insert(link.clone()) {
                continue;
            }
            if !self.found_link(id, link)? {
                return Ok(StepOutcome::FatalError);
            }
        }
        self.graph.trim_children(id);
        self.status.signal_url_parsed(&url)?;
        Ok(StepOutcome::Continue)
    }

    /// Files one link found on `parent`. Returns false if queueing failed.
    fn found_link(&mut self, parent: NodeId, link: String) -> StatusResult<bool> {
        let known = self
            .processed
            .get(&link)
            .or_else(|| self.too_deep.get(&link))
            .copied()
            .or_else(|| self.queue.get(&link));
        if let Some(child) = known {
            return self.link_child(parent, child);
        }
        if self.excluded.contains(&link) || self.failed_urls.contains(&link) {
            return Ok(true);
        }

        if !self.au.should_be_cached(&link) {
            trace!("Excluded by crawl rules: {}", link);
            let off_host = self.is_off_host(&link);
            self.status.signal_url_excluded(&link, off_host)?;
            self.excluded.insert(link);
            return Ok(true);
        }
        if self.au.is_excluded_globally(&link) {
            warn!("Globally excluded, probable recursion: {}", link);
            self.excluded.insert(link);
            return Ok(true);
        }

        let depth = self.graph.node(parent).depth().saturating_add(1);
        let (child, _) = self.graph.get_or_insert(&link, depth);
        if self.graph.node(child).depth() > self.max_depth {
            debug!("Beyond max crawl depth {}: {}", self.max_depth, link);
            self.too_deep.insert(link, child);
        } else if !self.enqueue(child, true)? {
            return Ok(false);
        }
        self.link_child(parent, child)
    }

    fn link_child(&mut self, parent: NodeId, child: NodeId) -> StatusResult<bool> {
        let mut reduced = Vec::new();
        let mut observer = |id: NodeId, _: &CrawlUrl, old: u32, new: u32| reduced.push((id, old, new));
        self.graph.add_child(parent, child, &mut observer);
        self.apply_depth_reductions(reduced)
    }

    /// Moves nodes whose depth dropped to where they now belong
    ///
    /// Affected queued nodes are taken out before anything is re-added, so
    /// the queue is never searched while its order is stale. Nodes pulled
    /// under the max depth leave the too-deep set; nodes pulled under the
    /// refetch depth that were processed without a fetch are fetched after
    /// all.
    fn apply_depth_reductions(&mut self, reduced: Vec<(NodeId, u32, u32)>) -> StatusResult<bool> {
        let mut readmit = Vec::new();
        for (id, old, new) in reduced {
            let url = self.graph.node(id).url().to_string();
            if self.queue.remove(&url).is_some() {
                readmit.push((id, false));
                continue;
            }
            if new > self.max_depth {
                continue;
            }
            if old > self.max_depth {
                if self.too_deep.remove(&url).is_some() {
                    debug!("Depth of {} reduced from {} to {}, queueing", url, old, new);
                    readmit.push((id, true));
                }
                continue;
            }
            if old > self.refetch_depth && new <= self.refetch_depth {
                let unfetched = self
                    .processed
                    .get(&url)
                    .map_or(false, |&node| !self.graph.node(node).fetched);
                if unfetched {
                    debug!("{} now within refetch depth, queueing", url);
                    self.processed.remove(&url);
                    readmit.push((id, true));
                }
            }
        }

        for (id, track_pending) in readmit {
            if !self.enqueue(id, track_pending)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// True if `url` is on none of the AU's base URL hosts
    fn is_off_host(&self, url: &str) -> bool {
        let Some(host) = host_key_str(url) else {
            return true;
        };
        !self
            .au
            .base_urls()
            .iter()
            .any(|base| host_key_str(base).as_deref() == Some(host.as_str()))
    }

    fn crawl_end_actions(&mut self) -> StatusResult<()> {
        let repository = self.services.repository.clone();
        match repository.au_size(self.au.id()) {
            Ok(size) => self.status.set_au_size(size)?,
            Err(e) => warn!("Unable to compute size of {}: {}", self.au.id(), e),
        }

        if self.config.report.enabled {
            let recipient = self.config.report.recipient.as_deref();
            match build_report(repository.as_ref(), &self.status, recipient) {
                Ok(report) => {
                    if let Err(e) = self.services.report_sender.send_report(&report) {
                        warn!("Unable to send crawl report for {}: {}", self.au.id(), e);
                    }
                }
                Err(e) => warn!("Unable to build crawl report for {}: {}", self.au.id(), e),
            }
        }
        Ok(())
    }
}
