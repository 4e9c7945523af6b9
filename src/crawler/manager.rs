//! Crawl admission and concurrency
//!
//! The [`CrawlManager`] decides whether a crawl may start and runs the
//! admitted ones. Admission checks, in order:
//! 1. the AU's crawl start rate (separate rates for new content and repair)
//! 2. for new content, the AU's crawl window
//! 3. the activity lock on the AU, or on the repaired URLs
//! 4. room on the worker pool or in its bounded waiting queue
//!
//! The start-rate slot is taken when the rate check passes and given back
//! if a later check refuses the crawl.
//!
//! A rejected crawl fails fast: its callback fires with `false` and nothing
//! stays locked. An admitted crawl completes exactly once, through its
//! [`CrawlHandle`] and its callback, whether it succeeds, fails, is
//! aborted or its task panics.

use crate::au::{window_open_at, ArchivalUnit};
use crate::config::{Config, StatusConfig};
use crate::crawler::{
    AbortFlag, ActivityLock, ActivityLocks, CrawlKind, CrawlServices, FollowLinkCrawler,
};
use crate::rate::{CrawlRateLimiter, Rate, RateError, RateLimiter};
use crate::status::{CrawlStatusCode, CrawlType, CrawlerStatus};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

const CRAWL_TASK_FAILED: &str = "Crawl ended without a status";

/// Reasons a crawl is not admitted
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Crawl start rate exceeded for {0}")]
    RateLimited(String),

    #[error("Crawl window closed for {0}")]
    WindowClosed(String),

    #[error("Activity lock unavailable for {0}")]
    Locked(String),

    #[error("Crawl pool and queue are full, cannot start {0}")]
    PoolFull(String),

    #[error("Invalid rate for {au_id}: {source}")]
    Rate {
        au_id: String,
        #[source]
        source: RateError,
    },
}

/// Invoked once when a crawl finishes or is rejected
pub type CrawlCallback = Box<dyn FnOnce(bool, &CrawlerStatus) + Send>;

/// Final word on one requested crawl
#[derive(Debug, Clone)]
pub struct CrawlOutcome {
    pub success: bool,
    pub status: CrawlerStatus,
}

/// Awaitable completion of an admitted crawl
#[derive(Debug)]
pub struct CrawlHandle {
    au_id: String,
    crawl_type: CrawlType,
    abort: AbortFlag,
    receiver: oneshot::Receiver<CrawlOutcome>,
}

impl CrawlHandle {
    pub fn au_id(&self) -> &str {
        &self.au_id
    }

    /// Requests cooperative cancellation of this crawl
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Waits for the crawl to finish
    pub async fn wait(self) -> CrawlOutcome {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => CrawlOutcome {
                success: false,
                status: unstarted_status(
                    &self.au_id,
                    &self.au_id,
                    self.crawl_type,
                    &StatusConfig::default(),
                    CrawlStatusCode::Error,
                    CRAWL_TASK_FAILED,
                ),
            },
        }
    }
}

/// A crawl that has been admitted and not yet finished
#[derive(Debug, Clone)]
pub struct RunningCrawl {
    pub au_id: String,
    pub crawl_type: CrawlType,
    abort: AbortFlag,
}

/// Delivers the outcome of one crawl exactly once
struct Completion {
    callback: Option<CrawlCallback>,
    sender: Option<oneshot::Sender<CrawlOutcome>>,
    /// Report failure whatever the crawl's own outcome
    force_failure: bool,
}

impl Completion {
    fn complete(mut self, status: CrawlerStatus) {
        let success = !self.force_failure && status.code().is_success();
        if let Some(callback) = self.callback.take() {
            let result = catch_unwind(AssertUnwindSafe(|| callback(success, &status)));
            if result.is_err() {
                error!("Completion callback for {} panicked", status.au_id());
            }
        }
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(CrawlOutcome { success, status });
        }
    }
}

/// A sealed status for a crawl that never ran
fn unstarted_status(
    au_id: &str,
    au_name: &str,
    crawl_type: CrawlType,
    config: &StatusConfig,
    code: CrawlStatusCode,
    message: &str,
) -> CrawlerStatus {
    let mut status = CrawlerStatus::new(au_id, au_name, crawl_type, config);
    let _ = status.set_crawl_status(code, Some(message.to_string()));
    let _ = status.seal();
    status
}

#[derive(Default)]
struct ManagerState {
    start_limiters: HashMap<(String, CrawlType), Arc<RateLimiter>>,
    fetch_limiters: HashMap<String, Arc<CrawlRateLimiter>>,
    running: BTreeMap<u64, RunningCrawl>,
    /// Workers in use
    active: usize,
    /// Admitted crawls waiting for a worker; bookkeeping AUs first
    pending: VecDeque<CrawlJob>,
    history: VecDeque<CrawlerStatus>,
    next_id: u64,
}

struct Shared {
    config: Arc<Config>,
    services: CrawlServices,
    locks: Arc<ActivityLocks>,
    /// Staggers crawl starts across all AUs
    start_stagger: RateLimiter,
    state: Mutex<ManagerState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status_config(&self) -> &StatusConfig {
        &self.config.status
    }

    fn record_history(&self, status: CrawlerStatus) {
        let size = self.config.manager.history_size;
        if size == 0 {
            return;
        }
        let mut state = self.lock();
        state.history.push_back(status);
        while state.history.len() > size {
            state.history.pop_front();
        }
    }
}

/// An admitted crawl, ready for a worker
struct CrawlJob {
    crawler: FollowLinkCrawler,
    guard: CrawlGuard,
    bookkeeping: bool,
}

/// Releases everything an admitted crawl holds, on every exit path
struct CrawlGuard {
    shared: Arc<Shared>,
    crawl_id: u64,
    au_id: String,
    au_name: String,
    crawl_type: CrawlType,
    limiter_key: String,
    start_limiter: Arc<RateLimiter>,
    lock: Option<ActivityLock>,
    completion: Option<Completion>,
    holds_worker: bool,
    done: bool,
}

impl CrawlGuard {
    fn finish(mut self, status: CrawlerStatus) {
        if status.code() == CrawlStatusCode::WindowClosed {
            // the AU may try again as soon as its window reopens
            self.start_limiter.unevent();
        }
        self.shared.record_history(status.clone());
        self.complete(status);
    }

    /// Completes a crawl that was admitted but could not be queued
    fn reject(mut self, code: CrawlStatusCode, message: &str) {
        self.start_limiter.unevent();
        let status = unstarted_status(
            &self.au_id,
            &self.au_name,
            self.crawl_type,
            self.shared.status_config(),
            code,
            message,
        );
        self.complete(status);
    }

    fn complete(&mut self, status: CrawlerStatus) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(lock) = self.lock.take() {
            drop(lock);
        }

        let next = {
            let mut state = self.shared.lock();
            state.running.remove(&self.crawl_id);
            if let Some(limiter) = state.fetch_limiters.get(&self.limiter_key).cloned() {
                limiter.remove_crawler(self.crawl_type);
                if limiter.is_unused() {
                    debug!("Dropping unused rate limiter {}", self.limiter_key);
                    state.fetch_limiters.remove(&self.limiter_key);
                }
            }
            if self.holds_worker {
                self.holds_worker = false;
                match state.pending.pop_front() {
                    Some(mut job) => {
                        job.guard.holds_worker = true;
                        Some(job)
                    }
                    None => {
                        state.active = state.active.saturating_sub(1);
                        None
                    }
                }
            } else {
                None
            }
        };

        if let Some(completion) = self.completion.take() {
            completion.complete(status);
        }
        if let Some(job) = next {
            launch(self.shared.clone(), job);
        }
    }
}

impl Drop for CrawlGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        error!("Crawl of {} ended without a status", self.au_id);
        let status = unstarted_status(
            &self.au_id,
            &self.au_name,
            self.crawl_type,
            self.shared.status_config(),
            CrawlStatusCode::Error,
            CRAWL_TASK_FAILED,
        );
        self.shared.record_history(status.clone());
        self.complete(status);
    }
}

fn launch(shared: Arc<Shared>, job: CrawlJob) {
    tokio::spawn(async move {
        let CrawlJob { crawler, guard, .. } = job;
        shared.start_stagger.fifo_wait_and_signal_event().await;
        let status = crawler.crawl().await;
        guard.finish(status);
    });
}

/// Admits and runs crawls of many AUs
#[derive(Clone)]
pub struct CrawlManager {
    shared: Arc<Shared>,
}

impl CrawlManager {
    /// Creates a manager
    ///
    /// Fails if one of the configured manager rates does not parse.
    pub fn new(config: Arc<Config>, services: CrawlServices) -> Result<Self, RateError> {
        config.manager.new_content_rate.parse::<Rate>()?;
        config.manager.repair_rate.parse::<Rate>()?;
        let start_stagger = RateLimiter::from_rate_str(&config.manager.start_rate)?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                services,
                locks: ActivityLocks::new(),
                start_stagger,
                state: Mutex::new(ManagerState::default()),
            }),
        })
    }

    pub fn activity_locks(&self) -> &Arc<ActivityLocks> {
        &self.shared.locks
    }

    /// Requests a new content crawl of `au`
    pub fn start_new_content_crawl(
        &self,
        au: Arc<dyn ArchivalUnit>,
        callback: Option<CrawlCallback>,
    ) -> Result<CrawlHandle, AdmissionError> {
        let (sender, receiver) = oneshot::channel();
        let completion = Completion {
            callback,
            sender: Some(sender),
            force_failure: false,
        };
        let au_id = au.id().to_string();

        let start_limiter = match self.start_limiter(&au_id, CrawlType::NewContent) {
            Ok(limiter) => limiter,
            Err(e) => return Err(self.refuse(&au, CrawlType::NewContent, completion, e)),
        };
        if start_limiter.try_event().is_err() {
            let e = AdmissionError::RateLimited(au_id);
            return Err(self.refuse(&au, CrawlType::NewContent, completion, e));
        }
        if !window_open_at(au.crawl_window(), self.shared.services.clock.now()) {
            start_limiter.unevent();
            let e = AdmissionError::WindowClosed(au_id);
            return Err(self.refuse(&au, CrawlType::NewContent, completion, e));
        }
        let Some(lock) = self.shared.locks.try_lock_au(&au_id) else {
            start_limiter.unevent();
            let e = AdmissionError::Locked(au_id);
            return Err(self.refuse(&au, CrawlType::NewContent, completion, e));
        };

        self.admit(au, CrawlKind::NewContent, lock, start_limiter, completion, receiver)
    }

    /// Requests a repair crawl of `urls` in `au`
    ///
    /// URLs another activity holds are left out. When only some URLs could
    /// be locked the others are repaired, but the crawl reports failure.
    pub fn start_repair(
        &self,
        au: Arc<dyn ArchivalUnit>,
        urls: Vec<String>,
        callback: Option<CrawlCallback>,
    ) -> Result<CrawlHandle, AdmissionError> {
        let (sender, receiver) = oneshot::channel();
        let mut completion = Completion {
            callback,
            sender: Some(sender),
            force_failure: false,
        };
        let au_id = au.id().to_string();

        let start_limiter = match self.start_limiter(&au_id, CrawlType::Repair) {
            Ok(limiter) => limiter,
            Err(e) => return Err(self.refuse(&au, CrawlType::Repair, completion, e)),
        };
        if start_limiter.try_event().is_err() {
            let e = AdmissionError::RateLimited(au_id);
            return Err(self.refuse(&au, CrawlType::Repair, completion, e));
        }

        let url_locks = self.shared.locks.try_lock_urls(&au_id, &urls);
        if url_locks.locked.is_empty() {
            start_limiter.unevent();
            let e = AdmissionError::Locked(au_id);
            return Err(self.refuse(&au, CrawlType::Repair, completion, e));
        }
        if url_locks.is_partial() {
            warn!(
                "Repair of {}: {} of {} URLs locked by another activity",
                au_id,
                url_locks.failed.len(),
                urls.len()
            );
            completion.force_failure = true;
        }

        let kind = CrawlKind::Repair {
            urls: url_locks.locked,
        };
        self.admit(au, kind, url_locks.lock, start_limiter, completion, receiver)
    }

    /// Fails a request before anything was acquired
    fn refuse(
        &self,
        au: &Arc<dyn ArchivalUnit>,
        crawl_type: CrawlType,
        completion: Completion,
        error: AdmissionError,
    ) -> AdmissionError {
        info!("Not starting {} crawl: {}", crawl_type, error);
        let code = match error {
            AdmissionError::WindowClosed(_) => CrawlStatusCode::WindowClosed,
            _ => CrawlStatusCode::Error,
        };
        let status = unstarted_status(
            au.id(),
            au.name(),
            crawl_type,
            self.shared.status_config(),
            code,
            &error.to_string(),
        );
        completion.complete(status);
        error
    }

    fn admit(
        &self,
        au: Arc<dyn ArchivalUnit>,
        kind: CrawlKind,
        lock: ActivityLock,
        start_limiter: Arc<RateLimiter>,
        completion: Completion,
        receiver: oneshot::Receiver<CrawlOutcome>,
    ) -> Result<CrawlHandle, AdmissionError> {
        let crawl_type = kind.crawl_type();
        let au_id = au.id().to_string();
        let limiter_key = au.rate_limiter_key();

        let fetch_limiter = match self.fetch_limiter(&au, crawl_type) {
            Ok(limiter) => limiter,
            Err(source) => {
                drop(lock);
                start_limiter.unevent();
                let e = AdmissionError::Rate {
                    au_id: au_id.clone(),
                    source,
                };
                return Err(self.refuse(&au, crawl_type, completion, e));
            }
        };
        let abort = AbortFlag::new();
        let crawl_id = {
            let mut state = self.shared.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.running.insert(
                id,
                RunningCrawl {
                    au_id: au_id.clone(),
                    crawl_type,
                    abort: abort.clone(),
                },
            );
            id
        };

        let crawler = FollowLinkCrawler::new(
            au.clone(),
            kind,
            self.shared.config.clone(),
            self.shared.services.clone(),
            fetch_limiter,
        )
        .with_abort_flag(abort.clone());
        let job = CrawlJob {
            crawler,
            bookkeeping: au.is_bookkeeping(),
            guard: CrawlGuard {
                shared: self.shared.clone(),
                crawl_id,
                au_id: au_id.clone(),
                au_name: au.name().to_string(),
                crawl_type,
                limiter_key,
                start_limiter,
                lock: Some(lock),
                completion: Some(completion),
                holds_worker: false,
                done: false,
            },
        };

        if let Err(job) = self.submit(job) {
            let e = AdmissionError::PoolFull(au_id);
            warn!("{}", e);
            job.guard.reject(CrawlStatusCode::Error, &e.to_string());
            return Err(e);
        }
        info!("Admitted {} crawl of {}", crawl_type, au_id);
        Ok(CrawlHandle {
            au_id,
            crawl_type,
            abort,
            receiver,
        })
    }

    /// Starts the job on a free worker or queues it; hands the job back
    /// when the pool and its queue are both full
    fn submit(&self, mut job: CrawlJob) -> Result<(), CrawlJob> {
        let manager = &self.shared.config.manager;
        if !manager.use_pool {
            launch(self.shared.clone(), job);
            return Ok(());
        }

        let mut state = self.shared.lock();
        if state.active < manager.pool_size {
            state.active += 1;
            drop(state);
            job.guard.holds_worker = true;
            launch(self.shared.clone(), job);
            return Ok(());
        }
        if state.pending.len() >= manager.queue_size {
            return Err(job);
        }
        let position = if job.bookkeeping {
            state
                .pending
                .iter()
                .position(|queued| !queued.bookkeeping)
                .unwrap_or(state.pending.len())
        } else {
            state.pending.len()
        };
        debug!("Queueing crawl of {} at position {}", job.guard.au_id, position);
        state.pending.insert(position, job);
        Ok(())
    }

    fn start_limiter(
        &self,
        au_id: &str,
        crawl_type: CrawlType,
    ) -> Result<Arc<RateLimiter>, AdmissionError> {
        let rate = match crawl_type {
            CrawlType::NewContent => &self.shared.config.manager.new_content_rate,
            CrawlType::Repair => &self.shared.config.manager.repair_rate,
        };
        let mut state = self.shared.lock();
        let key = (au_id.to_string(), crawl_type);
        if let Some(limiter) = state.start_limiters.get(&key) {
            return Ok(limiter.clone());
        }
        let limiter = Arc::new(RateLimiter::from_rate_str(rate).map_err(|source| {
            AdmissionError::Rate {
                au_id: au_id.to_string(),
                source,
            }
        })?);
        state.start_limiters.insert(key, limiter.clone());
        Ok(limiter)
    }

    /// The fetch limiter shared by every AU with the same limiter key
    fn fetch_limiter(
        &self,
        au: &Arc<dyn ArchivalUnit>,
        crawl_type: CrawlType,
    ) -> Result<Arc<CrawlRateLimiter>, RateError> {
        let key = au.rate_limiter_key();
        let mut state = self.shared.lock();
        let limiter = match state.fetch_limiters.get(&key) {
            Some(limiter) => limiter.clone(),
            None => {
                let limiter = Arc::new(CrawlRateLimiter::new(au.rate_limiter_info())?);
                state.fetch_limiters.insert(key, limiter.clone());
                limiter
            }
        };
        limiter.add_crawler(crawl_type);
        Ok(limiter)
    }

    /// Aborts every admitted crawl of an AU. Returns false if none was
    /// running or waiting.
    pub fn abort_crawl(&self, au_id: &str) -> bool {
        let state = self.shared.lock();
        let mut found = false;
        for crawl in state.running.values().filter(|c| c.au_id == au_id) {
            info!("Aborting {} crawl of {}", crawl.crawl_type, au_id);
            crawl.abort.abort();
            found = true;
        }
        found
    }

    pub fn running_crawls(&self) -> Vec<RunningCrawl> {
        self.shared.lock().running.values().cloned().collect()
    }

    /// Admitted crawls waiting for a worker
    pub fn waiting_crawls(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Statuses of the most recently finished crawls, oldest first
    pub fn history(&self) -> Vec<CrawlerStatus> {
        self.shared.lock().history.iter().cloned().collect()
    }

    /// Number of fetch rate limiters currently shared by running crawls
    pub fn fetch_limiter_count(&self) -> usize {
        self.shared.lock().fetch_limiters.len()
    }
}
