//! Selects the rate limiter that gates each fetch of a crawl
//!
//! Selection is by URL pattern, then by the previous fetch's MIME type, then
//! a default. Windowed clauses switch between whole selection tables by time
//! of day.

use crate::au::CrawlWindow;
use crate::rate::limiter::{Rate, RateLimiter};
use crate::rate::{RateError, RateResult};
use crate::status::CrawlType;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Default fetch rate for an AU with no explicit rate
pub const DEFAULT_FETCH_RATE: &str = "1/6s";

/// Declarative description of an AU's fetch rate limits
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RateLimiterInfo {
    /// Rate used when nothing more specific matches
    #[serde(default = "default_fetch_rate")]
    pub rate: String,

    /// Ordered URL pattern rates; the first matching pattern wins
    #[serde(default, rename = "url-rates")]
    pub url_rates: Vec<PatternRate>,

    /// Rates keyed by MIME type; `type/*` and `*/*` are wildcards
    #[serde(default, rename = "mime-rates")]
    pub mime_rates: BTreeMap<String, String>,

    /// Time-window clauses; when present they replace the tables above
    #[serde(default, rename = "window-rates")]
    pub window_rates: Vec<WindowRate>,
}

fn default_fetch_rate() -> String {
    DEFAULT_FETCH_RATE.to_string()
}

impl Default for RateLimiterInfo {
    fn default() -> Self {
        Self {
            rate: default_fetch_rate(),
            url_rates: Vec::new(),
            mime_rates: BTreeMap::new(),
            window_rates: Vec::new(),
        }
    }
}

impl RateLimiterInfo {
    /// A single rate applied to every fetch
    pub fn with_rate(rate: &str) -> Self {
        Self {
            rate: rate.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PatternRate {
    pub pattern: String,
    pub rate: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WindowRate {
    pub window: CrawlWindow,
    pub limits: RateLimiterInfo,
}

#[derive(Debug)]
enum Selector {
    FileType {
        url_limiters: Vec<(Regex, Arc<RateLimiter>)>,
        mime_limiters: HashMap<String, Arc<RateLimiter>>,
        default: Arc<RateLimiter>,
    },
    Conditional {
        clauses: Vec<(CrawlWindow, Selector)>,
    },
}

impl Selector {
    fn build(info: &RateLimiterInfo) -> RateResult<Self> {
        if !info.window_rates.is_empty() {
            let clauses = info
                .window_rates
                .iter()
                .map(|clause| Ok((clause.window.clone(), Selector::build(&clause.limits)?)))
                .collect::<RateResult<Vec<_>>>()?;
            return Ok(Selector::Conditional { clauses });
        }

        let url_limiters = info
            .url_rates
            .iter()
            .map(|pr| {
                let regex = Regex::new(&pr.pattern)
                    .map_err(|e| RateError::InvalidPattern(format!("{}: {}", pr.pattern, e)))?;
                Ok((regex, Arc::new(RateLimiter::new(pr.rate.parse::<Rate>()?))))
            })
            .collect::<RateResult<Vec<_>>>()?;

        let mime_limiters = info
            .mime_rates
            .iter()
            .map(|(mime, rate)| {
                Ok((
                    mime.to_ascii_lowercase(),
                    Arc::new(RateLimiter::new(rate.parse::<Rate>()?)),
                ))
            })
            .collect::<RateResult<HashMap<_, _>>>()?;

        Ok(Selector::FileType {
            url_limiters,
            mime_limiters,
            default: Arc::new(RateLimiter::new(info.rate.parse::<Rate>()?)),
        })
    }

    /// Returns the chosen limiter and, for windowed selection, the index of
    /// the open clause
    fn select(
        &self,
        url: &str,
        previous_content_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> RateResult<(Option<usize>, Arc<RateLimiter>)> {
        match self {
            Selector::FileType {
                url_limiters,
                mime_limiters,
                default,
            } => {
                if let Some((_, limiter)) = url_limiters.iter().find(|(re, _)| re.is_match(url)) {
                    return Ok((None, limiter.clone()));
                }
                if let Some(mime) = previous_content_type.map(base_mime_type) {
                    if let Some(limiter) = lookup_mime(mime_limiters, &mime) {
                        return Ok((None, limiter));
                    }
                }
                Ok((None, default.clone()))
            }
            Selector::Conditional { clauses } => {
                for (index, (window, selector)) in clauses.iter().enumerate() {
                    if window.is_open_at(now) {
                        let (_, limiter) = selector.select(url, previous_content_type, now)?;
                        return Ok((Some(index), limiter));
                    }
                }
                Err(RateError::NoWindowOpen(url.to_string()))
            }
        }
    }
}

fn base_mime_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

fn lookup_mime(
    limiters: &HashMap<String, Arc<RateLimiter>>,
    mime: &str,
) -> Option<Arc<RateLimiter>> {
    if let Some(limiter) = limiters.get(mime) {
        return Some(limiter.clone());
    }
    if let Some((major, _)) = mime.split_once('/') {
        if let Some(limiter) = limiters.get(&format!("{}/*", major)) {
            return Some(limiter.clone());
        }
    }
    limiters.get("*/*").cloned()
}

/// Rate limiting for all fetches of one or more crawls sharing a limit
#[derive(Debug)]
pub struct CrawlRateLimiter {
    selector: Selector,
    pause_counter: AtomicU64,
    new_content_crawlers: AtomicUsize,
    repair_crawlers: AtomicUsize,
    active_clause: Mutex<Option<usize>>,
}

impl CrawlRateLimiter {
    pub fn new(info: &RateLimiterInfo) -> RateResult<Self> {
        Ok(Self {
            selector: Selector::build(info)?,
            pause_counter: AtomicU64::new(0),
            new_content_crawlers: AtomicUsize::new(0),
            repair_crawlers: AtomicUsize::new(0),
            active_clause: Mutex::new(None),
        })
    }

    /// Returns the limiter that applies to a fetch of `url`
    pub fn get_rate_limiter_for(
        &self,
        url: &str,
        previous_content_type: Option<&str>,
    ) -> RateResult<Arc<RateLimiter>> {
        self.selector
            .select(url, previous_content_type, Utc::now())
            .map(|(_, limiter)| limiter)
    }

    /// Blocks until the selected limiter allows a fetch of `url`
    ///
    /// When the open window clause differs from the one used by the previous
    /// call, the new limiter has no history for this crawl, so the caller
    /// waits on it twice.
    pub async fn pause_before_fetch(
        &self,
        url: &str,
        previous_content_type: Option<&str>,
    ) -> RateResult<()> {
        self.pause_before_fetch_at(url, previous_content_type, Utc::now())
            .await
    }

    /// [`Self::pause_before_fetch`] with windows evaluated at `now`
    pub async fn pause_before_fetch_at(
        &self,
        url: &str,
        previous_content_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> RateResult<()> {
        let (clause, limiter) = self.selector.select(url, previous_content_type, now)?;

        let window_changed = {
            let mut active = self.active_clause.lock().unwrap_or_else(|e| e.into_inner());
            let changed = matches!((*active, clause), (Some(prev), Some(cur)) if prev != cur);
            if clause.is_some() {
                *active = clause;
            }
            changed
        };

        if window_changed {
            tracing::debug!("Rate window changed before {}, pausing twice", url);
            limiter.fifo_wait_and_signal_event().await;
        }
        limiter.fifo_wait_and_signal_event().await;
        self.pause_counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Monotonic count of completed pauses
    pub fn pause_counter(&self) -> u64 {
        self.pause_counter.load(Ordering::SeqCst)
    }

    pub fn add_crawler(&self, crawl_type: CrawlType) {
        self.counter(crawl_type).fetch_add(1, Ordering::SeqCst);
    }

    pub fn remove_crawler(&self, crawl_type: CrawlType) {
        let counter = self.counter(crawl_type);
        let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn new_content_crawlers(&self) -> usize {
        self.new_content_crawlers.load(Ordering::SeqCst)
    }

    pub fn repair_crawlers(&self) -> usize {
        self.repair_crawlers.load(Ordering::SeqCst)
    }

    /// True when no crawler of either type references this limiter
    pub fn is_unused(&self) -> bool {
        self.new_content_crawlers() == 0 && self.repair_crawlers() == 0
    }

    fn counter(&self, crawl_type: CrawlType) -> &AtomicUsize {
        match crawl_type {
            CrawlType::NewContent => &self.new_content_crawlers,
            CrawlType::Repair => &self.repair_crawlers,
        }
    }
}
