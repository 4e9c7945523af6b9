//! Politeness: rate limiting of fetches and crawl starts
//!
//! - [`RateLimiter`]: N events per rolling interval, with a fair
//!   wait-then-record operation
//! - [`CrawlRateLimiter`]: picks the limiter for each fetch by URL pattern,
//!   MIME type and crawl window

mod crawl_limiter;
mod limiter;

pub use crawl_limiter::{
    CrawlRateLimiter, PatternRate, RateLimiterInfo, WindowRate, DEFAULT_FETCH_RATE,
};
pub use limiter::{parse_duration, Rate, RateLimiter};

use thiserror::Error;

/// Errors from rate parsing and limiter selection
#[derive(Debug, Error)]
pub enum RateError {
    #[error("Invalid rate: {0}")]
    InvalidRate(String),

    #[error("Invalid rate pattern: {0}")]
    InvalidPattern(String),

    #[error("No rate limiter window open for {0}")]
    NoWindowOpen(String),
}

pub type RateResult<T> = std::result::Result<T, RateError>;
