//! Crawling
//!
//! This module contains the crawl itself and everything around it:
//! - HTTP fetching with retry classification
//! - Link extraction by content type
//! - [`FollowLinkCrawler`], one crawl of one archival unit
//! - [`CrawlManager`], admission and concurrency of many crawls
//! - Activity locks and end-of-crawl reports

mod engine;
mod fetcher;
mod locks;
mod manager;
mod parser;
mod report;

pub use engine::{
    AbortFlag, CrawlKind, CrawlServices, FollowLinkCrawler, StepOutcome, ABORTED_BEFORE_START,
};
pub use fetcher::{
    build_http_client, FetchError, FetchOutcome, FetchRequest, FetchResultKind, FetchedContent,
    HttpFetcher, HttpResultMap, RedirectPolicy, UrlFetcher,
};
pub use locks::{ActivityLock, ActivityLocks, LockScope, UrlLocks};
pub use manager::{
    AdmissionError, CrawlCallback, CrawlHandle, CrawlManager, CrawlOutcome, RunningCrawl,
};
pub use parser::{
    CssLinkExtractor, ExtractError, HtmlLinkExtractor, LinkExtractor, LinkExtractorRegistry,
};
pub use report::{
    build_report, hash_au_content, CrawlReport, LogReportSender, ReportError, ReportSender,
};
