//! End-of-crawl report
//!
//! After a crawl the AU's stored content is hashed and a short report is
//! handed to a [`ReportSender`]. Report failures are logged by the crawler,
//! never escalated.

use crate::status::CrawlerStatus;
use crate::storage::{Repository, StorageError};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Repository error: {0}")]
    Storage(#[from] StorageError),

    #[error("Report delivery failed: {0}")]
    Send(String),
}

/// A composed end-of-crawl report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlReport {
    pub au_id: String,
    pub au_name: String,
    pub recipient: Option<String>,
    /// Human readable crawl summary
    pub summary: String,
    /// SHA-256 over every stored URL, its headers and body, in URL order
    pub content_hash: String,
    pub url_count: usize,
}

/// Delivers end-of-crawl reports
pub trait ReportSender: Send + Sync {
    fn send_report(&self, report: &CrawlReport) -> Result<(), ReportError>;
}

/// Writes reports to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReportSender;

impl ReportSender for LogReportSender {
    fn send_report(&self, report: &CrawlReport) -> Result<(), ReportError> {
        tracing::info!(
            au = %report.au_id,
            recipient = report.recipient.as_deref().unwrap_or("-"),
            hash = %report.content_hash,
            urls = report.url_count,
            "Crawl report: {}",
            report.summary
        );
        Ok(())
    }
}

/// Hashes the whole stored content of an AU
///
/// Returns the hex digest and the number of URLs hashed.
pub fn hash_au_content(repository: &dyn Repository, au_id: &str) -> Result<(String, usize), StorageError> {
    let urls = repository.urls(au_id)?;
    let mut hasher = Sha256::new();
    let mut count = 0;
    for url in &urls {
        let Some(content) = repository.get(au_id, url)? else {
            continue;
        };
        hasher.update(url.as_bytes());
        hasher.update([0u8]);
        for (name, value) in &content.headers {
            hasher.update(format!("{}: {}\n", name, value).as_bytes());
        }
        hasher.update([0u8]);
        hasher.update(&content.body);
        hasher.update([0u8]);
        count += 1;
    }
    Ok((hex::encode(hasher.finalize()), count))
}

/// Composes the report for a finished crawl
pub fn build_report(
    repository: &dyn Repository,
    status: &CrawlerStatus,
    recipient: Option<&str>,
) -> Result<CrawlReport, ReportError> {
    let (content_hash, url_count) = hash_au_content(repository, status.au_id())?;
    Ok(CrawlReport {
        au_id: status.au_id().to_string(),
        au_name: status.au_name().to_string(),
        recipient: recipient.map(str::to_string),
        summary: status.summary(),
        content_hash,
        url_count,
    })
}
