use crate::config::StatusConfig;
use crate::status::{
    CrawlStatusCode, CrawlType, KeepMode, Severity, StatusCategory, StatusError, StatusResult,
    UrlCount,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// One URL's recorded error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlErrorInfo {
    pub message: String,
    pub severity: Severity,
}

/// Accounting for one crawl of one AU
///
/// Every counter only grows (pending aside) until [`CrawlerStatus::seal`];
/// after sealing any mutation returns [`StatusError::Sealed`].
#[derive(Debug, Clone)]
pub struct CrawlerStatus {
    au_id: String,
    au_name: String,
    crawl_type: CrawlType,
    code: CrawlStatusCode,
    message: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,

    fetched: UrlCount,
    excluded: UrlCount,
    not_modified: UrlCount,
    parsed: UrlCount,
    pending: UrlCount,
    errors: BTreeMap<String, UrlErrorInfo>,
    sources: Vec<String>,
    mime_types: BTreeMap<String, UrlCount>,
    mime_mode: KeepMode,

    content_bytes: u64,
    bad_entries: Vec<String>,
    exploded_entries: usize,
    synthetic_aus: Vec<String>,
    au_size: Option<u64>,

    off_host_excludes_kept: usize,
    keep_off_host_excludes: usize,
    keep_after_seal: Vec<StatusCategory>,
    sealed: bool,
}

impl CrawlerStatus {
    pub fn new(au_id: &str, au_name: &str, crawl_type: CrawlType, config: &StatusConfig) -> Self {
        Self {
            au_id: au_id.to_string(),
            au_name: au_name.to_string(),
            crawl_type,
            code: CrawlStatusCode::Pending,
            message: None,
            start_time: None,
            end_time: None,
            fetched: UrlCount::new(config.fetched),
            excluded: UrlCount::new(config.excluded),
            not_modified: UrlCount::new(config.not_modified),
            parsed: UrlCount::new(config.parsed),
            pending: UrlCount::new(config.pending),
            errors: BTreeMap::new(),
            sources: Vec::new(),
            mime_types: BTreeMap::new(),
            mime_mode: config.fetched,
            content_bytes: 0,
            bad_entries: Vec::new(),
            exploded_entries: 0,
            synthetic_aus: Vec::new(),
            au_size: None,
            off_host_excludes_kept: 0,
            keep_off_host_excludes: config.keep_off_host_excludes,
            keep_after_seal: config.keep_after_seal.clone(),
            sealed: false,
        }
    }

    fn check_open(&self, operation: &'static str) -> StatusResult<()> {
        if self.sealed {
            return Err(StatusError::Sealed(operation));
        }
        Ok(())
    }

    pub fn signal_crawl_started(&mut self) -> StatusResult<()> {
        self.check_open("start crawl")?;
        self.start_time = Some(Utc::now());
        self.code = CrawlStatusCode::Active;
        Ok(())
    }

    pub fn signal_crawl_ended(&mut self) -> StatusResult<()> {
        self.check_open("end crawl")?;
        self.end_time = Some(Utc::now());
        Ok(())
    }

    /// Sets the outcome; `None` uses the code's default message
    pub fn set_crawl_status(
        &mut self,
        code: CrawlStatusCode,
        message: Option<String>,
    ) -> StatusResult<()> {
        self.check_open("set crawl status")?;
        self.code = code;
        self.message = message;
        Ok(())
    }

    pub fn signal_url_fetched(&mut self, url: &str) -> StatusResult<()> {
        self.check_open("record fetched url")?;
        self.fetched.add(url)
    }

    /// Records an excluded URL; off-host URLs beyond the cap are only counted
    pub fn signal_url_excluded(&mut self, url: &str, off_host: bool) -> StatusResult<()> {
        self.check_open("record excluded url")?;
        if off_host {
            if self.off_host_excludes_kept >= self.keep_off_host_excludes {
                return self.excluded.add_count_only();
            }
            self.off_host_excludes_kept += 1;
        }
        self.excluded.add(url)
    }

    pub fn signal_url_not_modified(&mut self, url: &str) -> StatusResult<()> {
        self.check_open("record not-modified url")?;
        self.not_modified.add(url)
    }

    pub fn signal_url_parsed(&mut self, url: &str) -> StatusResult<()> {
        self.check_open("record parsed url")?;
        self.parsed.add(url)
    }

    pub fn add_pending(&mut self, url: &str) -> StatusResult<()> {
        self.check_open("add pending url")?;
        self.pending.add(url)
    }

    pub fn remove_pending(&mut self, url: &str) -> StatusResult<()> {
        self.check_open("remove pending url")?;
        self.pending.remove(url).map(|_| ())
    }

    /// Records a per-URL error; a later error for the same URL replaces it
    pub fn signal_error(
        &mut self,
        url: &str,
        message: impl Into<String>,
        severity: Severity,
    ) -> StatusResult<()> {
        self.check_open("record url error")?;
        self.errors.insert(
            url.to_string(),
            UrlErrorInfo {
                message: message.into(),
                severity,
            },
        );
        Ok(())
    }

    pub fn signal_mime_type(&mut self, content_type: &str, url: &str) -> StatusResult<()> {
        self.check_open("record mime type")?;
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        let mode = self.mime_mode;
        self.mime_types
            .entry(mime)
            .or_insert_with(|| UrlCount::new(mode))
            .add(url)
    }

    pub fn add_source(&mut self, url: &str) -> StatusResult<()> {
        self.check_open("add source")?;
        self.sources.push(url.to_string());
        Ok(())
    }

    pub fn add_content_bytes(&mut self, bytes: u64) -> StatusResult<()> {
        self.check_open("add content bytes")?;
        self.content_bytes += bytes;
        Ok(())
    }

    pub fn signal_bad_entry(&mut self, name: &str) -> StatusResult<()> {
        self.check_open("record bad archive entry")?;
        self.bad_entries.push(name.to_string());
        Ok(())
    }

    pub fn add_exploded_entries(&mut self, count: usize) -> StatusResult<()> {
        self.check_open("record exploded entries")?;
        self.exploded_entries += count;
        Ok(())
    }

    pub fn signal_synthetic_au(&mut self, au_id: &str) -> StatusResult<()> {
        self.check_open("record synthetic au")?;
        if !self.synthetic_aus.iter().any(|id| id == au_id) {
            self.synthetic_aus.push(au_id.to_string());
        }
        Ok(())
    }

    pub fn set_au_size(&mut self, bytes: u64) -> StatusResult<()> {
        self.check_open("set au size")?;
        self.au_size = Some(bytes);
        Ok(())
    }

    /// Freezes the status. Counters keep their values; URL collections of
    /// categories not listed in `keep-after-seal` are dropped.
    pub fn seal(&mut self) -> StatusResult<()> {
        self.check_open("seal")?;
        let keep = |category| self.keep_after_seal.contains(&category);
        let (fetched, excluded, not_modified, parsed, pending) = (
            keep(StatusCategory::Fetched),
            keep(StatusCategory::Excluded),
            keep(StatusCategory::NotModified),
            keep(StatusCategory::Parsed),
            keep(StatusCategory::Pending),
        );
        self.fetched.seal(fetched);
        self.excluded.seal(excluded);
        self.not_modified.seal(not_modified);
        self.parsed.seal(parsed);
        self.pending.seal(pending);
        for count in self.mime_types.values_mut() {
            count.seal(fetched);
        }
        self.sealed = true;
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn au_id(&self) -> &str {
        &self.au_id
    }

    pub fn au_name(&self) -> &str {
        &self.au_name
    }

    pub fn crawl_type(&self) -> CrawlType {
        self.crawl_type
    }

    pub fn code(&self) -> CrawlStatusCode {
        self.code
    }

    /// Explicit message, or the code's default
    pub fn message(&self) -> &str {
        self.message
            .as_deref()
            .unwrap_or_else(|| self.code.default_message())
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn fetched(&self) -> &UrlCount {
        &self.fetched
    }

    pub fn excluded(&self) -> &UrlCount {
        &self.excluded
    }

    pub fn not_modified(&self) -> &UrlCount {
        &self.not_modified
    }

    pub fn parsed(&self) -> &UrlCount {
        &self.parsed
    }

    pub fn pending(&self) -> &UrlCount {
        &self.pending
    }

    pub fn url_errors(&self) -> &BTreeMap<String, UrlErrorInfo> {
        &self.errors
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn mime_types(&self) -> &BTreeMap<String, UrlCount> {
        &self.mime_types
    }

    pub fn content_bytes(&self) -> u64 {
        self.content_bytes
    }

    pub fn bad_entries(&self) -> &[String] {
        &self.bad_entries
    }

    pub fn exploded_entries(&self) -> usize {
        self.exploded_entries
    }

    pub fn synthetic_aus(&self) -> &[String] {
        &self.synthetic_aus
    }

    pub fn au_size(&self) -> Option<u64> {
        self.au_size
    }

    /// One-line summary for logs and the CLI
    pub fn summary(&self) -> String {
        format!(
            "{} crawl of {}: {} ({} fetched, {} excluded, {} not modified, {} parsed, {} errors)",
            self.crawl_type,
            self.au_name,
            self.message(),
            self.fetched.count(),
            self.excluded.count(),
            self.not_modified.count(),
            self.parsed.count(),
            self.errors.len()
        )
    }
}
