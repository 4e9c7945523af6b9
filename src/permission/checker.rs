use regex::Regex;
use scraper::{Html, Selector};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Statement a publisher places on its permission page
pub const LOCKSS_PERMISSION_STATEMENT: &str =
    "LOCKSS system has permission to collect, preserve, and serve this Archival Unit";

/// Statement granting permission to the CLOCKSS network
pub const CLOCKSS_PERMISSION_STATEMENT: &str =
    "CLOCKSS system has permission to ingest, preserve, and serve this Archival Unit";

/// Decides whether a fetched permission page grants permission
pub trait PermissionChecker: Send + Sync + fmt::Debug {
    fn check_permission(&self, content: &str, page_url: &str) -> bool;
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)<[^>]*>").unwrap_or_else(|e| unreachable!("tag pattern: {}", e))
    })
}

/// Lowercases and collapses every whitespace run to one space
fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Looks for a fixed statement in the page text
///
/// Markup is stripped, `&nbsp;` is treated as a space, and the comparison
/// ignores case and whitespace layout, so a statement broken across lines
/// or wrapped in tags still matches.
#[derive(Debug, Clone)]
pub struct StringPermissionChecker {
    statement: String,
}

impl StringPermissionChecker {
    pub fn new(statement: &str) -> Self {
        Self {
            statement: normalize_text(statement),
        }
    }

    pub fn lockss() -> Self {
        Self::new(LOCKSS_PERMISSION_STATEMENT)
    }

    pub fn clockss() -> Self {
        Self::new(CLOCKSS_PERMISSION_STATEMENT)
    }
}

impl PermissionChecker for StringPermissionChecker {
    fn check_permission(&self, content: &str, _page_url: &str) -> bool {
        if self.statement.is_empty() {
            return false;
        }
        let text = tag_pattern().replace_all(content, " ");
        let text = text.replace("&nbsp;", " ").replace("&#160;", " ");
        normalize_text(&text).contains(&self.statement)
    }
}

fn license_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^https?://(www\.)?creativecommons\.org/licenses/(by|by-sa|by-nc|by-nd|by-nc-sa|by-nc-nd)/")
            .unwrap_or_else(|e| unreachable!("license pattern: {}", e))
    })
}

/// Accepts pages carrying a `rel="license"` link to a Creative Commons license
#[derive(Debug, Clone, Copy, Default)]
pub struct CreativeCommonsPermissionChecker;

impl PermissionChecker for CreativeCommonsPermissionChecker {
    fn check_permission(&self, content: &str, page_url: &str) -> bool {
        let Ok(selector) = Selector::parse(r#"a[rel~="license"], link[rel~="license"]"#) else {
            return false;
        };
        let document = Html::parse_document(content);
        let found = document
            .select(&selector)
            .filter_map(|element| element.value().attr("href"))
            .any(|href| license_pattern().is_match(href.trim()));
        if found {
            tracing::debug!("Creative Commons license found on {}", page_url);
        }
        found
    }
}

/// Checkers any one of which grants permission on a host
pub fn default_daemon_checkers() -> Vec<Arc<dyn PermissionChecker>> {
    vec![
        Arc::new(StringPermissionChecker::lockss()),
        Arc::new(StringPermissionChecker::clockss()),
        Arc::new(CreativeCommonsPermissionChecker),
    ]
}
