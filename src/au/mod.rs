//! Archival units: the content boundary one crawl is scoped to
//!
//! The crawler consumes AUs through the [`ArchivalUnit`] trait. Two
//! implementations ship with the crate:
//! - [`ConfiguredAu`], built from an `[[archival-unit]]` config table
//! - synthetic AUs created on the fly when exploded archive entries land
//!   under a base URL no existing AU owns (see [`AuRegistry`])

mod registry;
mod rules;
mod window;

pub use registry::AuRegistry;
pub use rules::{CrawlRule, CrawlRules, RuleAction, RuleMatch};
pub use window::{window_open, window_open_at, Clock, CrawlWindow};

use crate::config::ArchivalUnitConfig;
use crate::exploder::{DefaultExploderHelper, ExploderHelper, StemExploderHelper};
use crate::permission::{PermissionChecker, StringPermissionChecker};
use crate::rate::RateLimiterInfo;
use crate::ConfigError;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Matching rules, window and seed/permission pages for one AU
#[derive(Debug, Clone)]
pub struct CrawlSpec {
    pub start_urls: Vec<String>,
    pub permission_urls: Vec<String>,
    pub rules: CrawlRules,
    pub window: Option<CrawlWindow>,
}

impl CrawlSpec {
    pub fn is_included(&self, url: &str) -> bool {
        self.rules.is_included(url)
    }
}

/// What the crawler needs to know about an archival unit
pub trait ArchivalUnit: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn name(&self) -> &str {
        self.id()
    }

    fn crawl_spec(&self) -> &CrawlSpec;

    /// URL stems owned by this AU
    fn base_urls(&self) -> &[String];

    fn start_urls(&self) -> &[String] {
        &self.crawl_spec().start_urls
    }

    fn permission_urls(&self) -> &[String] {
        &self.crawl_spec().permission_urls
    }

    /// Crawl-rule predicate: should this URL be collected for this AU
    fn should_be_cached(&self, url: &str) -> bool {
        self.crawl_spec().is_included(url)
    }

    /// Cross-AU guard against URLs that look like crawler traps
    fn is_excluded_globally(&self, _url: &str) -> bool {
        false
    }

    /// Nodes at or above this depth are refetched even when cached; `None`
    /// defers to the crawler default
    fn refetch_depth(&self) -> Option<u32> {
        None
    }

    fn crawl_window(&self) -> Option<&CrawlWindow> {
        self.crawl_spec().window.as_ref()
    }

    fn rate_limiter_info(&self) -> &RateLimiterInfo;

    /// AUs returning the same key share one fetch rate limiter
    fn rate_limiter_key(&self) -> String {
        format!("au:{}", self.id())
    }

    /// URLs matching this pattern are exploded as archives
    fn explode_pattern(&self) -> Option<&Regex> {
        None
    }

    fn exploder_helper(&self) -> Arc<dyn ExploderHelper> {
        Arc::new(DefaultExploderHelper)
    }

    /// Plugin permission checker; must pass in addition to a daemon checker
    fn permission_checker(&self) -> Option<Arc<dyn PermissionChecker>> {
        None
    }

    /// Host patterns whose content needs no permission page of their own
    fn permitted_hosts(&self) -> &[String] {
        &[]
    }

    /// Synthetic AUs are only ever filled by explosion
    fn is_never_crawl(&self) -> bool {
        false
    }

    /// Bookkeeping AUs are admitted ahead of ordinary crawls
    fn is_bookkeeping(&self) -> bool {
        false
    }

    /// Listing page that explosion appends links to
    fn manifest_url(&self) -> Option<String> {
        None
    }
}

/// Default cap for a repeated path segment before a URL is treated as a trap
pub const DEFAULT_MAX_REPEATED_PATH_SEGMENTS: usize = 3;

const MANIFEST_PAGE: &str = "manifest.html";

/// An archival unit described by configuration
#[derive(Debug, Clone)]
pub struct ConfiguredAu {
    id: String,
    name: String,
    base_urls: Vec<String>,
    spec: CrawlSpec,
    refetch_depth: Option<u32>,
    rate_limits: RateLimiterInfo,
    rate_limiter_key: Option<String>,
    explode_pattern: Option<Regex>,
    explode_stems: Vec<(String, String)>,
    permission_statement: Option<String>,
    max_repeated_path_segments: usize,
    permitted_hosts: Vec<String>,
    never_crawl: bool,
    bookkeeping: bool,
}

impl ConfiguredAu {
    /// Builds an AU from its config table
    pub fn from_config(config: &ArchivalUnitConfig) -> Result<Self, ConfigError> {
        let rules = if config.crawl_rules.is_empty() {
            CrawlRules::prefixes(&config.base_urls)
        } else {
            config
                .crawl_rules
                .iter()
                .map(|r| CrawlRule::new(&r.pattern, r.action))
                .collect::<Result<Vec<_>, _>>()
                .map(CrawlRules::new)
        }
        .map_err(|e| ConfigError::InvalidPattern(format!("AU '{}': {}", config.id, e)))?;

        let explode_pattern = config
            .explode_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| ConfigError::InvalidPattern(format!("AU '{}': {}", config.id, e)))?;

        Ok(Self {
            id: config.id.clone(),
            name: config.name.clone().unwrap_or_else(|| config.id.clone()),
            base_urls: config.base_urls.clone(),
            spec: CrawlSpec {
                start_urls: config.start_urls.clone(),
                permission_urls: config.permission_urls.clone(),
                rules,
                window: config.crawl_window.clone(),
            },
            refetch_depth: config.refetch_depth,
            rate_limits: config.rate_limits.clone(),
            rate_limiter_key: config.rate_limiter_key.clone(),
            explode_pattern,
            explode_stems: config
                .explode_stems
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            permission_statement: config.permission_statement.clone(),
            max_repeated_path_segments: config.max_repeated_path_segments,
            permitted_hosts: config.permitted_hosts.clone(),
            never_crawl: false,
            bookkeeping: config.bookkeeping,
        })
    }

    /// A never-crawled AU owning everything under `base_url`, created to
    /// hold exploded archive entries
    pub fn synthetic(base_url: &str, rate_limits: RateLimiterInfo) -> Result<Self, regex::Error> {
        let manifest = format!("{}{}", base_url, MANIFEST_PAGE);
        Ok(Self {
            id: format!("exploded:{}", base_url),
            name: format!("Exploded content under {}", base_url),
            base_urls: vec![base_url.to_string()],
            spec: CrawlSpec {
                start_urls: vec![manifest.clone()],
                permission_urls: vec![manifest],
                rules: CrawlRules::prefixes(&[base_url])?,
                window: None,
            },
            refetch_depth: None,
            rate_limits,
            rate_limiter_key: None,
            explode_pattern: None,
            explode_stems: Vec::new(),
            permission_statement: None,
            max_repeated_path_segments: DEFAULT_MAX_REPEATED_PATH_SEGMENTS,
            permitted_hosts: Vec::new(),
            never_crawl: true,
            bookkeeping: false,
        })
    }
}

impl ArchivalUnit for ConfiguredAu {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn crawl_spec(&self) -> &CrawlSpec {
        &self.spec
    }

    fn base_urls(&self) -> &[String] {
        &self.base_urls
    }

    fn is_excluded_globally(&self, url: &str) -> bool {
        has_repeated_segments(url, self.max_repeated_path_segments)
    }

    fn refetch_depth(&self) -> Option<u32> {
        self.refetch_depth
    }

    fn rate_limiter_info(&self) -> &RateLimiterInfo {
        &self.rate_limits
    }

    fn rate_limiter_key(&self) -> String {
        self.rate_limiter_key
            .clone()
            .unwrap_or_else(|| format!("au:{}", self.id))
    }

    fn explode_pattern(&self) -> Option<&Regex> {
        self.explode_pattern.as_ref()
    }

    fn exploder_helper(&self) -> Arc<dyn ExploderHelper> {
        if self.explode_stems.is_empty() {
            Arc::new(DefaultExploderHelper)
        } else {
            Arc::new(StemExploderHelper::new(self.explode_stems.clone()))
        }
    }

    fn permission_checker(&self) -> Option<Arc<dyn PermissionChecker>> {
        self.permission_statement
            .as_deref()
            .map(|s| Arc::new(StringPermissionChecker::new(s)) as Arc<dyn PermissionChecker>)
    }

    fn permitted_hosts(&self) -> &[String] {
        &self.permitted_hosts
    }

    fn is_never_crawl(&self) -> bool {
        self.never_crawl
    }

    fn is_bookkeeping(&self) -> bool {
        self.bookkeeping
    }

    fn manifest_url(&self) -> Option<String> {
        if self.never_crawl {
            self.spec.start_urls.first().cloned()
        } else {
            None
        }
    }
}

/// True if any path segment occurs more than `max` times
fn has_repeated_segments(url: &str, max: usize) -> bool {
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    let Some(segments) = parsed.path_segments() else {
        return false;
    };
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for segment in segments.filter(|s| !s.is_empty()) {
        let count = counts.entry(segment).or_insert(0);
        *count += 1;
        if *count > max {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlRuleConfig;

    fn create_test_au_config() -> ArchivalUnitConfig {
        ArchivalUnitConfig {
            id: "pub".to_string(),
            name: Some("Publisher".to_string()),
            base_urls: vec!["http://pub.example/".to_string()],
            start_urls: vec!["http://pub.example/index.html".to_string()],
            permission_urls: vec!["http://pub.example/lockss.txt".to_string()],
            ..ArchivalUnitConfig::default()
        }
    }

    #[test]
    fn test_default_rules_follow_base_urls() {
        let au = ConfiguredAu::from_config(&create_test_au_config()).unwrap();
        assert!(au.should_be_cached("http://pub.example/a.html"));
        assert!(!au.should_be_cached("http://other.example/x.html"));
        assert_eq!(au.name(), "Publisher");
        assert_eq!(au.rate_limiter_key(), "au:pub");
    }

    #[test]
    fn test_explicit_rules() {
        let mut config = create_test_au_config();
        config.crawl_rules = vec![
            CrawlRuleConfig {
                action: RuleAction::Exclude,
                pattern: r"\.css$".to_string(),
            },
            CrawlRuleConfig {
                action: RuleAction::Include,
                pattern: r"^http://pub\.example/".to_string(),
            },
        ];
        let au = ConfiguredAu::from_config(&config).unwrap();
        assert!(au.should_be_cached("http://pub.example/a.html"));
        assert!(!au.should_be_cached("http://pub.example/a.css"));
    }

    #[test]
    fn test_bad_rule_pattern_is_config_error() {
        let mut config = create_test_au_config();
        config.explode_pattern = Some("(".to_string());
        assert!(matches!(
            ConfiguredAu::from_config(&config),
            Err(ConfigError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_repeated_segments_are_globally_excluded() {
        let au = ConfiguredAu::from_config(&create_test_au_config()).unwrap();
        assert!(!au.is_excluded_globally("http://pub.example/a/b/a/b/a/b"));
        assert!(au.is_excluded_globally("http://pub.example/a/a/a/a/x.html"));
    }

    #[test]
    fn test_synthetic_au() {
        let au = ConfiguredAu::synthetic("http://content.example/j/", RateLimiterInfo::default())
            .unwrap();
        assert!(au.is_never_crawl());
        assert_eq!(
            au.manifest_url().as_deref(),
            Some("http://content.example/j/manifest.html")
        );
        assert!(au.should_be_cached("http://content.example/j/1.pdf"));
        assert!(!au.should_be_cached("http://content.example/k/1.pdf"));
    }
}
