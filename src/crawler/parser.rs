//! Link extraction from fetched content
//!
//! Extractors return the raw link strings found in a document; the crawler
//! resolves, normalizes and filters them. The extractor is chosen by the
//! content's MIME type through a [`LinkExtractorRegistry`].

use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Unable to parse {url}: {message}")]
    Parse { url: String, message: String },
}

/// Pulls outbound links out of one document
pub trait LinkExtractor: Send + Sync {
    fn extract_links(&self, content: &str, base_url: &Url) -> Result<Vec<String>, ExtractError>;
}

/// Elements and the attribute holding their link
const HTML_LINK_ATTRIBUTES: &[(&str, &str)] = &[
    ("a[href]", "href"),
    ("area[href]", "href"),
    ("link[href]", "href"),
    ("img[src]", "src"),
    ("script[src]", "src"),
    ("frame[src]", "src"),
    ("iframe[src]", "src"),
    ("embed[src]", "src"),
];

/// Link extractor for HTML documents
///
/// # Link Extraction Rules
///
/// - `a`/`area`/`link` hrefs and `img`/`script`/`frame`/`iframe`/`embed`
///   sources, stylesheets and images included, since archived pages must
///   render
/// - `url()` and `@import` references inside `<style>` blocks
/// - fragment-only links are skipped
/// - relative links are resolved against `<base href>` when the page has one
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlLinkExtractor;

impl LinkExtractor for HtmlLinkExtractor {
    fn extract_links(&self, content: &str, base_url: &Url) -> Result<Vec<String>, ExtractError> {
        let document = Html::parse_document(content);
        let parse_error = |e: scraper::error::SelectorErrorKind<'_>| ExtractError::Parse {
            url: base_url.to_string(),
            message: e.to_string(),
        };

        let base_selector = Selector::parse("base[href]").map_err(parse_error)?;
        let base = document
            .select(&base_selector)
            .next()
            .and_then(|element| element.value().attr("href"))
            .and_then(|href| base_url.join(href.trim()).ok());

        let mut links = Vec::new();
        for (selector, attribute) in HTML_LINK_ATTRIBUTES {
            let selector = Selector::parse(selector).map_err(parse_error)?;
            for element in document.select(&selector) {
                let Some(value) = element.value().attr(attribute) else {
                    continue;
                };
                let value = value.trim();
                if value.is_empty() || value.starts_with('#') {
                    continue;
                }
                links.push(match &base {
                    Some(base) => base
                        .join(value)
                        .map(|u| u.to_string())
                        .unwrap_or_else(|_| value.to_string()),
                    None => value.to_string(),
                });
            }
        }

        let style_selector = Selector::parse("style").map_err(parse_error)?;
        for style in document.select(&style_selector) {
            let css: String = style.text().collect();
            links.extend(css_links(&css));
        }

        Ok(links)
    }
}

/// Link extractor for CSS stylesheets: `url(...)` and `@import "..."`
#[derive(Debug, Default, Clone, Copy)]
pub struct CssLinkExtractor;

impl LinkExtractor for CssLinkExtractor {
    fn extract_links(&self, content: &str, _base_url: &Url) -> Result<Vec<String>, ExtractError> {
        Ok(css_links(content))
    }
}

fn css_link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?i)url\(\s*['"]?([^'")\s]+)['"]?\s*\)|@import\s+['"]([^'"]+)['"]"#)
            .unwrap_or_else(|e| unreachable!("css link pattern: {}", e))
    })
}

fn css_links(css: &str) -> Vec<String> {
    css_link_pattern()
        .captures_iter(css)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().to_string())
        .filter(|link| !link.starts_with("data:"))
        .collect()
}

/// MIME type to extractor lookup
#[derive(Clone)]
pub struct LinkExtractorRegistry {
    extractors: HashMap<String, Arc<dyn LinkExtractor>>,
}

impl Default for LinkExtractorRegistry {
    fn default() -> Self {
        let html: Arc<dyn LinkExtractor> = Arc::new(HtmlLinkExtractor);
        let css: Arc<dyn LinkExtractor> = Arc::new(CssLinkExtractor);
        let mut registry = Self {
            extractors: HashMap::new(),
        };
        registry.register("text/html", html.clone());
        registry.register("application/xhtml+xml", html);
        registry.register("text/css", css);
        registry
    }
}

impl LinkExtractorRegistry {
    pub fn register(&mut self, mime_type: &str, extractor: Arc<dyn LinkExtractor>) {
        self.extractors
            .insert(mime_type.to_ascii_lowercase(), extractor);
    }

    /// Extractor for a `Content-Type` value, ignoring parameters
    pub fn for_content_type(&self, content_type: &str) -> Option<Arc<dyn LinkExtractor>> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        self.extractors.get(&mime).cloned()
    }
}
