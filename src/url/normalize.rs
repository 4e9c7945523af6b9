use crate::UrlError;
use url::Url;

/// Normalizes a URL for use as a crawl key
///
/// # Normalization Steps
///
/// 1. Parse the URL; reject if malformed
/// 2. Accept only http and https
/// 3. Lowercase the host, drop a default port, remove dot segments
///    (handled by the parser)
/// 4. Remove the fragment
/// 5. An empty query (trailing `?`) is dropped
///
/// Trailing slashes, `www.` and query parameters are kept: archived
/// content must be stored under the URL the publisher serves it at.
///
/// # Examples
///
/// ```
/// use sumi_harvest::url::normalize_url;
///
/// let url = normalize_url("HTTP://Pub.Example:80/a/../b/#top").unwrap();
/// assert_eq!(url.as_str(), "http://pub.example/b/");
/// ```
pub fn normalize_url(url_str: &str) -> Result<Url, UrlError> {
    let mut url = Url::parse(url_str.trim()).map_err(|e| UrlError::Parse(e.to_string()))?;
    check_url(&url)?;

    url.set_fragment(None);
    if url.query() == Some("") {
        url.set_query(None);
    }

    Ok(url)
}

/// Resolves a link found on a page against the page's base URL and
/// normalizes the result
///
/// Returns `UrlError::InvalidScheme` for mailto:, javascript: and other
/// links the crawler does not follow.
pub fn resolve_link(base: &Url, href: &str) -> Result<Url, UrlError> {
    let href = href.trim();
    if href.is_empty() {
        return Err(UrlError::Malformed("empty link".to_string()));
    }
    let joined = base
        .join(href)
        .map_err(|e| UrlError::Parse(format!("{}: {}", href, e)))?;
    normalize_url(joined.as_str())
}

fn check_url(url: &Url) -> Result<(), UrlError> {
    if !is_supported_scheme(url.scheme()) {
        return Err(UrlError::InvalidScheme(format!(
            "Only HTTP and HTTPS schemes are supported, got: {}",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(UrlError::MissingDomain);
    }
    Ok(())
}

/// Only http and https links are followed
pub fn is_supported_scheme(scheme: &str) -> bool {
    scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https")
}
