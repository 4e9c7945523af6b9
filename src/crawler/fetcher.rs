//! HTTP fetcher implementation
//!
//! This module handles all network fetches for the crawler, including:
//! - Building the HTTP client with the crawler's user agent and timeouts
//! - Conditional GETs against previously stored content
//! - Manual redirect handling under a redirect policy
//! - Classifying responses and transport errors as retryable, fail or fatal

use crate::config::{HttpConfig, UserAgentConfig};
use crate::url::{host_key, resolve_link};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, IF_MODIFIED_SINCE, LOCATION, RETRY_AFTER};
use reqwest::{redirect::Policy, Client, StatusCode};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Which redirects a fetch follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RedirectPolicy {
    /// Follow redirects that stay on the original host and in the crawl spec
    FollowOnHost,
    /// Follow any redirect in the crawl spec; every hop is stored
    StoreAllInSpec,
}

/// How a response status is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchResultKind {
    Success,
    Retry,
    Fail,
    Fatal,
}

/// Failed fetch, classified for the crawl's retry policy
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transient; the crawl may retry after a delay
    #[error("Retryable error fetching {url}: {message}")]
    Retryable {
        url: String,
        message: String,
        retry_count: Option<u32>,
        retry_delay: Option<Duration>,
    },

    #[error("Error fetching {url}: {message}")]
    Fail { url: String, message: String },

    /// Ends the whole crawl
    #[error("Fatal error fetching {url}: {message}")]
    Fatal { url: String, message: String },

    #[error("Redirect from {url} to {target} leaves the crawl spec")]
    RedirectOutsideSpec { url: String, target: String },
}

impl FetchError {
    pub fn url(&self) -> &str {
        match self {
            FetchError::Retryable { url, .. }
            | FetchError::Fail { url, .. }
            | FetchError::Fatal { url, .. }
            | FetchError::RedirectOutsideSpec { url, .. } => url,
        }
    }
}

/// Successfully fetched resource
#[derive(Debug, Clone)]
pub struct FetchedContent {
    pub url: String,
    /// Every redirect target in order; the last one served the body
    pub redirects: Vec<String>,
    /// Response headers with lowercase names
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl FetchedContent {
    pub fn final_url(&self) -> &str {
        self.redirects.last().map(String::as_str).unwrap_or(&self.url)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Fetched(FetchedContent),
    /// The stored copy is current
    NotModified,
}

/// One fetch: the URL, an optional validator and the crawl-spec test
/// applied to redirect targets
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub if_modified_since: Option<&'a str>,
    pub in_spec: &'a (dyn Fn(&str) -> bool + Send + Sync),
}

/// Source of content for the crawler
#[async_trait]
pub trait UrlFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchOutcome, FetchError>;
}

/// Status code to result classification, with configurable overrides
#[derive(Debug, Clone, Default)]
pub struct HttpResultMap {
    overrides: HashMap<u16, FetchResultKind>,
}

impl HttpResultMap {
    /// Builds the map from `[http.result-map]`; non-numeric keys are skipped
    pub fn from_config(overrides: &BTreeMap<String, FetchResultKind>) -> Self {
        Self {
            overrides: overrides
                .iter()
                .filter_map(|(code, kind)| code.parse::<u16>().ok().map(|c| (c, *kind)))
                .collect(),
        }
    }

    pub fn classify(&self, status: u16) -> FetchResultKind {
        if let Some(kind) = self.overrides.get(&status) {
            return *kind;
        }
        match status {
            200..=299 => FetchResultKind::Success,
            408 | 429 | 500..=599 => FetchResultKind::Retry,
            _ => FetchResultKind::Fail,
        }
    }
}

/// Builds an HTTP client with proper configuration
///
/// Redirects are never followed by the client itself; [`HttpFetcher`]
/// follows them under its redirect policy.
pub fn build_http_client(
    http: &HttpConfig,
    user_agent: &UserAgentConfig,
) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(user_agent.header_value())
        .connect_timeout(Duration::from_secs(http.connect_timeout))
        .timeout(Duration::from_secs(http.data_timeout))
        .redirect(Policy::none())
        .gzip(true)
        .brotli(true)
        .build()
}

/// Network fetcher backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    policy: RedirectPolicy,
    max_redirects: u32,
    result_map: HttpResultMap,
}

impl HttpFetcher {
    pub fn new(http: &HttpConfig, user_agent: &UserAgentConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(http, user_agent)?,
            policy: http.redirect_policy,
            max_redirects: http.max_redirects,
            result_map: HttpResultMap::from_config(&http.result_map),
        })
    }

    fn transport_error(url: &str, error: reqwest::Error) -> FetchError {
        if error.is_timeout() || error.is_connect() || error.is_body() {
            FetchError::Retryable {
                url: url.to_string(),
                message: error.to_string(),
                retry_count: None,
                retry_delay: None,
            }
        } else {
            FetchError::Fail {
                url: url.to_string(),
                message: error.to_string(),
            }
        }
    }

    /// Next hop of a redirect response, if the policy allows following it
    fn redirect_target(
        &self,
        request: &FetchRequest<'_>,
        origin: &Url,
        current: &Url,
        headers: &HeaderMap,
        followed: &[String],
    ) -> Result<Url, FetchError> {
        let fail = |message: String| FetchError::Fail {
            url: request.url.to_string(),
            message,
        };

        let location = headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| fail(format!("Redirect from {} without Location", current)))?;
        let target = resolve_link(current, location)
            .map_err(|e| fail(format!("Bad redirect location {:?}: {}", location, e)))?;

        if followed.len() as u32 >= self.max_redirects {
            return Err(fail(format!("Too many redirects (> {})", self.max_redirects)));
        }
        if target == *origin || followed.iter().any(|u| u == target.as_str()) {
            return Err(fail(format!("Redirect loop at {}", target)));
        }

        let off_host = self.policy == RedirectPolicy::FollowOnHost
            && host_key(&target) != host_key(origin);
        if off_host || !(request.in_spec)(target.as_str()) {
            return Err(FetchError::RedirectOutsideSpec {
                url: request.url.to_string(),
                target: target.to_string(),
            });
        }
        Ok(target)
    }
}

#[async_trait]
impl UrlFetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchOutcome, FetchError> {
        let origin = Url::parse(request.url).map_err(|e| FetchError::Fail {
            url: request.url.to_string(),
            message: e.to_string(),
        })?;
        let mut current = origin.clone();
        let mut redirects: Vec<String> = Vec::new();

        loop {
            let mut builder = self.client.get(current.clone());
            if redirects.is_empty() {
                if let Some(since) = request.if_modified_since {
                    builder = builder.header(IF_MODIFIED_SINCE, since);
                }
            }

            let response = builder
                .send()
                .await
                .map_err(|e| Self::transport_error(request.url, e))?;
            let status = response.status();
            tracing::trace!("{} -> {}", current, status);

            if status == StatusCode::NOT_MODIFIED {
                return Ok(FetchOutcome::NotModified);
            }

            if status.is_redirection() {
                let target = self.redirect_target(
                    request,
                    &origin,
                    &current,
                    response.headers(),
                    &redirects,
                )?;
                tracing::debug!("Following redirect {} -> {}", current, target);
                redirects.push(target.to_string());
                current = target;
                continue;
            }

            let message = format!("HTTP {}", status.as_u16());
            return match self.result_map.classify(status.as_u16()) {
                FetchResultKind::Success => {
                    let headers = response
                        .headers()
                        .iter()
                        .filter_map(|(name, value)| {
                            value
                                .to_str()
                                .ok()
                                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
                        })
                        .collect();
                    let body = response
                        .bytes()
                        .await
                        .map_err(|e| Self::transport_error(request.url, e))?
                        .to_vec();
                    Ok(FetchOutcome::Fetched(FetchedContent {
                        url: request.url.to_string(),
                        redirects,
                        headers,
                        body,
                    }))
                }
                FetchResultKind::Retry => Err(FetchError::Retryable {
                    url: request.url.to_string(),
                    message,
                    retry_count: None,
                    retry_delay: parse_retry_after(response.headers(), Utc::now()),
                }),
                FetchResultKind::Fail => Err(FetchError::Fail {
                    url: request.url.to_string(),
                    message,
                }),
                FetchResultKind::Fatal => Err(FetchError::Fatal {
                    url: request.url.to_string(),
                    message,
                }),
            };
        }
    }
}

/// Delay requested by a `Retry-After` header, in seconds or as an HTTP date
fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - now).to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_fetcher(policy: RedirectPolicy) -> HttpFetcher {
        let http = HttpConfig {
            redirect_policy: policy,
            max_redirects: 3,
            ..HttpConfig::default()
        };
        HttpFetcher::new(&http, &UserAgentConfig::default()).unwrap()
    }

    fn everything(_: &str) -> bool {
        true
    }

    async fn fetch(
        fetcher: &HttpFetcher,
        url: &str,
        since: Option<&str>,
    ) -> Result<FetchOutcome, FetchError> {
        fetcher
            .fetch(&FetchRequest {
                url,
                if_modified_since: since,
                in_spec: &everything,
            })
            .await
    }

    #[test]
    fn test_default_result_map() {
        let map = HttpResultMap::default();
        assert_eq!(map.classify(200), FetchResultKind::Success);
        assert_eq!(map.classify(404), FetchResultKind::Fail);
        assert_eq!(map.classify(503), FetchResultKind::Retry);
        assert_eq!(map.classify(429), FetchResultKind::Retry);

        let mut overrides = BTreeMap::new();
        overrides.insert("403".to_string(), FetchResultKind::Fatal);
        let map = HttpResultMap::from_config(&overrides);
        assert_eq!(map.classify(403), FetchResultKind::Fatal);
    }

    #[test]
    fn test_parse_retry_after() {
        let now = Utc::now();
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("120"));
        assert_eq!(
            parse_retry_after(&headers, now),
            Some(Duration::from_secs(120))
        );

        let later = (now + chrono::Duration::seconds(30)).to_rfc2822();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(&later).unwrap());
        let delay = parse_retry_after(&headers, now).unwrap();
        assert!(delay <= Duration::from_secs(30) && delay >= Duration::from_secs(29));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers, now), None);
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page.html"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "text/html")
                    .set_body_string("<html></html>"),
            )
            .mount(&server)
            .await;

        let fetcher = create_test_fetcher(RedirectPolicy::FollowOnHost);
        let url = format!("{}/page.html", server.uri());
        match fetch(&fetcher, &url, None).await.unwrap() {
            FetchOutcome::Fetched(content) => {
                assert_eq!(content.content_type(), Some("text/html"));
                assert_eq!(content.body, b"<html></html>");
                assert_eq!(content.final_url(), url);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_conditional_get_not_modified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("if-modified-since", "Mon, 01 Jan 2024 00:00:00 GMT"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let fetcher = create_test_fetcher(RedirectPolicy::FollowOnHost);
        let outcome = fetch(
            &fetcher,
            &format!("{}/a", server.uri()),
            Some("Mon, 01 Jan 2024 00:00:00 GMT"),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, FetchOutcome::NotModified));
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/busy"))
            .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let fetcher = create_test_fetcher(RedirectPolicy::FollowOnHost);
        assert!(matches!(
            fetch(&fetcher, &format!("{}/missing", server.uri()), None).await,
            Err(FetchError::Fail { .. })
        ));
        match fetch(&fetcher, &format!("{}/busy", server.uri()), None).await {
            Err(FetchError::Retryable { retry_delay, .. }) => {
                assert_eq!(retry_delay, Some(Duration::from_secs(7)))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_redirects() {
        let server = MockServer::start().await;
        Mock::given(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new"))
            .mount(&server)
            .await;
        Mock::given(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
            .mount(&server)
            .await;
        Mock::given(path("/away"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", "http://other.example/x"),
            )
            .mount(&server)
            .await;
        Mock::given(path("/loop"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/loop"))
            .mount(&server)
            .await;

        let fetcher = create_test_fetcher(RedirectPolicy::FollowOnHost);
        match fetch(&fetcher, &format!("{}/old", server.uri()), None)
            .await
            .unwrap()
        {
            FetchOutcome::Fetched(content) => {
                assert_eq!(content.redirects, vec![format!("{}/new", server.uri())]);
                assert_eq!(content.body, b"moved");
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        assert!(matches!(
            fetch(&fetcher, &format!("{}/away", server.uri()), None).await,
            Err(FetchError::RedirectOutsideSpec { .. })
        ));
        assert!(matches!(
            fetch(&fetcher, &format!("{}/loop", server.uri()), None).await,
            Err(FetchError::Fail { .. })
        ));
    }
}
