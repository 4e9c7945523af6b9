//! Integration tests for the crawler
//!
//! These tests use wiremock to create mock HTTP servers and test
//! the full crawl cycle end-to-end, against a real SQLite repository.

use std::io::{Cursor, Write};
use std::sync::Arc;
use sumi_harvest::au::{ArchivalUnit, AuRegistry, ConfiguredAu};
use sumi_harvest::config::{ArchivalUnitConfig, Config};
use sumi_harvest::crawler::{
    AdmissionError, CrawlKind, CrawlManager, CrawlServices, FollowLinkCrawler, HttpFetcher,
};
use sumi_harvest::permission::{LOCKSS_PERMISSION_STATEMENT, NO_PERMISSION_STATEMENT};
use sumi_harvest::rate::{CrawlRateLimiter, RateLimiterInfo};
use sumi_harvest::state::Alphabetic;
use sumi_harvest::status::{CrawlStatusCode, CrawlerStatus, StatusCategory};
use sumi_harvest::storage::{open_repository, Repository, SqliteRepository};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates a test configuration that keeps every URL list after sealing
fn create_test_config() -> Config {
    let mut config = Config::default();
    config.crawler.default_retry_delay = 0;
    config.crawler.min_retry_delay = 0;
    config.manager.start_rate = "unlimited".to_string();
    config.status.keep_after_seal = vec![
        StatusCategory::Fetched,
        StatusCategory::Excluded,
        StatusCategory::NotModified,
        StatusCategory::Parsed,
    ];
    config
}

/// Creates an AU rooted at the mock server with its permission page there
fn create_au_config(server: &MockServer) -> ArchivalUnitConfig {
    let base = format!("{}/", server.uri());
    ArchivalUnitConfig {
        id: "pub".to_string(),
        start_urls: vec![format!("{}index.html", base)],
        permission_urls: vec![format!("{}lockss.html", base)],
        base_urls: vec![base],
        rate_limits: RateLimiterInfo::with_rate("unlimited"),
        ..ArchivalUnitConfig::default()
    }
}

async fn mount_page(server: &MockServer, page: &str, content_type: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(page))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, content_type))
        .mount(server)
        .await;
}

async fn mount_html(server: &MockServer, page: &str, body: &str) {
    mount_page(server, page, "text/html", body.as_bytes().to_vec()).await;
}

async fn mount_permission(server: &MockServer) {
    mount_html(
        server,
        "/lockss.html",
        &format!("<html><body>{}</body></html>", LOCKSS_PERMISSION_STATEMENT),
    )
    .await;
}

fn create_test_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in files {
        writer
            .start_file(*name, zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A repository, registry and config shared by the crawls of one test
struct TestHarvest {
    _dir: TempDir,
    repository: Arc<SqliteRepository>,
    registry: Arc<AuRegistry>,
    config: Arc<Config>,
}

impl TestHarvest {
    fn new(config: Config) -> Self {
        let dir = TempDir::new().unwrap();
        let repository = Arc::new(open_repository(&dir.path().join("harvest.db")).unwrap());
        Self {
            _dir: dir,
            repository,
            registry: Arc::new(AuRegistry::new()),
            config: Arc::new(config),
        }
    }

    fn services(&self) -> CrawlServices {
        let fetcher =
            Arc::new(HttpFetcher::new(&self.config.http, &self.config.user_agent).unwrap());
        CrawlServices::new(fetcher, self.repository.clone(), self.registry.clone())
    }

    fn crawler(&self, au_config: &ArchivalUnitConfig) -> FollowLinkCrawler {
        let au: Arc<dyn ArchivalUnit> = Arc::new(ConfiguredAu::from_config(au_config).unwrap());
        self.registry.register(au.clone());
        let limiter = Arc::new(CrawlRateLimiter::new(au.rate_limiter_info()).unwrap());
        FollowLinkCrawler::new(
            au,
            CrawlKind::NewContent,
            self.config.clone(),
            self.services(),
            limiter,
        )
    }

    async fn crawl(&self, au_config: &ArchivalUnitConfig) -> CrawlerStatus {
        self.crawler(au_config).crawl().await
    }
}

#[tokio::test]
async fn test_crawl_stays_within_rules() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_permission(&server).await;
    mount_html(
        &server,
        "/index.html",
        r#"<html><body>
            <a href="a.html">A</a>
            <a href="http://other.example/x.html">X</a>
        </body></html>"#,
    )
    .await;
    mount_html(&server, "/a.html", "<html><body>leaf</body></html>").await;

    let harvest = TestHarvest::new(create_test_config());
    let status = harvest.crawl(&create_au_config(&server)).await;

    assert_eq!(status.code(), CrawlStatusCode::Successful);
    assert_eq!(
        status.fetched().urls(),
        vec![format!("{}/index.html", base), format!("{}/a.html", base)]
    );
    assert_eq!(status.excluded().urls(), vec!["http://other.example/x.html"]);
    assert!(status.is_sealed());

    let stored = harvest
        .repository
        .get("pub", &format!("{}/a.html", base))
        .unwrap()
        .unwrap();
    assert_eq!(stored.body, b"<html><body>leaf</body></html>");
    assert_eq!(stored.content_type(), Some("text/html"));
}

#[tokio::test]
async fn test_missing_permission_statement_fetches_nothing() {
    let server = MockServer::start().await;
    let permission_url = format!("{}/lockss.html", server.uri());
    mount_html(&server, "/lockss.html", "<html><body>No robots here</body></html>").await;
    Mock::given(method("GET"))
        .and(path("/index.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("content"))
        .expect(0)
        .mount(&server)
        .await;

    let harvest = TestHarvest::new(create_test_config());
    let status = harvest.crawl(&create_au_config(&server)).await;

    assert_eq!(status.code(), CrawlStatusCode::NoPermission);
    assert_eq!(status.fetched().count(), 0);
    let error = status.url_errors().get(&permission_url).unwrap();
    assert_eq!(error.message, NO_PERMISSION_STATEMENT);
}

#[tokio::test]
async fn test_too_deep_chain_is_not_fetched() {
    let server = MockServer::start().await;
    mount_permission(&server).await;
    mount_html(&server, "/index.html", r#"<a href="l1.html">1</a>"#).await;
    mount_html(&server, "/l1.html", r#"<a href="l2.html">2</a>"#).await;
    mount_html(&server, "/l2.html", r#"<a href="l3.html">3</a>"#).await;
    Mock::given(method("GET"))
        .and(path("/l3.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("deep"))
        .expect(0)
        .mount(&server)
        .await;

    let mut config = create_test_config();
    config.crawler.max_crawl_depth = 3;
    let harvest = TestHarvest::new(config);
    let status = harvest.crawl(&create_au_config(&server)).await;

    assert_eq!(status.code(), CrawlStatusCode::Error);
    assert_eq!(status.message(), "Site depth exceeds max crawl depth (3)");
    assert_eq!(status.fetched().count(), 3);
}

#[tokio::test]
async fn test_shortcut_rescues_too_deep_url() {
    let server = MockServer::start().await;
    mount_permission(&server).await;
    mount_html(
        &server,
        "/index.html",
        r#"<a href="l1.html">1</a> <a href="z.html">shortcut</a>"#,
    )
    .await;
    mount_html(&server, "/l1.html", r#"<a href="l2.html">2</a>"#).await;
    mount_html(&server, "/l2.html", r#"<a href="l3.html">3</a>"#).await;
    mount_html(&server, "/z.html", r#"<a href="l3.html">3</a>"#).await;
    Mock::given(method("GET"))
        .and(path("/l3.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("deep"))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = create_test_config();
    config.crawler.max_crawl_depth = 3;
    let harvest = TestHarvest::new(config);
    // Alphabetic order reaches l3 through the long chain before z.html
    let status = harvest
        .crawler(&create_au_config(&server))
        .with_order(Box::new(Alphabetic))
        .crawl()
        .await;

    assert_eq!(status.code(), CrawlStatusCode::Successful);
    assert!(status
        .fetched()
        .contains(&format!("{}/l3.html", server.uri())));
}

#[tokio::test]
async fn test_archive_with_bad_entry_creates_synthetic_au() {
    let server = MockServer::start().await;
    mount_permission(&server).await;
    mount_html(&server, "/index.html", r#"<a href="bundle.zip">bundle</a>"#).await;
    let zip = create_test_zip(&[
        ("j1/a.pdf", b"first"),
        ("j1/b.pdf", b"second"),
        ("junk/c.txt", b"unplaceable"),
    ]);
    mount_page(&server, "/bundle.zip", "application/zip", zip).await;

    let mut config = create_test_config();
    config.crawler.explode_archives = true;
    let harvest = TestHarvest::new(config);
    let mut au_config = create_au_config(&server);
    au_config.explode_pattern = Some(r"\.zip$".to_string());
    au_config
        .explode_stems
        .insert("j1/".to_string(), "http://content.example/j1/".to_string());

    let status = harvest.crawl(&au_config).await;

    assert_eq!(status.code(), CrawlStatusCode::Error);
    assert_eq!(status.bad_entries(), ["junk/c.txt"]);
    assert_eq!(status.exploded_entries(), 2);

    let synthetic = harvest
        .registry
        .find_by_base_url("http://content.example/j1/")
        .unwrap();
    assert!(synthetic.is_never_crawl());
    assert_eq!(status.synthetic_aus(), [synthetic.id().to_string()]);
    for url in ["http://content.example/j1/a.pdf", "http://content.example/j1/b.pdf"] {
        assert!(harvest.repository.has_content(synthetic.id(), url).unwrap());
    }
}

#[tokio::test]
async fn test_cached_page_beyond_refetch_depth_is_fetched_once() {
    let server = MockServer::start().await;
    mount_permission(&server).await;
    mount_html(&server, "/index.html", r#"<a href="a.html">A</a>"#).await;
    Mock::given(method("GET"))
        .and(path("/a.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("leaf"))
        .expect(1)
        .mount(&server)
        .await;

    let harvest = TestHarvest::new(create_test_config());
    let au_config = create_au_config(&server);
    let first = harvest.crawl(&au_config).await;
    let second = harvest.crawl(&au_config).await;

    assert_eq!(first.fetched().count(), 2);
    assert_eq!(second.code(), CrawlStatusCode::Successful);
    assert_eq!(second.fetched().count(), 1);
    assert!(!second
        .fetched()
        .contains(&format!("{}/a.html", server.uri())));
}

#[tokio::test]
async fn test_manager_runs_crawl_and_enforces_start_rate() {
    let server = MockServer::start().await;
    mount_permission(&server).await;
    mount_html(&server, "/index.html", "<html><body>only page</body></html>").await;

    let mut config = create_test_config();
    config.manager.new_content_rate = "1/1h".to_string();
    let harvest = TestHarvest::new(config);
    let manager = CrawlManager::new(harvest.config.clone(), harvest.services()).unwrap();
    let au: Arc<dyn ArchivalUnit> =
        Arc::new(ConfiguredAu::from_config(&create_au_config(&server)).unwrap());

    let outcome = manager
        .start_new_content_crawl(au.clone(), None)
        .unwrap()
        .wait()
        .await;
    assert!(outcome.success);
    assert_eq!(outcome.status.fetched().count(), 1);
    assert!(!manager.activity_locks().is_au_locked("pub"));

    let second = manager.start_new_content_crawl(au, None);
    assert!(matches!(second, Err(AdmissionError::RateLimited(_))));
    assert_eq!(manager.history().len(), 1);
}
