//! Listing pages of synthetic AUs
//!
//! Each synthetic AU has a manifest page linking everything explosion has
//! stored in it. New links go just above a marker comment, so the page can
//! be extended by any number of later explosions without losing links.

use crate::au::ArchivalUnit;
use crate::permission::LOCKSS_PERMISSION_STATEMENT;
use crate::storage::{Repository, StorageResult, StoredContent};
use std::collections::BTreeMap;

pub const MANIFEST_MARKER: &str = "<!-- sumi-harvest: insert new links above -->";

/// Empty manifest page for an AU
pub fn new_manifest_page(title: &str) -> String {
    format!(
        "<html>\n<head><title>{title}</title></head>\n<body>\n<h1>{title}</h1>\n<p>{statement}.</p>\n<ul>\n{marker}\n</ul>\n</body>\n</html>\n",
        title = escape(title),
        statement = LOCKSS_PERMISSION_STATEMENT,
        marker = MANIFEST_MARKER,
    )
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Inserts links not already on the page above the marker
///
/// A page without the marker gets one appended first. Returns the page
/// unchanged when every link is already present.
pub fn insert_links(page: &str, links: &[String]) -> String {
    let mut page = page.to_string();
    if !page.contains(MANIFEST_MARKER) {
        page.push_str(MANIFEST_MARKER);
        page.push('\n');
    }

    let mut block = String::new();
    for link in links {
        let href = format!("href=\"{}\"", escape(link));
        if page.contains(&href) || block.contains(&href) {
            continue;
        }
        block.push_str(&format!("<li><a {}>{}</a></li>\n", href, escape(link)));
    }
    if block.is_empty() {
        return page;
    }

    match page.find(MANIFEST_MARKER) {
        Some(at) => page.insert_str(at, &block),
        None => page.push_str(&block),
    }
    page
}

/// Adds links to the AU's manifest page, creating the page if needed
///
/// Does nothing for AUs without a manifest page.
pub fn update_manifest(
    repository: &dyn Repository,
    au: &dyn ArchivalUnit,
    links: &[String],
) -> StorageResult<()> {
    let Some(manifest_url) = au.manifest_url() else {
        return Ok(());
    };
    let current = match repository.get(au.id(), &manifest_url)? {
        Some(stored) => String::from_utf8_lossy(&stored.body).into_owned(),
        None => new_manifest_page(au.name()),
    };
    let updated = insert_links(&current, links);
    if updated == current && repository.has_content(au.id(), &manifest_url)? {
        return Ok(());
    }

    let headers = BTreeMap::from([(
        "content-type".to_string(),
        "text/html; charset=utf-8".to_string(),
    )]);
    repository.store(
        au.id(),
        &StoredContent::new(&manifest_url, headers, updated.into_bytes()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::au::ConfiguredAu;
    use crate::rate::RateLimiterInfo;
    use crate::storage::MemoryRepository;

    #[test]
    fn test_insert_links_is_restartable() {
        let page = new_manifest_page("Exploded");
        let once = insert_links(&page, &["http://c.example/j/1.pdf".to_string()]);
        let twice = insert_links(
            &once,
            &[
                "http://c.example/j/1.pdf".to_string(),
                "http://c.example/j/2.pdf".to_string(),
            ],
        );

        assert_eq!(twice.matches("1.pdf\"").count(), 1);
        let first = twice.find("1.pdf").unwrap();
        let second = twice.find("2.pdf").unwrap();
        let marker = twice.find(MANIFEST_MARKER).unwrap();
        assert!(first < second && second < marker);
        assert_eq!(insert_links(&twice, &["http://c.example/j/2.pdf".to_string()]), twice);
    }

    #[test]
    fn test_marker_added_to_foreign_page() {
        let page = insert_links("<html>old</html>\n", &["http://x/a".to_string()]);
        assert!(page.starts_with("<html>old</html>\n<li>"));
        assert!(page.ends_with(&format!("{}\n", MANIFEST_MARKER)));
    }

    #[test]
    fn test_update_manifest_stores_page() {
        let repository = MemoryRepository::new();
        let au = ConfiguredAu::synthetic("http://c.example/j/", RateLimiterInfo::default()).unwrap();

        update_manifest(&repository, &au, &["http://c.example/j/1.pdf".to_string()]).unwrap();
        update_manifest(&repository, &au, &["http://c.example/j/2.pdf".to_string()]).unwrap();

        let page = repository
            .get(au.id(), "http://c.example/j/manifest.html")
            .unwrap()
            .unwrap();
        let text = String::from_utf8(page.body).unwrap();
        assert!(text.contains("j/1.pdf"));
        assert!(text.contains("j/2.pdf"));
        assert!(text.contains(LOCKSS_PERMISSION_STATEMENT));
    }
}
