//! Archive explosion
//!
//! A fetched archive whose URL matches the AU's explode pattern is split
//! into its entries, and every entry is stored as a crawled resource of
//! its own. Each entry is mapped to a URL by the AU's [`ExploderHelper`]
//! and stored in whichever AU owns the resolved base URL. A synthetic,
//! never-crawled AU is created when no AU owns it yet.

mod archive;
mod helper;
mod manifest;

pub use archive::{read_entries, ArchiveEntry, ArchiveKind};
pub use helper::{
    mime_type_for, synthesize_headers, DefaultExploderHelper, ExploderHelper, ResolvedEntry,
    StemExploderHelper,
};
pub use manifest::{insert_links, new_manifest_page, update_manifest, MANIFEST_MARKER};

use crate::au::{ArchivalUnit, AuRegistry};
use crate::storage::{Repository, StorageError, StoredContent};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that end an explosion
#[derive(Debug, Error)]
pub enum ExplodeError {
    #[error("Unrecognised archive format: {0}")]
    UnknownFormat(String),

    #[error("Archive read error: {0}")]
    Read(String),

    #[error("No good entries in {url} ({bad} bad)")]
    NoGoodEntries { url: String, bad: usize },

    #[error("Repository error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cannot create archival unit for {0}")]
    Registry(String),
}

/// What one explosion did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExplodeReport {
    /// Stored entry URLs, in archive order
    pub stored: Vec<String>,
    /// Names of entries no base URL could be resolved for
    pub bad_entries: Vec<String>,
    /// AUs that received entries
    pub touched_aus: Vec<String>,
    /// AUs created by this explosion
    pub created_aus: Vec<String>,
}

impl ExplodeReport {
    pub fn is_clean(&self) -> bool {
        self.bad_entries.is_empty()
    }
}

/// Stores the entries of fetched archives
pub struct Exploder<'a> {
    registry: &'a AuRegistry,
    repository: &'a dyn Repository,
}

impl<'a> Exploder<'a> {
    pub fn new(registry: &'a AuRegistry, repository: &'a dyn Repository) -> Self {
        Self {
            registry,
            repository,
        }
    }

    /// Explodes `body`, fetched from `archive_url` for `au`
    ///
    /// Entries the helper cannot place are counted as bad. The explosion
    /// fails when every entry is bad; with at least one good entry it
    /// succeeds and the report lists the bad ones.
    pub fn explode(
        &self,
        au: &Arc<dyn ArchivalUnit>,
        archive_url: &str,
        body: &[u8],
    ) -> Result<ExplodeReport, ExplodeError> {
        let kind = ArchiveKind::detect(archive_url, body)
            .ok_or_else(|| ExplodeError::UnknownFormat(archive_url.to_string()))?;
        let entries = read_entries(kind, body)?;
        debug!("{} entries in {:?} archive {}", entries.len(), kind, archive_url);

        let helper = au.exploder_helper();
        let mut report = ExplodeReport::default();
        let mut links: BTreeMap<String, (Arc<dyn ArchivalUnit>, Vec<String>)> = BTreeMap::new();

        for entry in &entries {
            let Some(resolved) = helper.process(entry, au.as_ref()) else {
                debug!("No base URL for {} in {}", entry.name, archive_url);
                report.bad_entries.push(entry.name.clone());
                continue;
            };
            let owner = self.owner_of(au, &resolved.base_url, &mut report)?;
            let url = resolved.url();

            let mut headers = resolved.headers;
            headers.insert("x-harvest-exploded-from".to_string(), archive_url.to_string());
            self.repository.store(
                owner.id(),
                &StoredContent::new(&url, headers, entry.body.clone()),
            )?;

            let (_, owner_links) = links
                .entry(owner.id().to_string())
                .or_insert_with(|| (owner.clone(), Vec::new()));
            owner_links.push(url.clone());
            report.stored.push(url);
        }

        if report.stored.is_empty() {
            return Err(ExplodeError::NoGoodEntries {
                url: archive_url.to_string(),
                bad: report.bad_entries.len(),
            });
        }

        for (id, (owner, owner_links)) in &links {
            update_manifest(self.repository, owner.as_ref(), owner_links)?;
            report.touched_aus.push(id.clone());
        }

        if report.is_clean() {
            info!("Exploded {}: {} entries", archive_url, report.stored.len());
        } else {
            warn!(
                "Exploded {}: {} entries, {} bad",
                archive_url,
                report.stored.len(),
                report.bad_entries.len()
            );
        }
        Ok(report)
    }

    fn owner_of(
        &self,
        au: &Arc<dyn ArchivalUnit>,
        base_url: &str,
        report: &mut ExplodeReport,
    ) -> Result<Arc<dyn ArchivalUnit>, ExplodeError> {
        if au.base_urls().iter().any(|b| b == base_url) {
            return Ok(au.clone());
        }
        let (owner, created) = self
            .registry
            .get_or_create_synthetic(base_url)
            .map_err(|e| ExplodeError::Registry(format!("{}: {}", base_url, e)))?;
        if created {
            report.created_aus.push(owner.id().to_string());
        }
        Ok(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::au::ConfiguredAu;
    use crate::config::ArchivalUnitConfig;
    use crate::storage::MemoryRepository;
    use std::io::{Cursor, Write};

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

    fn create_test_au(stems: &[(&str, &str)]) -> Arc<dyn ArchivalUnit> {
        let config = ArchivalUnitConfig {
            id: "pub".to_string(),
            base_urls: vec!["http://pub.example/".to_string()],
            start_urls: vec!["http://pub.example/index.html".to_string()],
            explode_pattern: Some(r"\.zip$".to_string()),
            explode_stems: stems
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..ArchivalUnitConfig::default()
        };
        Arc::new(ConfiguredAu::from_config(&config).unwrap())
    }

    #[test]
    fn test_explode_into_synthetic_au() {
        let registry = AuRegistry::new();
        let repository = MemoryRepository::new();
        let au = create_test_au(&[("j1/", "http://content.example/j1/")]);
        let zip = create_test_zip(&[("j1/a.pdf", b"a"), ("j1/b.pdf", b"b"), ("junk/c.txt", b"c")]);

        let report = Exploder::new(&registry, &repository)
            .explode(&au, "http://pub.example/bundle.zip", &zip)
            .unwrap();

        assert_eq!(
            report.stored,
            vec!["http://content.example/j1/a.pdf", "http://content.example/j1/b.pdf"]
        );
        assert_eq!(report.bad_entries, vec!["junk/c.txt"]);
        assert_eq!(report.created_aus, vec!["exploded:http://content.example/j1/"]);

        let synthetic = registry.find_by_base_url("http://content.example/j1/").unwrap();
        assert!(synthetic.is_never_crawl());
        let stored = repository
            .get(synthetic.id(), "http://content.example/j1/a.pdf")
            .unwrap()
            .unwrap();
        assert_eq!(stored.content_type(), Some("application/pdf"));
        assert_eq!(
            stored.header("x-harvest-exploded-from"),
            Some("http://pub.example/bundle.zip")
        );
        assert!(repository
            .has_content(synthetic.id(), "http://content.example/j1/manifest.html")
            .unwrap());
    }

    #[test]
    fn test_second_explosion_reuses_au() {
        let registry = AuRegistry::new();
        let repository = MemoryRepository::new();
        let au = create_test_au(&[("j1/", "http://content.example/j1/")]);
        let exploder = Exploder::new(&registry, &repository);

        let first = exploder
            .explode(&au, "http://pub.example/1.zip", &create_test_zip(&[("j1/a.pdf", b"a")]))
            .unwrap();
        let second = exploder
            .explode(&au, "http://pub.example/2.zip", &create_test_zip(&[("j1/b.pdf", b"b")]))
            .unwrap();
        assert_eq!(first.created_aus.len(), 1);
        assert!(second.created_aus.is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_default_helper_stores_in_own_au() {
        let registry = AuRegistry::new();
        let repository = MemoryRepository::new();
        let au = create_test_au(&[]);
        let zip = create_test_zip(&[("docs/a.html", b"<html></html>")]);

        let report = Exploder::new(&registry, &repository)
            .explode(&au, "http://pub.example/docs.zip", &zip)
            .unwrap();
        assert_eq!(report.stored, vec!["http://pub.example/docs/a.html"]);
        assert!(report.created_aus.is_empty());
        assert!(repository
            .has_content("pub", "http://pub.example/docs/a.html")
            .unwrap());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_all_bad_entries_fail() {
        let registry = AuRegistry::new();
        let repository = MemoryRepository::new();
        let au = create_test_au(&[("j1/", "http://content.example/j1/")]);
        let zip = create_test_zip(&[("x/1", b"1"), ("y/2", b"2")]);

        let result = Exploder::new(&registry, &repository).explode(
            &au,
            "http://pub.example/bad.zip",
            &zip,
        );
        assert!(matches!(result, Err(ExplodeError::NoGoodEntries { bad: 2, .. })));
        assert!(repository.is_empty());
    }

    #[test]
    fn test_unknown_format() {
        let registry = AuRegistry::new();
        let repository = MemoryRepository::new();
        let au = create_test_au(&[]);
        let result = Exploder::new(&registry, &repository).explode(
            &au,
            "http://pub.example/file.bin",
            b"plain bytes",
        );
        assert!(matches!(result, Err(ExplodeError::UnknownFormat(_))));
    }
}
