use crate::au::ArchivalUnit;
use crate::exploder::ArchiveEntry;
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

/// Where an archive entry is stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntry {
    pub base_url: String,
    pub rest_of_url: String,
    pub headers: BTreeMap<String, String>,
}

impl ResolvedEntry {
    pub fn url(&self) -> String {
        format!("{}{}", self.base_url, self.rest_of_url)
    }
}

/// Maps archive entries to the URLs they are stored under
///
/// Returning `None` drops the entry as a bad entry.
pub trait ExploderHelper: Send + Sync + fmt::Debug {
    fn process(&self, entry: &ArchiveEntry, au: &dyn ArchivalUnit) -> Option<ResolvedEntry>;
}

/// Extension to MIME type table for synthesized headers
const MIME_TYPES: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("htm", "text/html"),
    ("xhtml", "application/xhtml+xml"),
    ("css", "text/css"),
    ("js", "application/javascript"),
    ("txt", "text/plain"),
    ("xml", "application/xml"),
    ("json", "application/json"),
    ("pdf", "application/pdf"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("epub", "application/epub+zip"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
];

pub fn mime_type_for(name: &str) -> &'static str {
    let file = name.rsplit('/').next().unwrap_or(name);
    let Some((_, ext)) = file.rsplit_once('.') else {
        return "application/octet-stream";
    };
    let ext = ext.to_ascii_lowercase();
    MIME_TYPES
        .iter()
        .find(|(e, _)| *e == ext)
        .map_or("application/octet-stream", |(_, mime)| mime)
}

/// Headers for an exploded entry: the archive's own headers when it
/// recorded any, otherwise synthesized from the name and timestamp
pub fn synthesize_headers(entry: &ArchiveEntry) -> BTreeMap<String, String> {
    let mut headers = entry.headers.clone();
    headers
        .entry("content-type".to_string())
        .or_insert_with(|| mime_type_for(&entry.name).to_string());
    headers.insert("content-length".to_string(), entry.size.to_string());
    if let Some(modified) = entry.modified {
        headers
            .entry("last-modified".to_string())
            .or_insert_with(|| modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string());
    }
    headers
}

/// Entry path safe to append to a base URL
fn clean_path(name: &str) -> Option<&str> {
    let name = name.trim_start_matches("./").trim_start_matches('/');
    if name.is_empty() || name.split('/').any(|segment| segment == "..") {
        return None;
    }
    Some(name)
}

/// Stores entries under the AU's first base URL
///
/// Entries named by an absolute URL (ARC records) are stored at that URL
/// when it falls under one of the AU's base URLs, or under its own
/// `scheme://host/` otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultExploderHelper;

impl ExploderHelper for DefaultExploderHelper {
    fn process(&self, entry: &ArchiveEntry, au: &dyn ArchivalUnit) -> Option<ResolvedEntry> {
        if let Ok(url) = Url::parse(&entry.name) {
            if !matches!(url.scheme(), "http" | "https") {
                return None;
            }
            let full = url.as_str();
            let base = au
                .base_urls()
                .iter()
                .find(|base| full.starts_with(base.as_str()))
                .cloned()
                .or_else(|| {
                    url.host_str()
                        .map(|host| match url.port() {
                            Some(port) => format!("{}://{}:{}/", url.scheme(), host, port),
                            None => format!("{}://{}/", url.scheme(), host),
                        })
                })?;
            return Some(ResolvedEntry {
                rest_of_url: full.get(base.len()..)?.to_string(),
                base_url: base,
                headers: synthesize_headers(entry),
            });
        }

        let base = au.base_urls().first()?;
        Some(ResolvedEntry {
            base_url: base.clone(),
            rest_of_url: clean_path(&entry.name)?.to_string(),
            headers: synthesize_headers(entry),
        })
    }
}

/// Maps entry path prefixes to base URLs
///
/// `("journal1/", "http://content.example/j1/")` stores
/// `journal1/a.pdf` at `http://content.example/j1/a.pdf`. The longest
/// matching stem wins; entries matching no stem are bad entries.
#[derive(Debug, Clone)]
pub struct StemExploderHelper {
    stems: Vec<(String, String)>,
}

impl StemExploderHelper {
    pub fn new(mut stems: Vec<(String, String)>) -> Self {
        stems.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { stems }
    }
}

impl ExploderHelper for StemExploderHelper {
    fn process(&self, entry: &ArchiveEntry, _au: &dyn ArchivalUnit) -> Option<ResolvedEntry> {
        let name = clean_path(&entry.name)?;
        let (stem, base) = self.stems.iter().find(|(stem, _)| name.starts_with(stem.as_str()))?;
        let rest = &name[stem.len()..];
        if rest.is_empty() {
            return None;
        }
        Some(ResolvedEntry {
            base_url: base.clone(),
            rest_of_url: rest.to_string(),
            headers: synthesize_headers(entry),
        })
    }
}
