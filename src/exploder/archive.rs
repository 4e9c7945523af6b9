//! Entry iteration over the archive containers the crawler explodes

use crate::exploder::ExplodeError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use flate2::read::{GzDecoder, MultiGzDecoder};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};

/// Container format of an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
    Arc,
    ArcGz,
}

impl ArchiveKind {
    /// Format implied by the URL's file extension
    pub fn from_url(url: &str) -> Option<Self> {
        let path = url
            .split(['?', '#'])
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        if path.ends_with(".zip") {
            Some(Self::Zip)
        } else if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if path.ends_with(".tar") {
            Some(Self::Tar)
        } else if path.ends_with(".arc.gz") {
            Some(Self::ArcGz)
        } else if path.ends_with(".arc") {
            Some(Self::Arc)
        } else {
            None
        }
    }

    /// Format recognised from the leading bytes of the content
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(b"PK\x05\x06") {
            return Some(Self::Zip);
        }
        if bytes.starts_with(b"filedesc://") {
            return Some(Self::Arc);
        }
        if bytes.starts_with(&[0x1f, 0x8b]) {
            let mut head = [0u8; 11];
            let read = GzDecoder::new(bytes).read(&mut head).unwrap_or(0);
            return Some(if head[..read].starts_with(b"filedesc://") {
                Self::ArcGz
            } else {
                Self::TarGz
            });
        }
        if bytes.len() > 262 && &bytes[257..262] == b"ustar" {
            return Some(Self::Tar);
        }
        None
    }

    /// Extension first, content second
    pub fn detect(url: &str, bytes: &[u8]) -> Option<Self> {
        Self::from_url(url).or_else(|| Self::sniff(bytes))
    }
}

/// One file inside an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path within the archive; the record URL for ARC files
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Headers the archive recorded for the entry (ARC records only)
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl ArchiveEntry {
    fn new(name: String, modified: Option<DateTime<Utc>>, body: Vec<u8>) -> Self {
        Self {
            name,
            size: body.len() as u64,
            modified,
            headers: BTreeMap::new(),
            body,
        }
    }
}

/// Reads every non-directory entry of an archive
pub fn read_entries(kind: ArchiveKind, bytes: &[u8]) -> Result<Vec<ArchiveEntry>, ExplodeError> {
    match kind {
        ArchiveKind::Zip => read_zip(bytes),
        ArchiveKind::Tar => read_tar(bytes),
        ArchiveKind::TarGz => read_tar(GzDecoder::new(bytes)),
        ArchiveKind::Arc => read_arc(bytes),
        ArchiveKind::ArcGz => {
            let mut inflated = Vec::new();
            MultiGzDecoder::new(bytes)
                .read_to_end(&mut inflated)
                .map_err(|e| ExplodeError::Read(format!("gzip: {}", e)))?;
            read_arc(&inflated)
        }
    }
}

fn read_zip(bytes: &[u8]) -> Result<Vec<ArchiveEntry>, ExplodeError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ExplodeError::Read(format!("zip open failed: {}", e)))?;

    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| ExplodeError::Read(format!("zip entry failed: {}", e)))?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().to_string();
        let stamp = file.last_modified();
        let modified = NaiveDate::from_ymd_opt(
            i32::from(stamp.year()),
            u32::from(stamp.month()),
            u32::from(stamp.day()),
        )
        .and_then(|date| {
            date.and_hms_opt(
                u32::from(stamp.hour()),
                u32::from(stamp.minute()),
                u32::from(stamp.second()),
            )
        })
        .map(|naive| Utc.from_utc_datetime(&naive));

        let mut body = Vec::new();
        file.read_to_end(&mut body)
            .map_err(|e| ExplodeError::Read(format!("zip entry {}: {}", name, e)))?;
        entries.push(ArchiveEntry::new(name, modified, body));
    }
    Ok(entries)
}

fn read_tar<R: Read>(reader: R) -> Result<Vec<ArchiveEntry>, ExplodeError> {
    let mut archive = tar::Archive::new(reader);
    let iter = archive
        .entries()
        .map_err(|e| ExplodeError::Read(format!("tar entries failed: {}", e)))?;

    let mut entries = Vec::new();
    for entry in iter {
        let mut file = entry.map_err(|e| ExplodeError::Read(format!("tar entry failed: {}", e)))?;
        if !file.header().entry_type().is_file() {
            continue;
        }
        let name = file
            .path()
            .map_err(|e| ExplodeError::Read(format!("tar path failed: {}", e)))?
            .to_string_lossy()
            .into_owned();
        let modified = file
            .header()
            .mtime()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single());

        let mut body = Vec::new();
        file.read_to_end(&mut body)
            .map_err(|e| ExplodeError::Read(format!("tar entry {}: {}", name, e)))?;
        entries.push(ArchiveEntry::new(name, modified, body));
    }
    Ok(entries)
}

/// Reads version-1 ARC records
///
/// Each record is a header line `URL IP DATE CONTENT-TYPE LENGTH` followed
/// by LENGTH bytes, normally a full HTTP response. The leading `filedesc://`
/// record describes the file and is skipped.
fn read_arc(bytes: &[u8]) -> Result<Vec<ArchiveEntry>, ExplodeError> {
    let mut entries = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        if bytes[pos] == b'\n' || bytes[pos] == b'\r' {
            pos += 1;
            continue;
        }
        let line_end = bytes[pos..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|i| pos + i)
            .ok_or_else(|| ExplodeError::Read("truncated ARC record header".to_string()))?;
        let header = String::from_utf8_lossy(&bytes[pos..line_end]);
        let fields: Vec<&str> = header.split_whitespace().collect();
        if fields.len() < 5 {
            return Err(ExplodeError::Read(format!("bad ARC record header: {}", header)));
        }
        let length: usize = fields[fields.len() - 1]
            .parse()
            .map_err(|_| ExplodeError::Read(format!("bad ARC record length: {}", header)))?;
        let start = line_end + 1;
        let end = start
            .checked_add(length)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| ExplodeError::Read(format!("truncated ARC record: {}", fields[0])))?;
        pos = end;

        let url = fields[0];
        if url.starts_with("filedesc://") {
            continue;
        }
        let modified = NaiveDateTime::parse_from_str(fields[2], "%Y%m%d%H%M%S")
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive));
        let content = &bytes[start..end];

        let entry = match split_http_response(content) {
            Some((headers, body)) => {
                let mut entry = ArchiveEntry::new(url.to_string(), modified, body.to_vec());
                entry.headers = headers;
                entry
            }
            None => {
                let mut entry = ArchiveEntry::new(url.to_string(), modified, content.to_vec());
                entry
                    .headers
                    .insert("content-type".to_string(), fields[3].to_string());
                entry
            }
        };
        entries.push(entry);
    }
    Ok(entries)
}

/// Splits a stored HTTP response into lowercase headers and body
fn split_http_response(content: &[u8]) -> Option<(BTreeMap<String, String>, &[u8])> {
    if !content.starts_with(b"HTTP/") {
        return None;
    }
    let (head_len, sep_len) = find_subslice(content, b"\r\n\r\n")
        .map(|i| (i, 4))
        .or_else(|| find_subslice(content, b"\n\n").map(|i| (i, 2)))?;
    let head = String::from_utf8_lossy(&content[..head_len]);
    let headers = head
        .lines()
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    Some((headers, &content[head_len + sep_len..]))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
