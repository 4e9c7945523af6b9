//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Repository trait.

use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Repository, StorageError, StorageResult, StoredContent};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite content repository
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Opens or creates the repository database
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    pub fn new(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Headers are stored one `name: value` pair per line
fn encode_headers(headers: &BTreeMap<String, String>) -> StorageResult<String> {
    let mut out = String::new();
    for (name, value) in headers {
        if name.contains(['\n', ':']) || value.contains('\n') {
            return Err(StorageError::Serialization(format!(
                "header {:?} cannot be stored",
                name
            )));
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }
    Ok(out)
}

fn decode_headers(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once(": "))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

impl Repository for SqliteRepository {
    fn store(&self, au_id: &str, content: &StoredContent) -> StorageResult<()> {
        let headers = encode_headers(&content.headers)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO contents (au_id, url, headers, body, size, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                au_id,
                content.url,
                headers,
                content.body,
                content.body.len() as i64,
                content.fetched_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn has_content(&self, au_id: &str, url: &str) -> StorageResult<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM contents WHERE au_id = ?1 AND url = ?2",
                params![au_id, url],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn get(&self, au_id: &str, url: &str) -> StorageResult<Option<StoredContent>> {
        let row = self
            .conn()
            .query_row(
                "SELECT headers, body, fetched_at FROM contents WHERE au_id = ?1 AND url = ?2",
                params![au_id, url],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((headers, body, fetched_at)) = row else {
            return Ok(None);
        };
        let fetched_at = DateTime::parse_from_rfc3339(&fetched_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        Ok(Some(StoredContent {
            url: url.to_string(),
            headers: decode_headers(&headers),
            body,
            fetched_at,
        }))
    }

    fn urls(&self, au_id: &str) -> StorageResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT url FROM contents WHERE au_id = ?1 ORDER BY url")?;
        let urls = stmt
            .query_map(params![au_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(urls)
    }

    fn au_size(&self, au_id: &str) -> StorageResult<u64> {
        let size: i64 = self.conn().query_row(
            "SELECT COALESCE(SUM(size), 0) FROM contents WHERE au_id = ?1",
            params![au_id],
            |row| row.get(0),
        )?;
        Ok(size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_content(url: &str, body: &[u8]) -> StoredContent {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "text/html".to_string());
        StoredContent::new(url, headers, body.to_vec())
    }

    #[test]
    fn test_create_in_memory() {
        let repo = SqliteRepository::new_in_memory();
        assert!(repo.is_ok());
    }

    #[test]
    fn test_store_and_get() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let content = create_test_content("http://pub.example/", b"<html></html>");
        repo.store("pub", &content).unwrap();

        let loaded = repo.get("pub", "http://pub.example/").unwrap().unwrap();
        assert_eq!(loaded.body, content.body);
        assert_eq!(loaded.content_type(), Some("text/html"));
        assert!(repo.get("pub", "http://pub.example/missing").unwrap().is_none());
    }

    #[test]
    fn test_store_replaces_existing() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        repo.store("pub", &create_test_content("http://pub.example/", b"one"))
            .unwrap();
        repo.store("pub", &create_test_content("http://pub.example/", b"three"))
            .unwrap();

        assert_eq!(repo.urls("pub").unwrap().len(), 1);
        assert_eq!(repo.au_size("pub").unwrap(), 5);
    }

    #[test]
    fn test_content_is_scoped_by_au() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        repo.store("a", &create_test_content("http://pub.example/b", b"x"))
            .unwrap();
        repo.store("a", &create_test_content("http://pub.example/a", b"x"))
            .unwrap();

        assert!(repo.has_content("a", "http://pub.example/a").unwrap());
        assert!(!repo.has_content("b", "http://pub.example/a").unwrap());
        assert_eq!(
            repo.urls("a").unwrap(),
            vec!["http://pub.example/a", "http://pub.example/b"]
        );
        assert_eq!(repo.au_size("b").unwrap(), 0);
    }

    #[test]
    fn test_file_backed_repository() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest.db");
        {
            let repo = SqliteRepository::new(&path).unwrap();
            repo.store("pub", &create_test_content("http://pub.example/", b"x"))
                .unwrap();
        }
        let repo = SqliteRepository::new(&path).unwrap();
        assert!(repo.has_content("pub", "http://pub.example/").unwrap());
    }
}
