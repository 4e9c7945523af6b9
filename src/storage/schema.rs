//! Database schema definitions and migrations
//!
//! This module contains all SQL schema definitions for the content repository.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Stored content, one row per URL per archival unit
CREATE TABLE IF NOT EXISTS contents (
    au_id TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    size INTEGER NOT NULL,
    fetched_at TEXT NOT NULL,
    PRIMARY KEY (au_id, url)
);

CREATE INDEX IF NOT EXISTS idx_contents_url ON contents(url);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.pragma_update(None, "user_version", get_schema_version())?;
    Ok(())
}

/// Gets the current schema version
pub fn get_schema_version() -> u32 {
    1
}
