//! Content metadata storage with SQLite
//!
//! Handlers consult this store by content UID before doing any fetch work;
//! a completed row means the content already exists and the item can be
//! short-circuited.

mod schema;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::canonical::ContentUid;

pub use schema::SCHEMA;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    Completed,
    Failed,
}

impl ContentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentStatus::Completed => "completed",
            ContentStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "completed" => ContentStatus::Completed,
            _ => ContentStatus::Failed,
        }
    }
}

impl fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Everything a handler persists about one piece of content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentMetadata {
    pub uid: ContentUid,
    pub item_type: String,
    pub source_url: Option<String>,
    pub canonical_url: Option<String>,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub content_path: Option<String>,
    pub html_path: Option<String>,
    pub transcript_path: Option<String>,
    pub status: ContentStatus,
    pub error: Option<String>,
    pub capture_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContentMetadata {
    pub fn new(uid: ContentUid, item_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            uid,
            item_type: item_type.into(),
            source_url: None,
            canonical_url: None,
            title: None,
            tags: vec![],
            content_path: None,
            html_path: None,
            transcript_path: None,
            status: ContentStatus::Completed,
            error: None,
            capture_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Artifact kind → path, as reported back to the queue
    pub fn result_paths(&self) -> BTreeMap<String, String> {
        let mut paths = BTreeMap::new();
        if let Some(p) = &self.content_path {
            paths.insert("content".to_string(), p.clone());
        }
        if let Some(p) = &self.html_path {
            paths.insert("html".to_string(), p.clone());
        }
        if let Some(p) = &self.transcript_path {
            paths.insert("transcript".to_string(), p.clone());
        }
        paths
    }
}

pub struct ContentStore {
    conn: Mutex<Connection>,
}

impl ContentStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, uid: &ContentUid) -> Result<Option<ContentMetadata>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM content WHERE uid = ?", COLUMNS),
                params![uid.as_str()],
                read_row,
            )
            .optional()?;

        row.map(RawRow::into_metadata).transpose()
    }

    /// True if completed content exists for this UID
    pub fn is_complete(&self, uid: &ContentUid) -> Result<bool, StoreError> {
        let conn = self.conn();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM content WHERE uid = ? AND status = 'completed'",
                params![uid.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert or replace the row for `meta.uid`, keeping the original `created_at`
    pub fn upsert(&self, meta: &ContentMetadata) -> Result<(), StoreError> {
        let tags = serde_json::to_string(&meta.tags)?;
        let conn = self.conn();
        conn.execute(
            r#"INSERT INTO content
               (uid, item_type, source_url, canonical_url, title, tags, content_path,
                html_path, transcript_path, status, error, capture_id, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(uid) DO UPDATE SET
                   item_type = excluded.item_type,
                   source_url = excluded.source_url,
                   canonical_url = excluded.canonical_url,
                   title = excluded.title,
                   tags = excluded.tags,
                   content_path = excluded.content_path,
                   html_path = excluded.html_path,
                   transcript_path = excluded.transcript_path,
                   status = excluded.status,
                   error = excluded.error,
                   capture_id = COALESCE(content.capture_id, excluded.capture_id),
                   updated_at = excluded.updated_at"#,
            params![
                meta.uid.as_str(),
                meta.item_type,
                meta.source_url,
                meta.canonical_url,
                meta.title,
                tags,
                meta.content_path,
                meta.html_path,
                meta.transcript_path,
                meta.status.as_str(),
                meta.error,
                meta.capture_id,
                meta.created_at.to_rfc3339(),
                meta.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Record a failed ingestion so it is visible, without hiding earlier
    /// completed content under the same UID
    pub fn record_failure(
        &self,
        uid: &ContentUid,
        item_type: &str,
        source_url: Option<&str>,
        capture_id: Option<&str>,
        error: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            r#"INSERT INTO content
               (uid, item_type, source_url, status, error, capture_id, created_at, updated_at)
               VALUES (?1, ?2, ?3, 'failed', ?4, ?5, ?6, ?6)
               ON CONFLICT(uid) DO UPDATE SET
                   error = excluded.error,
                   updated_at = excluded.updated_at
               WHERE content.status != 'completed'"#,
            params![uid.as_str(), item_type, source_url, error, capture_id, now],
        )?;
        Ok(())
    }

    pub fn list(&self, limit: usize) -> Result<Vec<ContentMetadata>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM content ORDER BY updated_at DESC LIMIT ?",
            COLUMNS
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![limit], read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRow::into_metadata).collect()
    }

    pub fn count_by_status(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM content GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        rows.collect::<Result<BTreeMap<_, _>, _>>().map_err(Into::into)
    }
}

// ============================================
// ROW MAPPING
// ============================================

const COLUMNS: &str = "uid, item_type, source_url, canonical_url, title, tags, content_path, \
                       html_path, transcript_path, status, error, capture_id, created_at, updated_at";

struct RawRow {
    uid: String,
    item_type: String,
    source_url: Option<String>,
    canonical_url: Option<String>,
    title: Option<String>,
    tags: String,
    content_path: Option<String>,
    html_path: Option<String>,
    transcript_path: Option<String>,
    status: String,
    error: Option<String>,
    capture_id: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_row(row: &rusqlite::Row) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        uid: row.get(0)?,
        item_type: row.get(1)?,
        source_url: row.get(2)?,
        canonical_url: row.get(3)?,
        title: row.get(4)?,
        tags: row.get(5)?,
        content_path: row.get(6)?,
        html_path: row.get(7)?,
        transcript_path: row.get(8)?,
        status: row.get(9)?,
        error: row.get(10)?,
        capture_id: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

impl RawRow {
    fn into_metadata(self) -> Result<ContentMetadata, StoreError> {
        Ok(ContentMetadata {
            uid: ContentUid::from_stored(self.uid),
            item_type: self.item_type,
            source_url: self.source_url,
            canonical_url: self.canonical_url,
            title: self.title,
            tags: serde_json::from_str(&self.tags)?,
            content_path: self.content_path,
            html_path: self.html_path,
            transcript_path: self.transcript_path,
            status: ContentStatus::parse(&self.status),
            error: self.error,
            capture_id: self.capture_id,
            created_at: parse_ts(&self.created_at),
            updated_at: parse_ts(&self.updated_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(url: &str) -> ContentMetadata {
        let mut meta = ContentMetadata::new(ContentUid::from_url(url), "url");
        meta.source_url = Some(url.to_string());
        meta.title = Some("A title".to_string());
        meta.tags = vec!["reading".to_string()];
        meta.content_path = Some("/content/x/article.md".to_string());
        meta.capture_id = Some("cap-1".to_string());
        meta
    }

    #[test]
    fn test_upsert_and_get() {
        let store = ContentStore::open_in_memory().unwrap();
        let meta = sample("https://example.com/a");
        store.upsert(&meta).unwrap();

        let loaded = store.get(&meta.uid).unwrap().unwrap();
        assert_eq!(loaded.title.as_deref(), Some("A title"));
        assert_eq!(loaded.tags, vec!["reading".to_string()]);
        assert_eq!(loaded.status, ContentStatus::Completed);
        assert!(store.is_complete(&meta.uid).unwrap());
        assert_eq!(loaded.result_paths()["content"], "/content/x/article.md");

        assert!(store.get(&ContentUid::from_url("https://example.com/b")).unwrap().is_none());
    }

    #[test]
    fn test_upsert_keeps_first_capture_id() {
        let store = ContentStore::open_in_memory().unwrap();
        let meta = sample("https://example.com/a");
        store.upsert(&meta).unwrap();

        let mut again = meta.clone();
        again.capture_id = Some("cap-2".to_string());
        again.title = Some("Updated".to_string());
        store.upsert(&again).unwrap();

        let loaded = store.get(&meta.uid).unwrap().unwrap();
        assert_eq!(loaded.capture_id.as_deref(), Some("cap-1"));
        assert_eq!(loaded.title.as_deref(), Some("Updated"));
    }

    #[test]
    fn test_failure_does_not_clobber_completed() {
        let store = ContentStore::open_in_memory().unwrap();
        let meta = sample("https://example.com/a");
        store.upsert(&meta).unwrap();
        store
            .record_failure(&meta.uid, "url", meta.source_url.as_deref(), Some("cap-9"), "404")
            .unwrap();
        assert!(store.is_complete(&meta.uid).unwrap());

        let other = ContentUid::from_url("https://example.com/broken");
        store
            .record_failure(&other, "url", Some("https://example.com/broken"), None, "timeout")
            .unwrap();
        assert!(!store.is_complete(&other).unwrap());
        let failed = store.get(&other).unwrap().unwrap();
        assert_eq!(failed.status, ContentStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("timeout"));

        let counts = store.count_by_status().unwrap();
        assert_eq!(counts["completed"], 1);
        assert_eq!(counts["failed"], 1);
        assert_eq!(store.list(10).unwrap().len(), 2);
        assert_eq!(store.list(1).unwrap().len(), 1);
    }

    #[test]
    fn test_open_on_disk_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("db/content.db");
        {
            let store = ContentStore::open(&path).unwrap();
            store.upsert(&sample("https://example.com/a")).unwrap();
        }
        let store = ContentStore::open(&path).unwrap();
        assert_eq!(store.list(10).unwrap().len(), 1);
    }
}
