//! SQLite schema for the content store
//!
//! One row per content item, keyed by its content UID. Text and file
//! captures use a hash of their payload as UID, URL captures the hash of the
//! canonical URL.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS content (
    uid TEXT PRIMARY KEY,                  -- 16 hex chars
    item_type TEXT NOT NULL,               -- 'url', 'text', 'file', ...
    source_url TEXT,                       -- raw URL as captured
    canonical_url TEXT,
    title TEXT,
    tags TEXT NOT NULL DEFAULT '[]',       -- JSON array
    content_path TEXT,                     -- markdown / text artifact
    html_path TEXT,
    transcript_path TEXT,
    status TEXT NOT NULL,                  -- 'completed' | 'failed'
    error TEXT,
    capture_id TEXT,                       -- first capture that produced it
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_content_canonical ON content(canonical_url);
CREATE INDEX IF NOT EXISTS idx_content_status ON content(status);
CREATE INDEX IF NOT EXISTS idx_content_updated ON content(updated_at DESC);
"#;
