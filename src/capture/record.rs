//! Capture records as persisted in `{capture_id}_metadata.json`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

use crate::canonical::{canonicalize, ContentUid};
use crate::model::{CaptureStatus, CaptureType, UserContext};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub capture_id: String,
    #[serde(rename = "type")]
    pub capture_type: CaptureType,
    pub capture_timestamp: DateTime<Utc>,
    pub status: CaptureStatus,
    #[serde(default)]
    pub user_context: UserContext,

    /// Durably stored payload
    pub captured_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    pub payload_sha256: String,

    // URL captures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_url: Option<ParsedUrl>,

    // File captures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,

    // Text captures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Parsed view of a captured URL, including its dedup key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedUrl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub canonical: String,
    pub content_uid: ContentUid,
}

impl ParsedUrl {
    pub fn parse(raw: &str) -> Self {
        let canonical = canonicalize(raw);
        let content_uid = ContentUid::from_canonical(&canonical);
        let parsed = Url::parse(raw.trim()).ok();
        Self {
            scheme: parsed.as_ref().map(|u| u.scheme().to_string()),
            host: parsed.as_ref().and_then(|u| u.host_str().map(String::from)),
            path: parsed.as_ref().map(|u| u.path().to_string()),
            canonical,
            content_uid,
        }
    }
}

impl CaptureRecord {
    pub fn content_uid(&self) -> Option<&ContentUid> {
        self.parsed_url.as_ref().map(|p| &p.content_uid)
    }

    /// What the queue receives as `source` for this capture
    pub fn queue_source(&self) -> String {
        match (self.capture_type, &self.url) {
            (CaptureType::Url, Some(url)) => url.clone(),
            _ => self.captured_path.to_string_lossy().to_string(),
        }
    }
}

/// Synchronous outcome handed back to the client for every capture call
#[derive(Debug, Clone, Serialize)]
pub struct CaptureResult {
    pub success: bool,
    pub capture_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CaptureRecord>,
}

impl CaptureResult {
    pub fn ok(record: CaptureRecord) -> Self {
        Self {
            success: true,
            capture_id: record.capture_id.clone(),
            error: None,
            metadata: Some(record),
        }
    }

    pub fn failed(capture_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            capture_id: capture_id.into(),
            error: Some(error.into()),
            metadata: None,
        }
    }
}

/// Result of a status lookup. Never an error for missing ids.
#[derive(Debug, Clone)]
pub enum CaptureLookup {
    Found(CaptureRecord),
    NotFound { capture_id: String },
    Unreadable { capture_id: String, error: String },
}

impl CaptureLookup {
    pub fn record(&self) -> Option<&CaptureRecord> {
        match self {
            CaptureLookup::Found(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, CaptureLookup::Found(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parsed_url_carries_uid() {
        let parsed = ParsedUrl::parse("https://www.example.com/a?utm_source=x");
        assert_eq!(parsed.canonical, "http://example.com/a");
        assert_eq!(parsed.host.as_deref(), Some("www.example.com"));
        assert_eq!(parsed.scheme.as_deref(), Some("https"));
        assert_eq!(parsed.content_uid, ContentUid::from_url("example.com/a"));
    }

    #[test]
    fn test_parsed_url_tolerates_garbage() {
        let parsed = ParsedUrl::parse("definitely not a url");
        assert!(parsed.scheme.is_none());
        assert_eq!(parsed.canonical, "definitely not a url");
    }
}
