//! Bulletproof capture
//!
//! Accepts raw input from client devices and stores it durably before anything
//! else happens. Every public entry point returns a [`CaptureResult`]; storage
//! problems become `success: false`, an audit line and a failure notification.

mod record;

pub use record::{CaptureLookup, CaptureRecord, CaptureResult, ParsedUrl};

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::fsutil;
use crate::model::{CaptureStatus, CaptureType, UserContext};
use crate::notify::FailureNotifier;

const METADATA_SUFFIX: &str = "_metadata.json";

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("metadata serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("capture not found: {0}")]
    NotFound(String),
}

impl CaptureError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CaptureError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Time-ordered, human-traceable id: `20260115_143012_123_9f2c4a1b`
pub fn generate_capture_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S_%3f"), &suffix[..8])
}

fn is_safe_id(capture_id: &str) -> bool {
    !capture_id.is_empty()
        && capture_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

struct Payload<'a> {
    capture_type: CaptureType,
    file_name: String,
    bytes: &'a [u8],
}

pub struct BulletproofCapture {
    captures_dir: PathBuf,
    backup_dir: PathBuf,
    metadata_dir: PathBuf,
    audit_log: PathBuf,
    notifier: Arc<FailureNotifier>,
}

impl BulletproofCapture {
    pub fn new(config: &Config, notifier: Arc<FailureNotifier>) -> Self {
        Self {
            captures_dir: config.storage.captures_path(),
            backup_dir: config.storage.backup_path(),
            metadata_dir: config.storage.metadata_path(),
            audit_log: config.storage.audit_log_path(),
            notifier,
        }
    }

    // ============================================
    // CAPTURE
    // ============================================

    pub fn capture_url(&self, url: Option<&str>, user_context: UserContext) -> CaptureResult {
        let capture_id = generate_capture_id();
        let outcome = self.store_url(&capture_id, url, user_context);
        self.finish(capture_id, CaptureType::Url, outcome)
    }

    pub fn capture_text(&self, text: Option<&str>, user_context: UserContext) -> CaptureResult {
        let capture_id = generate_capture_id();
        let outcome = self.store_text(&capture_id, text, user_context);
        self.finish(capture_id, CaptureType::Text, outcome)
    }

    pub fn capture_file(&self, path: Option<&Path>, user_context: UserContext) -> CaptureResult {
        let capture_id = generate_capture_id();
        let outcome = self.store_file(&capture_id, path, user_context);
        self.finish(capture_id, CaptureType::File, outcome)
    }

    fn finish(
        &self,
        capture_id: String,
        capture_type: CaptureType,
        outcome: Result<CaptureRecord, CaptureError>,
    ) -> CaptureResult {
        match outcome {
            Ok(record) => {
                info!(capture_id = %capture_id, kind = %capture_type, "Captured");
                self.audit(&capture_id, capture_type, true, None, Some(&record.captured_path));
                CaptureResult::ok(record)
            }
            Err(e) => {
                let error = e.to_string();
                warn!(capture_id = %capture_id, kind = %capture_type, "Capture failed: {}", error);
                self.audit(&capture_id, capture_type, false, Some(&error), None);
                self.notifier
                    .capture_failed(&capture_id, capture_type.as_str(), &error);
                CaptureResult::failed(capture_id, error)
            }
        }
    }

    fn store_url(
        &self,
        capture_id: &str,
        url: Option<&str>,
        user_context: UserContext,
    ) -> Result<CaptureRecord, CaptureError> {
        let url = url
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| CaptureError::InvalidInput("URL is empty".to_string()))?;

        let payload = Payload {
            capture_type: CaptureType::Url,
            file_name: format!("{}.url", capture_id),
            bytes: url.as_bytes(),
        };
        let mut record = self.persist_payload(capture_id, &payload, user_context)?;
        record.url = Some(url.to_string());
        record.parsed_url = Some(ParsedUrl::parse(url));
        self.write_metadata(&record)?;
        Ok(record)
    }

    fn store_text(
        &self,
        capture_id: &str,
        text: Option<&str>,
        user_context: UserContext,
    ) -> Result<CaptureRecord, CaptureError> {
        let text = text
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| CaptureError::InvalidInput("text is empty".to_string()))?;

        let payload = Payload {
            capture_type: CaptureType::Text,
            file_name: format!("{}.txt", capture_id),
            bytes: text.as_bytes(),
        };
        let mut record = self.persist_payload(capture_id, &payload, user_context)?;
        record.text_length = Some(text.chars().count());
        self.write_metadata(&record)?;
        Ok(record)
    }

    fn store_file(
        &self,
        capture_id: &str,
        path: Option<&Path>,
        user_context: UserContext,
    ) -> Result<CaptureRecord, CaptureError> {
        let path = path
            .ok_or_else(|| CaptureError::InvalidInput("no file path given".to_string()))?;
        if !path.is_file() {
            return Err(CaptureError::InvalidInput(format!(
                "not a readable file: {}",
                path.display()
            )));
        }

        let bytes = std::fs::read(path)
            .map_err(|e| CaptureError::io(format!("reading {}", path.display()), e))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());

        let payload = Payload {
            capture_type: CaptureType::File,
            file_name: format!("{}_{}", capture_id, sanitize_file_name(&filename)),
            bytes: &bytes,
        };
        let mut record = self.persist_payload(capture_id, &payload, user_context)?;
        record.filename = Some(filename);
        record.file_size = Some(bytes.len() as u64);
        self.write_metadata(&record)?;
        Ok(record)
    }

    /// Atomic primary write, then a best-effort backup copy
    fn persist_payload(
        &self,
        capture_id: &str,
        payload: &Payload<'_>,
        user_context: UserContext,
    ) -> Result<CaptureRecord, CaptureError> {
        let captured_path = self.captures_dir.join(&payload.file_name);
        fsutil::atomic_write(&captured_path, payload.bytes)
            .map_err(|e| CaptureError::io(format!("writing {}", captured_path.display()), e))?;

        let backup_path = self.backup_dir.join(&payload.file_name);
        let backup_path = match fsutil::atomic_write(&backup_path, payload.bytes) {
            Ok(()) => Some(backup_path),
            Err(e) => {
                warn!(capture_id = %capture_id, "Backup copy failed: {}", e);
                None
            }
        };

        Ok(CaptureRecord {
            capture_id: capture_id.to_string(),
            capture_type: payload.capture_type,
            capture_timestamp: Utc::now(),
            status: CaptureStatus::Captured,
            user_context,
            captured_path,
            backup_path,
            payload_sha256: hex::encode(Sha256::digest(payload.bytes)),
            url: None,
            parsed_url: None,
            filename: None,
            file_size: None,
            text_length: None,
            status_updated: None,
            last_error: None,
        })
    }

    fn metadata_file(&self, capture_id: &str) -> PathBuf {
        self.metadata_dir
            .join(format!("{}{}", capture_id, METADATA_SUFFIX))
    }

    fn write_metadata(&self, record: &CaptureRecord) -> Result<(), CaptureError> {
        let path = self.metadata_file(&record.capture_id);
        let bytes = serde_json::to_vec_pretty(record)?;
        fsutil::atomic_write(&path, &bytes)
            .map_err(|e| CaptureError::io(format!("writing {}", path.display()), e))
    }

    fn audit(
        &self,
        capture_id: &str,
        capture_type: CaptureType,
        success: bool,
        error: Option<&str>,
        captured_path: Option<&Path>,
    ) {
        let line = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": "capture",
            "capture_id": capture_id,
            "type": capture_type,
            "success": success,
            "error": error,
            "captured_path": captured_path,
        });
        if let Err(e) = fsutil::append_json_line(&self.audit_log, &line) {
            debug!(capture_id = %capture_id, "Audit log append failed: {}", e);
        }
    }

    // ============================================
    // STATUS
    // ============================================

    /// Advance a capture's status; used by the queue side of the pipeline
    pub fn update_status(
        &self,
        capture_id: &str,
        status: CaptureStatus,
        error: Option<&str>,
    ) -> Result<CaptureRecord, CaptureError> {
        let mut record = match self.get_capture_status(capture_id) {
            CaptureLookup::Found(r) => r,
            CaptureLookup::NotFound { capture_id } => return Err(CaptureError::NotFound(capture_id)),
            CaptureLookup::Unreadable { error, .. } => {
                return Err(CaptureError::InvalidInput(error))
            }
        };

        record.status = status;
        record.status_updated = Some(Utc::now());
        if let Some(err) = error {
            record.last_error = Some(err.to_string());
        }
        self.write_metadata(&record)?;
        debug!(capture_id = %capture_id, status = %status, "Capture status updated");
        Ok(record)
    }

    pub fn get_capture_status(&self, capture_id: &str) -> CaptureLookup {
        if !is_safe_id(capture_id) {
            return CaptureLookup::NotFound {
                capture_id: capture_id.to_string(),
            };
        }

        let path = self.metadata_file(capture_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return CaptureLookup::NotFound {
                    capture_id: capture_id.to_string(),
                }
            }
            Err(e) => {
                return CaptureLookup::Unreadable {
                    capture_id: capture_id.to_string(),
                    error: e.to_string(),
                }
            }
        };

        match serde_json::from_str(&content) {
            Ok(record) => CaptureLookup::Found(record),
            Err(e) => CaptureLookup::Unreadable {
                capture_id: capture_id.to_string(),
                error: e.to_string(),
            },
        }
    }

    /// Newest captures first; unreadable metadata files are skipped
    pub fn list_captured_items(&self, limit: usize) -> Vec<CaptureRecord> {
        let dir = glob::Pattern::escape(&self.metadata_dir.to_string_lossy());
        let pattern = Path::new(&dir)
            .join(format!("*{}", METADATA_SUFFIX))
            .to_string_lossy()
            .to_string();

        let paths = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => {
                warn!("Invalid metadata glob {}: {}", pattern, e);
                return vec![];
            }
        };

        let mut records: Vec<CaptureRecord> = paths
            .filter_map(|entry| entry.ok())
            .filter_map(|path| {
                let content = std::fs::read_to_string(&path).ok()?;
                match serde_json::from_str(&content) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        debug!(path = %path.display(), "Skipping unreadable capture metadata: {}", e);
                        None
                    }
                }
            })
            .collect();

        records.sort_by(|a: &CaptureRecord, b: &CaptureRecord| {
            b.capture_timestamp
                .cmp(&a.capture_timestamp)
                .then_with(|| b.capture_id.cmp(&a.capture_id))
        });
        records.truncate(limit);
        records
    }

    /// Captures currently at `status`, oldest first
    pub fn list_by_status(&self, status: CaptureStatus) -> Vec<CaptureRecord> {
        let mut records = self.list_captured_items(usize::MAX);
        records.retain(|r| r.status == status);
        records.reverse();
        records
    }
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
