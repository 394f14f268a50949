//! Persistent processing queue
//!
//! A JSON file holding every queue item, rewritten atomically after each
//! mutation. Every mutation runs under an exclusive lock on a sidecar
//! `<queue>.lock` file and starts from a fresh read of the queue file, so
//! separate processes sharing one queue never overwrite each other's items.
//! That lock is also what makes a claim atomic: `get_next_item` flips the item
//! to `processing` before it is released, so two workers can never hold the
//! same capture.

mod item;

pub use item::{
    FailureDisposition, ItemStatus, QueueItem, QueueStatus, RetryPolicy, StuckItem,
};

use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::canonical::ContentUid;
use crate::config::{Config, QueueConfig};
use crate::fsutil;
use crate::model::{Priority, UserContext};

const QUEUE_FILE_VERSION: u32 = 1;

/// Upper bound on a single backoff delay (one year)
pub const MAX_RETRY_DELAY_SECS: u64 = 365 * 24 * 3600;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to read queue file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("queue file {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to persist queue file {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to lock queue file {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid stale age {0} hours: must be finite and >= 0")]
    InvalidAge(f64),
}

#[derive(Serialize)]
struct QueueFile<'a> {
    version: u32,
    updated_at: DateTime<Utc>,
    items: &'a [QueueItem],
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QueueFileRepr {
    Wrapped { items: Vec<serde_json::Value> },
    Bare(Vec<serde_json::Value>),
}

/// Parameters for a new queue entry
#[derive(Debug, Clone)]
pub struct NewItem {
    pub capture_id: String,
    pub item_type: String,
    pub source: String,
    pub user_context: UserContext,
    pub priority: Priority,
    pub content_uid: Option<ContentUid>,
}

impl NewItem {
    pub fn new(
        capture_id: impl Into<String>,
        item_type: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            capture_id: capture_id.into(),
            item_type: item_type.into(),
            source: source.into(),
            user_context: UserContext::default(),
            priority: Priority::default(),
            content_uid: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn user_context(mut self, user_context: UserContext) -> Self {
        self.user_context = user_context;
        self
    }

    pub fn content_uid(mut self, uid: ContentUid) -> Self {
        self.content_uid = Some(uid);
        self
    }
}

pub struct ProcessingQueue {
    path: PathBuf,
    lock_path: PathBuf,
    policy: RetryPolicy,
    max_processing: Duration,
    /// Last state read from or written to disk
    items: Mutex<Vec<QueueItem>>,
}

impl ProcessingQueue {
    pub fn open(config: &Config) -> Result<Self, QueueError> {
        Self::open_at(&config.storage.queue_path(), &config.queue)
    }

    pub fn open_at(path: &Path, config: &QueueConfig) -> Result<Self, QueueError> {
        let items = load_items(path)?;
        debug!(path = %path.display(), count = items.len(), "Queue loaded");

        let mut lock_path = OsString::from(path.as_os_str());
        lock_path.push(".lock");

        Ok(Self {
            path: path.to_path_buf(),
            lock_path: PathBuf::from(lock_path),
            policy: RetryPolicy::from_config(config),
            max_processing: Duration::try_minutes(config.max_processing_minutes.max(0))
                .unwrap_or(Duration::MAX),
            items: Mutex::new(items),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Vec<QueueItem>> {
        // The cache is only replaced with a complete list, so a poisoned
        // guard still holds a consistent state.
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Exclusive lock shared with every other handle on this queue file,
    /// in this process or another. Released when the returned file drops.
    fn lock_file(&self) -> Result<File, QueueError> {
        let lock_err = |source| QueueError::Lock {
            path: self.lock_path.clone(),
            source,
        };
        if let Some(parent) = self.lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(lock_err)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(lock_err)?;
        file.lock_exclusive().map_err(lock_err)?;
        Ok(file)
    }

    /// Re-read the queue file and apply `f` to it under the file lock,
    /// saving only if `f` reports a change. The cache is updated only after
    /// a successful save.
    fn mutate<T>(&self, f: impl FnOnce(&mut Vec<QueueItem>) -> (T, bool)) -> Result<T, QueueError> {
        let mut guard = self.lock();
        let _file_lock = self.lock_file()?;

        let mut next = load_items(&self.path)?;
        let (result, changed) = f(&mut next);
        if changed {
            self.save(&next)?;
        }
        *guard = next;
        Ok(result)
    }

    /// Current on-disk state for read-only queries. Writers replace the file
    /// by rename, so no lock is needed to see a whole file.
    fn snapshot(&self) -> MutexGuard<'_, Vec<QueueItem>> {
        let mut guard = self.lock();
        match load_items(&self.path) {
            Ok(items) => *guard = items,
            Err(e) => warn!("Queue reload failed, using last known state: {}", e),
        }
        guard
    }

    fn save(&self, items: &[QueueItem]) -> Result<(), QueueError> {
        let file = QueueFile {
            version: QUEUE_FILE_VERSION,
            updated_at: Utc::now(),
            items,
        };
        fsutil::atomic_write_json(&self.path, &file).map_err(|source| {
            warn!(path = %self.path.display(), "Queue save failed: {}", source);
            QueueError::Persist {
                path: self.path.clone(),
                source,
            }
        })
    }

    // ============================================
    // MUTATIONS
    // ============================================

    /// Enqueue a capture. Returns `false` without changes if the capture id is
    /// already present, whatever its state.
    pub fn add_to_queue(&self, new: NewItem) -> Result<bool, QueueError> {
        self.mutate(|items| {
            if items.iter().any(|i| i.capture_id == new.capture_id) {
                debug!(capture_id = %new.capture_id, "Already queued, ignoring");
                return (false, false);
            }

            let mut item = QueueItem::new(
                new.capture_id,
                new.item_type,
                new.source,
                new.user_context,
                new.priority,
            );
            item.content_uid = new.content_uid;
            info!(
                capture_id = %item.capture_id,
                item_type = %item.item_type,
                priority = %item.priority,
                "Queued"
            );
            items.push(item);
            (true, true)
        })
    }

    /// Claim the most urgent ready item: lowest `(priority, added_timestamp)`,
    /// queue order breaking any remaining tie.
    pub fn get_next_item(
        &self,
        item_types: Option<&[String]>,
        processor_id: &str,
    ) -> Result<Option<QueueItem>, QueueError> {
        let now = Utc::now();
        let wanted: Option<HashSet<&str>> = item_types
            .filter(|t| !t.is_empty())
            .map(|t| t.iter().map(String::as_str).collect());

        self.mutate(|items| {
            let next = items
                .iter()
                .enumerate()
                .filter(|(_, i)| i.is_ready(now))
                .filter(|(_, i)| {
                    wanted
                        .as_ref()
                        .map_or(true, |w| w.contains(i.item_type.as_str()))
                })
                .min_by_key(|(idx, i)| (i.priority, i.added_timestamp, *idx))
                .map(|(idx, _)| idx);

            let Some(idx) = next else {
                return (None, false);
            };

            let item = &mut items[idx];
            item.status = ItemStatus::Processing;
            item.processor_id = Some(processor_id.to_string());
            item.processing_started = Some(now);
            item.last_attempt_timestamp = Some(now);
            item.processing_attempts += 1;
            item.next_retry_time = None;

            debug!(
                capture_id = %item.capture_id,
                processor_id,
                attempt = item.processing_attempts,
                "Claimed"
            );
            (Some(item.clone()), true)
        })
    }

    /// `processing → completed`. Returns `false` if the item is unknown or not
    /// currently processing.
    pub fn mark_complete(
        &self,
        capture_id: &str,
        result_paths: BTreeMap<String, String>,
    ) -> Result<bool, QueueError> {
        let now = Utc::now();
        self.mutate(|items| {
            let Some(item) = items.iter_mut().find(|i| i.capture_id == capture_id) else {
                warn!(capture_id, "mark_complete: not in queue");
                return (false, false);
            };
            if item.status != ItemStatus::Processing {
                warn!(capture_id, status = %item.status, "mark_complete: item not processing");
                return (false, false);
            }

            item.status = ItemStatus::Completed;
            item.processing_completed = Some(now);
            item.processing_time_secs = item
                .processing_started
                .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);
            item.result_paths = result_paths;
            item.processor_id = None;

            info!(
                capture_id,
                secs = item.processing_time_secs.unwrap_or_default(),
                "Completed"
            );
            (true, true)
        })
    }

    /// Record a failed attempt; reschedule with backoff or fail terminally
    pub fn mark_failed(
        &self,
        capture_id: &str,
        error: &str,
    ) -> Result<FailureDisposition, QueueError> {
        let now = Utc::now();
        let policy = &self.policy;
        self.mutate(|items| {
            let Some(item) = items.iter_mut().find(|i| i.capture_id == capture_id) else {
                warn!(capture_id, "mark_failed: not in queue");
                return (FailureDisposition::Ignored, false);
            };
            if item.status != ItemStatus::Processing {
                warn!(capture_id, status = %item.status, "mark_failed: item not processing");
                return (FailureDisposition::Ignored, false);
            }

            item.error_count += 1;
            item.last_error = Some(error.to_string());
            item.processor_id = None;

            let attempts = item.processing_attempts;
            let disposition = if attempts < policy.max_retry_attempts {
                let delay = policy.delay_secs(attempts).min(MAX_RETRY_DELAY_SECS);
                // next_retry_time must lie strictly in the future
                let next = now + Duration::seconds(delay as i64).max(Duration::milliseconds(1));
                item.status = ItemStatus::Retry;
                item.next_retry_time = Some(next);
                item.last_retry_delay_secs = Some(delay);
                info!(capture_id, attempts, delay_secs = delay, "Retry scheduled: {}", error);
                FailureDisposition::Retry {
                    attempts,
                    next_retry_time: next,
                }
            } else {
                item.status = ItemStatus::Failed;
                item.next_retry_time = None;
                item.processing_completed = Some(now);
                warn!(capture_id, attempts, "Failed permanently: {}", error);
                FailureDisposition::Failed { attempts }
            };
            (disposition, true)
        })
    }

    /// Force-fail items stuck in `processing` longer than `max_age_hours`.
    /// Returns the reclaimed capture ids. An age too large to represent
    /// reclaims nothing.
    pub fn cleanup_stale_items(&self, max_age_hours: f64) -> Result<Vec<String>, QueueError> {
        if !max_age_hours.is_finite() || max_age_hours < 0.0 {
            return Err(QueueError::InvalidAge(max_age_hours));
        }
        let now = Utc::now();
        // `as` saturates, try_milliseconds rejects what is still out of range
        let cutoff = Duration::try_milliseconds((max_age_hours * 3_600_000.0) as i64)
            .and_then(|max_age| now.checked_sub_signed(max_age));
        let Some(cutoff) = cutoff else {
            return Ok(vec![]);
        };

        self.mutate(|items| {
            let mut reclaimed = vec![];
            for item in items.iter_mut() {
                if item.status != ItemStatus::Processing {
                    continue;
                }
                let started = item.processing_started.unwrap_or(item.added_timestamp);
                if started >= cutoff {
                    continue;
                }

                item.status = ItemStatus::Failed;
                item.error_count += 1;
                item.last_error = Some(format!(
                    "processing timed out: no result after {:.1}h (held by {})",
                    max_age_hours,
                    item.processor_id.as_deref().unwrap_or("unknown")
                ));
                item.processor_id = None;
                item.processing_completed = Some(now);
                warn!(capture_id = %item.capture_id, "Reclaimed stale item");
                reclaimed.push(item.capture_id.clone());
            }
            let changed = !reclaimed.is_empty();
            (reclaimed, changed)
        })
    }

    /// Operator action: give up on an item that has not started or is waiting to retry
    pub fn abandon(&self, capture_id: &str, reason: &str) -> Result<bool, QueueError> {
        self.mutate(|items| {
            let Some(item) = items.iter_mut().find(|i| i.capture_id == capture_id) else {
                return (false, false);
            };
            if !matches!(item.status, ItemStatus::Pending | ItemStatus::Retry) {
                return (false, false);
            }
            item.status = ItemStatus::Abandoned;
            item.last_error = Some(reason.to_string());
            item.next_retry_time = None;
            info!(capture_id, "Abandoned: {}", reason);
            (true, true)
        })
    }

    // ============================================
    // QUERIES
    // ============================================

    pub fn get_item(&self, capture_id: &str) -> Option<QueueItem> {
        self.snapshot()
            .iter()
            .find(|i| i.capture_id == capture_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        let now = Utc::now();
        let items = self.snapshot();

        let mut status = QueueStatus {
            total: items.len(),
            generated_at: Some(now),
            ..Default::default()
        };

        for item in items.iter() {
            *status.by_status.entry(item.status.to_string()).or_default() += 1;
            *status.by_priority.entry(item.priority.to_string()).or_default() += 1;
            *status.by_type.entry(item.item_type.clone()).or_default() += 1;

            if item.is_ready(now) {
                status.ready += 1;
            }

            if item.status == ItemStatus::Pending {
                status.oldest_pending = Some(match status.oldest_pending {
                    Some(t) => t.min(item.added_timestamp),
                    None => item.added_timestamp,
                });
            }

            if item.status == ItemStatus::Processing {
                let started = item.processing_started.unwrap_or(item.added_timestamp);
                let elapsed = now.signed_duration_since(started);
                if elapsed > self.max_processing {
                    status.stuck_items.push(StuckItem {
                        capture_id: item.capture_id.clone(),
                        item_type: item.item_type.clone(),
                        processor_id: item.processor_id.clone(),
                        processing_started: item.processing_started,
                        minutes_processing: elapsed.num_minutes(),
                    });
                }
            }
        }

        status
    }
}

fn load_items(path: &Path) -> Result<Vec<QueueItem>, QueueError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(source) => {
            return Err(QueueError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if content.trim().is_empty() {
        return Ok(vec![]);
    }

    let raw = match serde_json::from_str::<QueueFileRepr>(&content) {
        Ok(QueueFileRepr::Wrapped { items }) | Ok(QueueFileRepr::Bare(items)) => items,
        Err(source) => {
            return Err(QueueError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut seen = HashSet::new();
    let mut items = Vec::with_capacity(raw.len());
    for (idx, value) in raw.into_iter().enumerate() {
        match serde_json::from_value::<QueueItem>(value) {
            Ok(item) => {
                if seen.insert(item.capture_id.clone()) {
                    items.push(item);
                } else {
                    warn!(capture_id = %item.capture_id, "Duplicate queue record skipped");
                }
            }
            Err(e) => warn!(index = idx, "Malformed queue record skipped: {}", e),
        }
    }
    Ok(items)
}
