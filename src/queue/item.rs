//! Queue item, state machine and retry policy

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::canonical::ContentUid;
use crate::config::QueueConfig;
use crate::model::{Priority, UserContext};

/// State machine:
///
/// ```text
/// pending ──claim──> processing ──complete──> completed
///                      │  ▲
///           fail (<max)│  │claim once next_retry_time passed
///                      ▼  │
///                     retry
/// processing ──fail (>=max) or stale sweep──> failed
/// pending | retry ──abandon──> abandoned
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retry,
    Abandoned,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::Retry => "retry",
            ItemStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Abandoned
        )
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub capture_id: String,
    pub item_type: String,
    pub source: String,
    #[serde(default)]
    pub user_context: UserContext,
    pub priority: Priority,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_uid: Option<ContentUid>,

    pub added_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub processing_attempts: u32,
    #[serde(default)]
    pub last_attempt_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processing_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processing_completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processing_time_secs: Option<f64>,

    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub next_retry_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_retry_delay_secs: Option<u64>,

    #[serde(default)]
    pub processor_id: Option<String>,
    #[serde(default)]
    pub result_paths: BTreeMap<String, String>,
}

impl QueueItem {
    pub fn new(
        capture_id: impl Into<String>,
        item_type: impl Into<String>,
        source: impl Into<String>,
        user_context: UserContext,
        priority: Priority,
    ) -> Self {
        Self {
            capture_id: capture_id.into(),
            item_type: item_type.into(),
            source: source.into(),
            user_context,
            priority,
            status: ItemStatus::Pending,
            content_uid: None,
            added_timestamp: Utc::now(),
            processing_attempts: 0,
            last_attempt_timestamp: None,
            processing_started: None,
            processing_completed: None,
            processing_time_secs: None,
            last_error: None,
            error_count: 0,
            next_retry_time: None,
            last_retry_delay_secs: None,
            processor_id: None,
            result_paths: BTreeMap::new(),
        }
    }

    /// Claimable now: pending, or retry whose backoff has elapsed
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            ItemStatus::Pending => true,
            ItemStatus::Retry => self.next_retry_time.map_or(true, |t| t <= now),
            _ => false,
        }
    }
}

/// Exponential backoff with a ceiling
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retry_attempts: u32,
    pub base_delay_secs: u64,
    pub backoff_multiplier: f64,
    pub max_delay_secs: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_retry_attempts: config.max_retry_attempts,
            base_delay_secs: config.base_delay_secs,
            backoff_multiplier: config.backoff_multiplier,
            max_delay_secs: config.max_delay_secs,
        }
    }

    /// Delay before the next attempt after `attempts` failed attempts
    pub fn delay_secs(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay_secs as f64 * self.backoff_multiplier.powi(exponent);
        if !raw.is_finite() || raw >= self.max_delay_secs as f64 {
            self.max_delay_secs
        } else {
            raw as u64
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// What `mark_failed` did with an item
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDisposition {
    /// Rescheduled with backoff
    Retry {
        attempts: u32,
        next_retry_time: DateTime<Utc>,
    },
    /// Retries exhausted; terminal
    Failed { attempts: u32 },
    /// Unknown id or item not in `processing`; nothing changed
    Ignored,
}

impl FailureDisposition {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailureDisposition::Failed { .. })
    }
}

/// An item that has been processing longer than the configured maximum
#[derive(Debug, Clone, Serialize)]
pub struct StuckItem {
    pub capture_id: String,
    pub item_type: String,
    pub processor_id: Option<String>,
    pub processing_started: Option<DateTime<Utc>>,
    pub minutes_processing: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStatus {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub ready: usize,
    pub oldest_pending: Option<DateTime<Utc>>,
    pub stuck_items: Vec<StuckItem>,
    pub generated_at: Option<DateTime<Utc>>,
}

impl QueueStatus {
    pub fn count(&self, status: ItemStatus) -> usize {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}
