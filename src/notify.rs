//! Best-effort failure notification
//!
//! Every channel here swallows its own errors. A failure to notify is logged
//! through `tracing` and otherwise ignored so the pipeline keeps moving.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use tracing::{debug, warn};

use crate::config::Config;
use crate::fsutil;

/// One line of the failure log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEvent {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub error: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl FailureEvent {
    pub fn new(event: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event: event.into(),
            capture_id: None,
            source: None,
            error: error.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn capture_id(mut self, id: impl Into<String>) -> Self {
        self.capture_id = Some(id.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

pub struct FailureNotifier {
    failure_log: PathBuf,
    audit_log: PathBuf,
    console: bool,
    desktop: bool,
}

impl FailureNotifier {
    pub fn new(config: &Config) -> Self {
        Self {
            failure_log: config.storage.failure_log_path(),
            audit_log: config.storage.audit_log_path(),
            console: config.notifier.console,
            desktop: config.notifier.desktop,
        }
    }

    /// Report a capture that could not be stored
    pub fn capture_failed(&self, capture_id: &str, kind: &str, error: &str) {
        self.notify(
            FailureEvent::new("capture_failed", error)
                .capture_id(capture_id)
                .source(kind),
        );
    }

    /// Report a processing failure; `terminal` means no retry will follow
    pub fn processing_failed(&self, capture_id: &str, item_type: &str, error: &str, terminal: bool) {
        let event = if terminal {
            "processing_failed"
        } else {
            "processing_retry"
        };
        self.notify(
            FailureEvent::new(event, error)
                .capture_id(capture_id)
                .source(item_type)
                .details(serde_json::json!({ "terminal": terminal })),
        );
    }

    /// Fan an event out to every channel. Never fails.
    pub fn notify(&self, event: FailureEvent) {
        if let Err(e) = fsutil::append_json_line(&self.failure_log, &event) {
            warn!(path = %self.failure_log.display(), "Failed to append to failure log: {}", e);
        }

        let summary = match &event.capture_id {
            Some(id) => format!("{} [{}]: {}", event.event, id, event.error),
            None => format!("{}: {}", event.event, event.error),
        };

        if self.console {
            eprintln!("⚠️  {}", summary);
        }

        if self.desktop {
            send_desktop_notification("capturekeep", &summary);
        }
    }

    /// Most recent failure events, newest last
    pub fn recent_failures(&self, limit: usize) -> Vec<FailureEvent> {
        let file = match std::fs::File::open(&self.failure_log) {
            Ok(f) => f,
            Err(_) => return vec![],
        };

        let events: Vec<FailureEvent> = BufReader::new(file)
            .lines()
            .map_while(|line| line.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();

        let skip = events.len().saturating_sub(limit);
        events.into_iter().skip(skip).collect()
    }

    /// Drop failure and audit log lines older than `retention_days`.
    /// Returns the number of lines removed. Negative retention counts as zero;
    /// a retention reaching past the earliest representable date removes
    /// nothing.
    pub fn cleanup_old_entries(&self, retention_days: i64) -> usize {
        let cutoff = Duration::try_days(retention_days.max(0))
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let mut removed = 0;
        for path in [&self.failure_log, &self.audit_log] {
            match prune_log(path, cutoff) {
                Ok(n) => removed += n,
                Err(e) => warn!(path = %path.display(), "Log retention cleanup failed: {}", e),
            }
        }
        removed
    }
}

/// Rewrite a JSONL log keeping lines newer than `cutoff`.
/// Lines without a parseable timestamp are kept.
pub fn prune_log(path: &Path, cutoff: DateTime<Utc>) -> std::io::Result<usize> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut kept = String::with_capacity(content.len());
    let mut removed = 0;
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if line_timestamp(line).is_some_and(|ts| ts < cutoff) {
            removed += 1;
            continue;
        }
        kept.push_str(line);
        kept.push('\n');
    }

    if removed > 0 {
        fsutil::atomic_write(path, kept.as_bytes())?;
    }
    Ok(removed)
}

fn line_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let ts = value.get("timestamp")?.as_str()?;
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn send_desktop_notification(title: &str, body: &str) {
    let mut command = if cfg!(target_os = "linux") {
        let mut c = Command::new("notify-send");
        c.arg(title).arg(body);
        c
    } else if cfg!(target_os = "macos") {
        let script = format!(
            "display notification {:?} with title {:?}",
            body.replace('"', "'"),
            title
        );
        let mut c = Command::new("osascript");
        c.arg("-e").arg(script);
        c
    } else {
        return;
    };

    if let Err(e) = spawn_reaped(command) {
        debug!("Desktop notification unavailable: {}", e);
    }
}

/// Start `command` without blocking the caller. A background thread waits on
/// the child so it never lingers as a zombie.
fn spawn_reaped(mut command: Command) -> std::io::Result<JoinHandle<std::io::Result<ExitStatus>>> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(std::thread::spawn(move || child.wait()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn quiet_notifier(dir: &TempDir) -> FailureNotifier {
        let mut config = Config::with_root(dir.path());
        config.notifier.desktop = false;
        config.notifier.console = false;
        FailureNotifier::new(&config)
    }

    #[test]
    fn test_notify_appends_to_failure_log() {
        let dir = TempDir::new().unwrap();
        let notifier = quiet_notifier(&dir);

        notifier.capture_failed("cap-1", "url", "disk full");
        notifier.processing_failed("cap-2", "text", "boom", true);

        let events = notifier.recent_failures(10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "capture_failed");
        assert_eq!(events[0].capture_id.as_deref(), Some("cap-1"));
        assert_eq!(events[1].event, "processing_failed");
        assert_eq!(events[1].details["terminal"], true);

        let last = notifier.recent_failures(1);
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].capture_id.as_deref(), Some("cap-2"));
    }

    #[test]
    fn test_notify_never_fails_on_unwritable_log() {
        let dir = TempDir::new().unwrap();
        // a directory where the log file should be makes appends fail
        let mut config = Config::with_root(dir.path());
        config.notifier.desktop = false;
        config.notifier.console = false;
        std::fs::create_dir_all(config.storage.failure_log_path()).unwrap();
        let notifier = FailureNotifier::new(&config);

        notifier.capture_failed("cap-1", "file", "nope");
        assert!(notifier.recent_failures(5).is_empty());
    }

    #[test]
    fn test_prune_log_keeps_recent_and_unparseable() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("failures.jsonl");
        let old = Utc::now() - Duration::days(90);
        let fresh = Utc::now();
        let content = format!(
            "{{\"timestamp\":\"{}\",\"event\":\"old\"}}\n{{\"timestamp\":\"{}\",\"event\":\"new\"}}\nnot json\n",
            old.to_rfc3339(),
            fresh.to_rfc3339()
        );
        std::fs::write(&log, content).unwrap();

        let removed = prune_log(&log, Utc::now() - Duration::days(30)).unwrap();
        assert_eq!(removed, 1);

        let remaining = std::fs::read_to_string(&log).unwrap();
        assert!(!remaining.contains("\"old\""));
        assert!(remaining.contains("\"new\""));
        assert!(remaining.contains("not json"));
    }

    #[test]
    fn test_cleanup_with_extreme_retention_does_not_panic() {
        let dir = TempDir::new().unwrap();
        let notifier = quiet_notifier(&dir);
        notifier.capture_failed("cap-1", "url", "disk full");

        assert_eq!(notifier.cleanup_old_entries(i64::MAX / 10), 0);
        assert_eq!(notifier.cleanup_old_entries(i64::MAX), 0);
        assert_eq!(notifier.recent_failures(5).len(), 1);

        // negative is treated as zero: everything already logged is past it
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(notifier.cleanup_old_entries(i64::MIN), 1);
        assert!(notifier.recent_failures(5).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_spawned_notifier_process_is_reaped() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("exit 3");
        let reaper = spawn_reaped(command).unwrap();
        let status = reaper.join().unwrap().unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn test_spawn_missing_binary_is_an_error() {
        let command = Command::new("capturekeep-no-such-notifier-binary");
        assert!(spawn_reaped(command).is_err());
    }

    #[test]
    fn test_prune_missing_log_is_noop() {
        let dir = TempDir::new().unwrap();
        let removed = prune_log(&dir.path().join("absent.jsonl"), Utc::now()).unwrap();
        assert_eq!(removed, 0);
    }
}
