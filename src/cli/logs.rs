//! Failure log commands

use anyhow::Result;

use crate::notify::FailureNotifier;

pub fn failures(notifier: &FailureNotifier, limit: usize) -> Result<()> {
    let events = notifier.recent_failures(limit);
    if events.is_empty() {
        println!("No failures logged.");
        return Ok(());
    }

    for event in events {
        println!(
            "{} {:<18} {:<30} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.event,
            event.capture_id.as_deref().unwrap_or("-"),
            event.error
        );
    }
    Ok(())
}

pub fn cleanup(notifier: &FailureNotifier, retention_days: i64) -> Result<()> {
    let removed = notifier.cleanup_old_entries(retention_days);
    println!(
        "Removed {} log entries older than {} days",
        removed, retention_days
    );
    Ok(())
}
