//! Queue command implementation: thin wrappers over `ProcessingQueue`

use anyhow::{anyhow, bail, Result};
use std::collections::BTreeMap;

use crate::model::{Priority, UserContext};
use crate::queue::{FailureDisposition, NewItem, ProcessingQueue};

pub fn add(
    queue: &ProcessingQueue,
    capture_id: String,
    item_type: String,
    source: String,
    priority: Priority,
) -> Result<()> {
    let item = NewItem::new(capture_id.as_str(), item_type, source)
        .priority(priority)
        .user_context(UserContext::default().with_priority(priority));
    if queue.add_to_queue(item)? {
        println!("Queued {} ({})", capture_id, priority);
    } else {
        println!("{} is already in the queue", capture_id);
    }
    Ok(())
}

pub fn next(queue: &ProcessingQueue, item_types: Vec<String>, processor_id: &str) -> Result<()> {
    let types = (!item_types.is_empty()).then_some(item_types);
    match queue.get_next_item(types.as_deref(), processor_id)? {
        Some(item) => println!("{}", serde_json::to_string_pretty(&item)?),
        None => println!("No items ready."),
    }
    Ok(())
}

pub fn complete(queue: &ProcessingQueue, capture_id: &str, results: Vec<String>) -> Result<()> {
    let result_paths = parse_results(&results)?;
    if !queue.mark_complete(capture_id, result_paths)? {
        bail!("{} is not being processed", capture_id);
    }
    println!("Completed {}", capture_id);
    Ok(())
}

pub fn fail(queue: &ProcessingQueue, capture_id: &str, error: &str) -> Result<()> {
    match queue.mark_failed(capture_id, error)? {
        FailureDisposition::Retry {
            attempts,
            next_retry_time,
        } => println!(
            "{} will retry after attempt {} at {}",
            capture_id,
            attempts,
            next_retry_time.to_rfc3339()
        ),
        FailureDisposition::Failed { attempts } => {
            println!("{} failed permanently after {} attempts", capture_id, attempts)
        }
        FailureDisposition::Ignored => bail!("{} is not being processed", capture_id),
    }
    Ok(())
}

pub fn status(queue: &ProcessingQueue, json: bool) -> Result<()> {
    let status = queue.get_queue_status();
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Queue: {} ({} items, {} ready)", queue.path().display(), status.total, status.ready);
    println!();
    println!("By status:");
    for (name, count) in &status.by_status {
        println!("  {:<12} {}", name, count);
    }
    println!("By priority:");
    for (name, count) in &status.by_priority {
        println!("  {:<12} {}", name, count);
    }
    println!("By type:");
    for (name, count) in &status.by_type {
        println!("  {:<12} {}", name, count);
    }
    if let Some(oldest) = status.oldest_pending {
        println!("Oldest pending: {}", oldest.to_rfc3339());
    }
    if !status.stuck_items.is_empty() {
        println!();
        println!("⚠️  Stuck items:");
        for stuck in &status.stuck_items {
            println!(
                "  {} ({}) {} min on {}",
                stuck.capture_id,
                stuck.item_type,
                stuck.minutes_processing,
                stuck.processor_id.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}

pub fn cleanup(queue: &ProcessingQueue, max_age_hours: f64) -> Result<()> {
    let reclaimed = queue.cleanup_stale_items(max_age_hours)?;
    if reclaimed.is_empty() {
        println!("No stale items.");
    } else {
        println!("Reclaimed {} stale items:", reclaimed.len());
        for id in reclaimed {
            println!("  {}", id);
        }
    }
    Ok(())
}

pub fn abandon(queue: &ProcessingQueue, capture_id: &str, reason: &str) -> Result<()> {
    if !queue.abandon(capture_id, reason)? {
        bail!("{} is not pending or waiting to retry", capture_id);
    }
    println!("Abandoned {}", capture_id);
    Ok(())
}

/// `KIND=PATH` pairs
fn parse_results(results: &[String]) -> Result<BTreeMap<String, String>> {
    results
        .iter()
        .map(|r| {
            let (kind, path) = r
                .split_once('=')
                .ok_or_else(|| anyhow!("expected KIND=PATH, got '{}'", r))?;
            Ok((kind.trim().to_string(), path.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_results() {
        let parsed = parse_results(&["content=/a.md".to_string(), "html = /a.html".to_string()])
            .unwrap();
        assert_eq!(parsed["content"], "/a.md");
        assert_eq!(parsed["html"], "/a.html");
        assert!(parse_results(&["nope".to_string()]).is_err());
    }
}
