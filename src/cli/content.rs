//! Content store and canonicalization commands

use anyhow::Result;

use crate::canonical::{canonicalize, ContentUid};
use crate::store::ContentStore;

pub fn canonical(url: &str) -> Result<()> {
    let canonical = canonicalize(url);
    println!("{}", canonical);
    println!("uid: {}", ContentUid::from_canonical(&canonical));
    Ok(())
}

pub fn list(store: &ContentStore, limit: usize) -> Result<()> {
    let items = store.list(limit)?;
    if items.is_empty() {
        println!("No content stored yet. Run 'capturekeep process' first.");
        return Ok(());
    }

    println!("{:<17} {:<6} {:<10} {:<17} {}", "UID", "Type", "Status", "Updated", "Title");
    println!("{}", "-".repeat(100));
    for item in items {
        let title = item
            .title
            .as_deref()
            .or(item.canonical_url.as_deref())
            .map(|t| {
                if t.chars().count() > 45 {
                    format!("{}...", t.chars().take(42).collect::<String>())
                } else {
                    t.to_string()
                }
            })
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<17} {:<6} {:<10} {:<17} {}",
            item.uid,
            item.item_type,
            item.status,
            item.updated_at.format("%Y-%m-%d %H:%M"),
            title
        );
    }

    let counts = store.count_by_status()?;
    let summary: Vec<String> = counts.iter().map(|(k, v)| format!("{} {}", v, k)).collect();
    println!("\n{}", summary.join(", "));
    Ok(())
}
