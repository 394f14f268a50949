//! Capture command implementation

use anyhow::{bail, Result};
use std::path::Path;

use crate::capture::{BulletproofCapture, CaptureLookup, CaptureRecord};
use crate::model::UserContext;
use crate::pipeline::{Pipeline, SubmitOutcome};

pub fn url(pipeline: &Pipeline, url: &str, ctx: UserContext, json: bool) -> Result<()> {
    report(pipeline.submit_url(Some(url), ctx), json)
}

pub fn text(pipeline: &Pipeline, text: &str, ctx: UserContext, json: bool) -> Result<()> {
    report(pipeline.submit_text(Some(text), ctx), json)
}

pub fn file(pipeline: &Pipeline, path: &Path, ctx: UserContext, json: bool) -> Result<()> {
    report(pipeline.submit_file(Some(path), ctx), json)
}

fn report(outcome: SubmitOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else if outcome.capture.success {
        println!("✓ Captured {}", outcome.capture.capture_id);
        if let Some(parsed) = outcome
            .capture
            .metadata
            .as_ref()
            .and_then(|m| m.parsed_url.as_ref())
        {
            println!("  canonical: {}", parsed.canonical);
            println!("  uid:       {}", parsed.content_uid);
        }
        match &outcome.queue_error {
            None => println!("  queued for processing"),
            Some(e) => println!("  not queued yet ({}); will be retried", e),
        }
    }

    if !outcome.capture.success {
        bail!(
            "capture {} failed: {}",
            outcome.capture.capture_id,
            outcome.capture.error.unwrap_or_default()
        );
    }
    Ok(())
}

pub fn status(capture: &BulletproofCapture, capture_id: &str, json: bool) -> Result<()> {
    match capture.get_capture_status(capture_id) {
        CaptureLookup::Found(record) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_record(&record);
            }
            Ok(())
        }
        CaptureLookup::NotFound { capture_id } => bail!("Capture not found: {}", capture_id),
        CaptureLookup::Unreadable { capture_id, error } => {
            bail!("Capture {} metadata unreadable: {}", capture_id, error)
        }
    }
}

fn print_record(record: &CaptureRecord) {
    println!("Capture:   {}", record.capture_id);
    println!("Type:      {}", record.capture_type);
    println!("Status:    {}", record.status);
    println!("Captured:  {}", record.capture_timestamp.to_rfc3339());
    if let Some(url) = &record.url {
        println!("URL:       {}", url);
    }
    if let Some(parsed) = &record.parsed_url {
        println!("Canonical: {}", parsed.canonical);
        println!("UID:       {}", parsed.content_uid);
    }
    if let Some(name) = &record.filename {
        println!("File:      {} ({} bytes)", name, record.file_size.unwrap_or(0));
    }
    if let Some(len) = record.text_length {
        println!("Text:      {} chars", len);
    }
    println!("Payload:   {}", record.captured_path.display());
    if let Some(err) = &record.last_error {
        println!("Error:     {}", err);
    }
}

pub fn list(capture: &BulletproofCapture, limit: usize) -> Result<()> {
    let records = capture.list_captured_items(limit);
    if records.is_empty() {
        println!("No captures found.");
        return Ok(());
    }

    println!("{:<30} {:<6} {:<11} {}", "Capture", "Type", "Status", "Source");
    println!("{}", "-".repeat(90));
    for record in records {
        let source = match (&record.url, &record.filename) {
            (Some(url), _) => url.clone(),
            (None, Some(name)) => name.clone(),
            _ => record.captured_path.display().to_string(),
        };
        println!(
            "{:<30} {:<6} {:<11} {}",
            record.capture_id, record.capture_type, record.status, source
        );
    }
    Ok(())
}
