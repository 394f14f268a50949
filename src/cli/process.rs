//! Process command: run the worker pool against the queue

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::handler::HandlerRegistry;
use crate::pipeline::Pipeline;
use crate::processor::{QueueProcessor, RunSummary};
use crate::store::ContentStore;

pub fn run(config: &Config, pipeline: &Pipeline, once: bool, workers: Option<usize>) -> Result<()> {
    let requeued = pipeline.requeue_captured();
    if requeued.requeued > 0 {
        println!("Requeued {} captures that never reached the queue", requeued.requeued);
    }

    let store = Arc::new(
        ContentStore::open(&config.storage.content_db_path())
            .context("Failed to open content store")?,
    );
    // Built before the runtime starts: the HTTP fetcher is blocking
    let registry = Arc::new(HandlerRegistry::with_defaults(config, store));

    let mut processor = QueueProcessor::new(
        config,
        pipeline.queue().clone(),
        registry,
        pipeline.notifier().clone(),
    )
    .with_capture(pipeline.capture().clone());
    if let Some(n) = workers {
        processor = processor.with_workers(n);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let summary = if once {
        runtime.block_on(processor.run_once())
    } else {
        let (tx, rx) = watch::channel(false);
        runtime.spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupt received");
                    let _ = tx.send(true);
                }
                Err(e) => {
                    warn!("Cannot listen for interrupt: {}", e);
                    // keep the sender alive so the pool keeps running
                    std::future::pending::<()>().await;
                }
            }
        });
        println!("Processing queue (Ctrl-C to stop)...");
        runtime.block_on(processor.run(rx))
    };

    // handler threads still running past the grace period are abandoned here
    runtime.shutdown_timeout(Duration::from_secs(config.processor.shutdown_grace_secs));

    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("Processed: {}", summary.processed);
    println!("  completed: {} ({} already stored)", summary.completed, summary.skipped);
    println!("  retrying:  {}", summary.retried);
    println!("  failed:    {}", summary.failed);
    if summary.unrecorded > 0 {
        println!("  unrecorded: {}", summary.unrecorded);
    }
    if summary.reclaimed > 0 {
        println!("Reclaimed stale items: {}", summary.reclaimed);
    }
}
