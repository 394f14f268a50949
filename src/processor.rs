//! Queue processor: a pool of async workers draining the processing queue
//!
//! Each worker claims an item, runs its handler on the blocking pool and
//! records the result on the queue. Queue and capture file I/O also runs on
//! the blocking pool, never on the async worker threads. A handler that errors or panics turns
//! into `mark_failed`; it never takes the worker down with it.
//!
//! On shutdown workers stop claiming. In-flight items get
//! `shutdown_grace_secs` to finish; anything still running after that stays
//! in `processing` and is reclaimed by the stale sweep on the next start.

use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::capture::BulletproofCapture;
use crate::config::{Config, ProcessorConfig};
use crate::handler::{HandlerInput, HandlerOutcome, HandlerRegistry};
use crate::model::CaptureStatus;
use crate::notify::FailureNotifier;
use crate::queue::{FailureDisposition, ProcessingQueue, QueueError, QueueItem};

/// What happened to one claimed item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed,
    /// Completed without work; content already existed
    Skipped,
    Retry,
    Failed,
    /// The queue refused or could not record the result
    Unrecorded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub processed: usize,
    pub completed: usize,
    pub skipped: usize,
    pub retried: usize,
    pub failed: usize,
    pub unrecorded: usize,
    pub reclaimed: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: ItemOutcome) {
        self.processed += 1;
        match outcome {
            ItemOutcome::Completed => self.completed += 1,
            ItemOutcome::Skipped => {
                self.completed += 1;
                self.skipped += 1;
            }
            ItemOutcome::Retry => self.retried += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Unrecorded => self.unrecorded += 1,
        }
    }

    fn merge(&mut self, other: RunSummary) {
        self.processed += other.processed;
        self.completed += other.completed;
        self.skipped += other.skipped;
        self.retried += other.retried;
        self.failed += other.failed;
        self.unrecorded += other.unrecorded;
        self.reclaimed += other.reclaimed;
    }
}

#[derive(Clone)]
pub struct QueueProcessor {
    queue: Arc<ProcessingQueue>,
    registry: Arc<HandlerRegistry>,
    notifier: Arc<FailureNotifier>,
    capture: Option<Arc<BulletproofCapture>>,
    settings: ProcessorConfig,
    stale_item_hours: f64,
}

impl QueueProcessor {
    pub fn new(
        config: &Config,
        queue: Arc<ProcessingQueue>,
        registry: Arc<HandlerRegistry>,
        notifier: Arc<FailureNotifier>,
    ) -> Self {
        Self {
            queue,
            registry,
            notifier,
            capture: None,
            settings: config.processor.clone(),
            stale_item_hours: config.queue.stale_item_hours,
        }
    }

    /// Keep capture records in step with their queue items
    pub fn with_capture(mut self, capture: Arc<BulletproofCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.settings.workers = workers.max(1);
        self
    }

    pub fn queue(&self) -> &Arc<ProcessingQueue> {
        &self.queue
    }

    /// Fail items orphaned in `processing` by an earlier run
    pub fn reclaim_stale(&self) -> usize {
        match self.queue.cleanup_stale_items(self.stale_item_hours) {
            Ok(ids) => {
                for id in &ids {
                    self.record_capture_status(id, CaptureStatus::Failed, Some("processing timed out"));
                }
                if !ids.is_empty() {
                    info!(count = ids.len(), "Reclaimed stale items");
                }
                ids.len()
            }
            Err(e) => {
                error!("Stale item sweep failed: {}", e);
                0
            }
        }
    }

    async fn reclaim_stale_off_runtime(&self) -> usize {
        let this = self.clone();
        off_runtime(move || this.reclaim_stale()).await.unwrap_or(0)
    }

    /// Drain every item that is ready right now, then return
    pub async fn run_once(&self) -> RunSummary {
        let mut summary = RunSummary {
            reclaimed: self.reclaim_stale_off_runtime().await,
            ..Default::default()
        };

        let mut workers = JoinSet::new();
        for n in 0..self.settings.workers {
            let this = self.clone();
            let worker_id = self.worker_id(n);
            workers.spawn(async move { this.drain(&worker_id).await });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(partial) => summary.merge(partial),
                Err(e) => error!("Worker task failed: {}", e),
            }
        }

        info!(
            processed = summary.processed,
            completed = summary.completed,
            retried = summary.retried,
            failed = summary.failed,
            "Queue drained"
        );
        summary
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped)
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> RunSummary {
        let mut summary = RunSummary {
            reclaimed: self.reclaim_stale_off_runtime().await,
            ..Default::default()
        };

        let mut workers = JoinSet::new();
        for n in 0..self.settings.workers {
            let this = self.clone();
            let worker_id = self.worker_id(n);
            let rx = shutdown.clone();
            workers.spawn(async move { this.poll_loop(worker_id, rx).await });
        }
        info!(workers = self.settings.workers, "Processor started");

        let mut signal = shutdown;
        wait_for_shutdown(&mut signal).await;
        info!(
            grace_secs = self.settings.shutdown_grace_secs,
            "Shutdown requested, draining in-flight items"
        );

        let deadline = tokio::time::Instant::now()
            .checked_add(Duration::from_secs(self.settings.shutdown_grace_secs));
        loop {
            let joined = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, workers.join_next()).await,
                None => Ok(workers.join_next().await),
            };
            match joined {
                Ok(Some(Ok(partial))) => summary.merge(partial),
                Ok(Some(Err(e))) => error!("Worker task failed: {}", e),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = workers.len(),
                        "Grace period elapsed; in-flight items left for the stale sweep"
                    );
                    workers.abort_all();
                    break;
                }
            }
        }

        info!(processed = summary.processed, "Processor stopped");
        summary
    }

    fn worker_id(&self, n: usize) -> String {
        format!("{}-{}-{}", self.settings.processor_id, std::process::id(), n)
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<QueueItem>, QueueError> {
        let queue = self.queue.clone();
        let item_types = self.settings.item_types.clone();
        let worker_id = worker_id.to_string();
        off_runtime(move || queue.get_next_item(item_types.as_deref(), &worker_id))
            .await
            .unwrap_or(Ok(None))
    }

    async fn drain(&self, worker_id: &str) -> RunSummary {
        let mut summary = RunSummary::default();
        loop {
            match self.claim(worker_id).await {
                Ok(Some(item)) => summary.record(self.process_item(item).await),
                Ok(None) => break,
                Err(e) => {
                    error!(worker = worker_id, "Claim failed: {}", e);
                    break;
                }
            }
        }
        summary
    }

    async fn poll_loop(&self, worker_id: String, mut shutdown: watch::Receiver<bool>) -> RunSummary {
        let mut summary = RunSummary::default();
        let poll = Duration::from_millis(self.settings.poll_interval_ms);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.claim(&worker_id).await {
                Ok(Some(item)) => {
                    summary.record(self.process_item(item).await);
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(worker = %worker_id, "Claim failed: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(worker = %worker_id, processed = summary.processed, "Worker exiting");
        summary
    }

    /// Run the handler for one claimed item and record the result
    pub async fn process_item(&self, item: QueueItem) -> ItemOutcome {
        let capture_id = item.capture_id.clone();
        let item_type = item.item_type.clone();
        self.set_capture_status(&capture_id, CaptureStatus::Processing, None)
            .await;

        let registry = self.registry.clone();
        let input = HandlerInput::from_item(&item);
        let outcome = match tokio::task::spawn_blocking(move || registry.dispatch(&input)).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(capture_id = %capture_id, "Handler panicked: {}", message);
                HandlerOutcome::failed(format!("handler panicked: {}", message))
            }
            Err(e) => HandlerOutcome::failed(format!("handler task cancelled: {}", e)),
        };

        if outcome.success {
            let queue = self.queue.clone();
            let id = capture_id.clone();
            let paths = outcome.result_paths;
            return match off_runtime(move || queue.mark_complete(&id, paths)).await {
                Some(Ok(true)) => {
                    self.set_capture_status(&capture_id, CaptureStatus::Completed, None)
                        .await;
                    if outcome.skipped {
                        ItemOutcome::Skipped
                    } else {
                        ItemOutcome::Completed
                    }
                }
                Some(Ok(false)) | None => ItemOutcome::Unrecorded,
                Some(Err(e)) => {
                    error!(capture_id = %capture_id, "Failed to record completion: {}", e);
                    ItemOutcome::Unrecorded
                }
            };
        }

        let error = outcome
            .error
            .unwrap_or_else(|| "handler reported failure".to_string());

        let disposition = {
            let queue = self.queue.clone();
            let id = capture_id.clone();
            let error = error.clone();
            off_runtime(move || queue.mark_failed(&id, &error)).await
        };

        match disposition {
            Some(Ok(FailureDisposition::Retry { .. })) => {
                self.notify_failure(&capture_id, &item_type, &error, false).await;
                self.set_capture_status(&capture_id, CaptureStatus::Queued, Some(&error))
                    .await;
                ItemOutcome::Retry
            }
            Some(Ok(FailureDisposition::Failed { .. })) => {
                self.notify_failure(&capture_id, &item_type, &error, true).await;
                self.set_capture_status(&capture_id, CaptureStatus::Failed, Some(&error))
                    .await;
                ItemOutcome::Failed
            }
            Some(Ok(FailureDisposition::Ignored)) | None => ItemOutcome::Unrecorded,
            Some(Err(e)) => {
                error!(capture_id = %capture_id, "Failed to record failure: {}", e);
                ItemOutcome::Unrecorded
            }
        }
    }

    async fn notify_failure(&self, capture_id: &str, item_type: &str, error: &str, terminal: bool) {
        let notifier = self.notifier.clone();
        let (capture_id, item_type, error) =
            (capture_id.to_string(), item_type.to_string(), error.to_string());
        off_runtime(move || notifier.processing_failed(&capture_id, &item_type, &error, terminal))
            .await;
    }

    async fn set_capture_status(&self, capture_id: &str, status: CaptureStatus, error: Option<&str>) {
        if self.capture.is_none() {
            return;
        }
        let this = self.clone();
        let capture_id = capture_id.to_string();
        let error = error.map(str::to_string);
        off_runtime(move || this.record_capture_status(&capture_id, status, error.as_deref())).await;
    }

    /// Best-effort; items queued by hand have no capture record
    fn record_capture_status(&self, capture_id: &str, status: CaptureStatus, error: Option<&str>) {
        let Some(capture) = &self.capture else {
            return;
        };
        if let Err(e) = capture.update_status(capture_id, status, error) {
            debug!(capture_id, "Capture status not updated: {}", e);
        }
    }
}

/// Run blocking queue, capture or log I/O on the blocking pool
async fn off_runtime<T, F>(f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => Some(value),
        Err(e) => {
            error!("Blocking queue task failed: {}", e);
            None
        }
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::IngestionHandler;
    use crate::model::UserContext;
    use crate::queue::{ItemStatus, NewItem};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Scripted;

    impl IngestionHandler for Scripted {
        fn id(&self) -> &str {
            "scripted"
        }

        fn item_types(&self) -> &[&str] {
            &["url", "text"]
        }

        fn handle(&self, input: &HandlerInput) -> anyhow::Result<HandlerOutcome> {
            match input.source.as_str() {
                "fail" => anyhow::bail!("upstream returned 503"),
                "panic" => panic!("parser bug"),
                "slow" => {
                    std::thread::sleep(Duration::from_millis(200));
                    Ok(HandlerOutcome::completed(BTreeMap::new()))
                }
                "stuck" => {
                    std::thread::sleep(Duration::from_millis(1500));
                    Ok(HandlerOutcome::completed(BTreeMap::new()))
                }
                source => {
                    let mut paths = BTreeMap::new();
                    paths.insert("content".to_string(), format!("/content/{}.md", source));
                    Ok(HandlerOutcome::completed(paths))
                }
            }
        }
    }

    fn setup(dir: &TempDir) -> (Config, QueueProcessor) {
        let mut config = Config::with_root(dir.path());
        config.notifier.desktop = false;
        config.notifier.console = false;
        config.processor.poll_interval_ms = 10;
        config.processor.shutdown_grace_secs = 5;
        config.queue.base_delay_secs = 3600;
        config.queue.max_delay_secs = 3600;

        let queue = Arc::new(ProcessingQueue::open(&config).unwrap());
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(Scripted));
        let notifier = Arc::new(FailureNotifier::new(&config));
        let processor = QueueProcessor::new(&config, queue, Arc::new(registry), notifier);
        (config, processor)
    }

    fn enqueue(processor: &QueueProcessor, id: &str, item_type: &str, source: &str) {
        processor
            .queue()
            .add_to_queue(
                NewItem::new(id, item_type, source).user_context(UserContext::default()),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_once_records_every_outcome() {
        let dir = TempDir::new().unwrap();
        let (config, processor) = setup(&dir);
        enqueue(&processor, "ok", "url", "article");
        enqueue(&processor, "err", "url", "fail");
        enqueue(&processor, "boom", "text", "panic");
        enqueue(&processor, "odd", "video", "x");

        let summary = processor.run_once().await;
        assert_eq!(summary.processed, 4);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.retried, 3);

        let queue = processor.queue();
        let ok = queue.get_item("ok").unwrap();
        assert_eq!(ok.status, ItemStatus::Completed);
        assert_eq!(ok.result_paths["content"], "/content/article.md");

        let err = queue.get_item("err").unwrap();
        assert_eq!(err.status, ItemStatus::Retry);
        assert!(err.last_error.unwrap().contains("503"));

        let boom = queue.get_item("boom").unwrap();
        assert_eq!(boom.status, ItemStatus::Retry);
        assert!(boom.last_error.unwrap().contains("parser bug"));

        let odd = queue.get_item("odd").unwrap();
        assert!(odd.last_error.unwrap().contains("no handler"));

        // every failure reached the failure log
        let notifier = FailureNotifier::new(&config);
        assert_eq!(notifier.recent_failures(10).len(), 3);
    }

    #[tokio::test]
    async fn test_terminal_failure_after_retries() {
        let dir = TempDir::new().unwrap();
        let (mut config, _) = setup(&dir);
        config.queue.max_retry_attempts = 1;
        let queue = Arc::new(ProcessingQueue::open(&config).unwrap());
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(Scripted));
        let notifier = Arc::new(FailureNotifier::new(&config));
        let processor =
            QueueProcessor::new(&config, queue.clone(), Arc::new(registry), notifier.clone());

        enqueue(&processor, "err", "url", "fail");
        let summary = processor.run_once().await;
        assert_eq!(summary.failed, 1);
        assert_eq!(queue.get_item("err").unwrap().status, ItemStatus::Failed);

        let events = notifier.recent_failures(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "processing_failed");
    }

    #[tokio::test]
    async fn test_stale_items_reclaimed_on_start() {
        let dir = TempDir::new().unwrap();
        let (mut config, _) = setup(&dir);
        config.queue.stale_item_hours = 0.0;
        let queue = Arc::new(ProcessingQueue::open(&config).unwrap());
        queue
            .add_to_queue(NewItem::new("orphan", "url", "article"))
            .unwrap();
        queue.get_next_item(None, "crashed-worker").unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let processor = QueueProcessor::new(
            &config,
            queue.clone(),
            Arc::new(HandlerRegistry::new()),
            Arc::new(FailureNotifier::new(&config)),
        );
        let summary = processor.run_once().await;
        assert_eq!(summary.reclaimed, 1);
        assert_eq!(summary.processed, 0);
        assert_eq!(queue.get_item("orphan").unwrap().status, ItemStatus::Failed);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let (_config, processor) = setup(&dir);
        let processor = processor.with_workers(2);
        let (tx, rx) = watch::channel(false);

        let runner = processor.clone();
        let handle = tokio::spawn(async move { runner.run(rx).await });

        enqueue(&processor, "a", "url", "one");
        enqueue(&processor, "b", "text", "slow");

        let queue = processor.queue().clone();
        for _ in 0..200 {
            let status = queue.get_queue_status();
            if status.count(ItemStatus::Completed) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        let summary = handle.await.unwrap();
        assert_eq!(summary.completed, 2);
        assert_eq!(queue.get_item("b").unwrap().status, ItemStatus::Completed);
    }

    #[tokio::test]
    async fn test_grace_period_exceeded_leaves_item_for_stale_sweep() {
        let dir = TempDir::new().unwrap();
        let (mut config, _) = setup(&dir);
        config.processor.shutdown_grace_secs = 0;
        config.queue.stale_item_hours = 0.0;
        let queue = Arc::new(ProcessingQueue::open(&config).unwrap());
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(Scripted));
        let processor = QueueProcessor::new(
            &config,
            queue.clone(),
            Arc::new(registry),
            Arc::new(FailureNotifier::new(&config)),
        );

        let (tx, rx) = watch::channel(false);
        let runner = processor.clone();
        let handle = tokio::spawn(async move { runner.run(rx).await });

        enqueue(&processor, "long", "url", "stuck");
        for _ in 0..200 {
            if queue.get_item("long").unwrap().status == ItemStatus::Processing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(queue.get_item("long").unwrap().status, ItemStatus::Processing);

        tx.send(true).unwrap();
        let summary = handle.await.unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(queue.get_item("long").unwrap().status, ItemStatus::Processing);

        // the handler finishing later must not record anything
        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert_eq!(queue.get_item("long").unwrap().status, ItemStatus::Processing);

        assert_eq!(processor.reclaim_stale(), 1);
        let item = queue.get_item("long").unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert!(item.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_queue_io_runs_off_the_runtime_thread() {
        let runtime_thread = std::thread::current().id();
        let io_thread = off_runtime(|| std::thread::current().id()).await.unwrap();
        assert_ne!(io_thread, runtime_thread);

        assert_eq!(off_runtime(|| -> u8 { panic!("queue bug") }).await, None);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42)), "unknown panic");
    }
}
