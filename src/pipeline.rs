//! Capture → queue wiring
//!
//! A submission is captured first and only then enqueued. If the queue
//! cannot take it, the capture stays at `captured` and
//! [`Pipeline::requeue_captured`] picks it up later.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::capture::{BulletproofCapture, CaptureRecord, CaptureResult};
use crate::config::Config;
use crate::model::{CaptureStatus, UserContext};
use crate::notify::{FailureEvent, FailureNotifier};
use crate::queue::{NewItem, ProcessingQueue, QueueError};

#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub capture: CaptureResult,
    /// The capture is in the queue (newly added or already there)
    pub queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RequeueSummary {
    pub requeued: usize,
    pub already_queued: usize,
    pub errors: usize,
}

pub struct Pipeline {
    capture: Arc<BulletproofCapture>,
    queue: Arc<ProcessingQueue>,
    notifier: Arc<FailureNotifier>,
}

impl Pipeline {
    pub fn open(config: &Config) -> Result<Self, QueueError> {
        let notifier = Arc::new(FailureNotifier::new(config));
        let capture = Arc::new(BulletproofCapture::new(config, notifier.clone()));
        let queue = Arc::new(ProcessingQueue::open(config)?);
        Ok(Self::new(capture, queue, notifier))
    }

    pub fn new(
        capture: Arc<BulletproofCapture>,
        queue: Arc<ProcessingQueue>,
        notifier: Arc<FailureNotifier>,
    ) -> Self {
        Self {
            capture,
            queue,
            notifier,
        }
    }

    pub fn capture(&self) -> &Arc<BulletproofCapture> {
        &self.capture
    }

    pub fn queue(&self) -> &Arc<ProcessingQueue> {
        &self.queue
    }

    pub fn notifier(&self) -> &Arc<FailureNotifier> {
        &self.notifier
    }

    pub fn submit_url(&self, url: Option<&str>, user_context: UserContext) -> SubmitOutcome {
        self.submit(self.capture.capture_url(url, user_context))
    }

    pub fn submit_text(&self, text: Option<&str>, user_context: UserContext) -> SubmitOutcome {
        self.submit(self.capture.capture_text(text, user_context))
    }

    pub fn submit_file(&self, path: Option<&Path>, user_context: UserContext) -> SubmitOutcome {
        self.submit(self.capture.capture_file(path, user_context))
    }

    fn submit(&self, mut capture: CaptureResult) -> SubmitOutcome {
        let Some(record) = capture.metadata.clone() else {
            return SubmitOutcome {
                capture,
                queued: false,
                queue_error: None,
            };
        };

        match self.enqueue(&record) {
            Ok(queued) => {
                capture.metadata = Some(queued);
                SubmitOutcome {
                    capture,
                    queued: true,
                    queue_error: None,
                }
            }
            Err(e) => SubmitOutcome {
                capture,
                queued: false,
                queue_error: Some(e.to_string()),
            },
        }
    }

    /// Put a captured record on the queue and mark it `queued`.
    /// Returns the updated record.
    fn enqueue(&self, record: &CaptureRecord) -> Result<CaptureRecord, QueueError> {
        let mut item = NewItem::new(
            record.capture_id.as_str(),
            record.capture_type.as_str(),
            record.queue_source(),
        )
        .priority(record.user_context.priority.unwrap_or_default())
        .user_context(record.user_context.clone());
        if let Some(uid) = record.content_uid() {
            item = item.content_uid(uid.clone());
        }

        if let Err(e) = self.queue.add_to_queue(item) {
            warn!(capture_id = %record.capture_id, "Enqueue failed, capture kept: {}", e);
            self.notifier.notify(
                FailureEvent::new("enqueue_failed", e.to_string())
                    .capture_id(record.capture_id.as_str())
                    .source(record.capture_type.as_str()),
            );
            return Err(e);
        }

        match self
            .capture
            .update_status(&record.capture_id, CaptureStatus::Queued, None)
        {
            Ok(updated) => Ok(updated),
            Err(e) => {
                // the item is queued; only the capture record lags behind
                warn!(capture_id = %record.capture_id, "Capture status not updated: {}", e);
                Ok(record.clone())
            }
        }
    }

    /// Enqueue every capture still waiting at `captured`, oldest first
    pub fn requeue_captured(&self) -> RequeueSummary {
        let mut summary = RequeueSummary::default();
        for record in self.capture.list_by_status(CaptureStatus::Captured) {
            let already = self.queue.get_item(&record.capture_id).is_some();
            match self.enqueue(&record) {
                Ok(_) if already => summary.already_queued += 1,
                Ok(_) => summary.requeued += 1,
                Err(_) => summary.errors += 1,
            }
        }
        if summary.requeued > 0 || summary.errors > 0 {
            info!(
                requeued = summary.requeued,
                errors = summary.errors,
                "Requeued captured items"
            );
        }
        summary
    }
}
