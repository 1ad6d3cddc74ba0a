//! Admission control for inbound events.
//!
//! The receive loop only filters, extracts an [`IntakeRecord`], registers the
//! task in the in-flight map and spawns. Everything slow happens in the
//! supervised background task, bounded by a semaphore.

use crate::config::IntakeConfig;
use crate::error::IntakeError;
use crate::transport::{
    ChatKind, DocumentAttribute, EventSource, FileRef, InboundEvent, MediaPayload, SenderKind,
};
use crate::worker::{SubmissionProcessor, SubmissionSlot, WorkerOutcome};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Why an inbound event was not admitted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("message carries no media")]
    NoMedia,

    #[error("unsupported media kind: {0}")]
    UnsupportedMedia(String),

    #[error("message has no sender")]
    MissingSender,

    #[error("sender is not an individual user ({0:?})")]
    NotAUser(SenderKind),

    #[error("conversation is not a private chat ({0:?})")]
    NotPrivateChat(ChatKind),

    #[error("document MIME type is not a video: {0:?}")]
    UnsupportedMime(Option<String>),
}

impl RejectReason {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::NoMedia => "no_media",
            RejectReason::UnsupportedMedia(_) => "unsupported_media",
            RejectReason::MissingSender => "missing_sender",
            RejectReason::NotAUser(_) => "not_a_user",
            RejectReason::NotPrivateChat(_) => "not_private_chat",
            RejectReason::UnsupportedMime(_) => "unsupported_mime",
        }
    }
}

/// Normalized view of an admitted video message
#[derive(Debug, Clone)]
pub struct IntakeRecord {
    pub sender_id: i64,
    pub sender_name: String,
    pub sender_username: Option<String>,
    pub sender_phone: Option<String>,
    pub chat_id: i64,
    pub message_id: i64,
    pub file: FileRef,
    pub declared_size: u64,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub description: Option<String>,
    pub message_date: DateTime<Utc>,
}

impl IntakeRecord {
    pub fn volunteer_id(&self) -> String {
        self.sender_id.to_string()
    }

    pub fn size_mb(&self) -> f64 {
        self.declared_size as f64 / (1024.0 * 1024.0)
    }

    pub fn task_key(&self) -> TaskKey {
        TaskKey {
            sender_id: self.sender_id,
            message_id: self.message_id,
        }
    }
}

/// Apply the admission rules to one event
pub fn admit(event: &InboundEvent) -> Result<IntakeRecord, RejectReason> {
    let media = event.media.as_ref().ok_or(RejectReason::NoMedia)?;

    let sender = event.sender.as_ref().ok_or(RejectReason::MissingSender)?;
    if sender.kind != SenderKind::User {
        return Err(RejectReason::NotAUser(sender.kind));
    }

    if event.chat.kind != ChatKind::Private {
        return Err(RejectReason::NotPrivateChat(event.chat.kind));
    }

    let (file, declared_size, mime_type, file_name) = match media {
        MediaPayload::Document {
            mime_type,
            size,
            file,
            attributes,
        } => {
            if !is_video_document(mime_type.as_deref()) {
                return Err(RejectReason::UnsupportedMime(mime_type.clone()));
            }
            let file_name = attributes.iter().find_map(|attribute| match attribute {
                DocumentAttribute::FileName(name) => Some(name.clone()),
            });
            (file.clone(), *size, mime_type.clone(), file_name)
        }
        MediaPayload::InlineVideo {
            mime_type,
            size,
            file,
            file_name,
        } => (file.clone(), *size, mime_type.clone(), file_name.clone()),
        MediaPayload::Other(kind) => return Err(RejectReason::UnsupportedMedia(kind.clone())),
    };

    let description = event
        .caption
        .as_deref()
        .map(str::trim)
        .filter(|caption| !caption.is_empty())
        .map(String::from);

    Ok(IntakeRecord {
        sender_id: sender.id,
        sender_name: sender.display_name(),
        sender_username: sender.username.clone(),
        sender_phone: sender.phone.clone(),
        chat_id: event.chat.id,
        message_id: event.message_id,
        file,
        declared_size,
        mime_type,
        file_name,
        description,
        message_date: event.date,
    })
}

fn is_video_document(mime_type: Option<&str>) -> bool {
    match mime_type {
        Some(mime) => {
            let mime = mime.to_ascii_lowercase();
            mime.starts_with("video/") || mime == "application/octet-stream"
        }
        None => false,
    }
}

/// Identity of one unit of background work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub sender_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone)]
pub struct InFlightEntry {
    pub sender_name: String,
    pub declared_size: u64,
    pub started_at: Instant,
}

/// Advisory map of submissions currently being processed
#[derive(Debug, Default)]
pub struct InFlight {
    entries: Mutex<HashMap<TaskKey, InFlightEntry>>,
}

impl InFlight {
    pub fn insert(&self, key: TaskKey, entry: InFlightEntry) {
        self.entries.lock().insert(key, entry);
    }

    pub fn remove(&self, key: &TaskKey) -> Option<InFlightEntry> {
        self.entries.lock().remove(key)
    }

    pub fn snapshot(&self) -> Vec<(TaskKey, InFlightEntry)> {
        self.entries
            .lock()
            .iter()
            .map(|(key, entry)| (*key, entry.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert and return a guard that removes the entry when dropped
    pub fn track(self: &Arc<Self>, key: TaskKey, entry: InFlightEntry) -> InFlightGuard {
        self.insert(key, entry);
        InFlightGuard {
            registry: Arc::clone(self),
            key,
        }
    }
}

/// Removes its in-flight entry however the task ends
pub struct InFlightGuard {
    registry: Arc<InFlight>,
    key: TaskKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.key);
    }
}

/// Receives events, admits videos and supervises their processing
pub struct IntakeController {
    processor: Arc<dyn SubmissionProcessor>,
    in_flight: Arc<InFlight>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    poll_error_backoff: Duration,
    shutdown_grace: Duration,
}

impl IntakeController {
    pub fn new(processor: Arc<dyn SubmissionProcessor>, config: &IntakeConfig) -> Self {
        Self {
            processor,
            in_flight: Arc::new(InFlight::default()),
            permits: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            tracker: TaskTracker::new(),
            poll_error_backoff: Duration::from_secs(config.poll_error_backoff_secs),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        }
    }

    pub fn in_flight(&self) -> Vec<(TaskKey, InFlightEntry)> {
        self.in_flight.snapshot()
    }

    /// Poll the event source until shutdown is requested
    pub async fn run(&self, source: &dyn EventSource, shutdown: CancellationToken) {
        info!("Intake controller started");

        loop {
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = source.next_batch() => batch,
            };

            match batch {
                Ok(events) => {
                    for event in events {
                        // Rejections are already logged inside.
                        let _ = self.handle_event(event);
                    }
                }
                Err(e) => {
                    metrics::counter!("intake.poll.errors").increment(1);
                    warn!(
                        error = %e,
                        backoff_secs = self.poll_error_backoff.as_secs(),
                        "Failed to poll for events"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_error_backoff) => {}
                    }
                }
            }
        }

        info!("Intake controller stopped receiving events");
    }

    /// Admit one event and spawn its unit of work; never blocks on the work
    pub fn handle_event(&self, event: InboundEvent) -> Result<TaskKey, IntakeError> {
        let record = match admit(&event) {
            Ok(record) => record,
            Err(reason) => {
                metrics::counter!("intake.events.rejected", "reason" => reason.label())
                    .increment(1);
                let err = IntakeError::from(reason);
                debug!(
                    message_id = event.message_id,
                    chat_id = event.chat.id,
                    kind = err.kind(),
                    error = %err,
                    "Event not admitted"
                );
                return Err(err);
            }
        };

        metrics::counter!("intake.events.admitted").increment(1);
        info!(
            sender_id = record.sender_id,
            message_id = record.message_id,
            size_bytes = record.declared_size,
            mime_type = ?record.mime_type,
            "Video admitted"
        );

        let key = record.task_key();
        let guard = self.in_flight.track(
            key,
            InFlightEntry {
                sender_name: record.sender_name.clone(),
                declared_size: record.declared_size,
                started_at: Instant::now(),
            },
        );

        let processor = Arc::clone(&self.processor);
        let permits = Arc::clone(&self.permits);

        self.tracker.spawn(async move {
            let _guard = guard;

            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(message_id = record.message_id, "Worker pool closed, dropping video");
                    return;
                }
            };

            supervise(processor, record).await;
        });

        Ok(key)
    }

    /// Stop accepting work and wait for in-flight tasks up to the grace period.
    /// Returns false if tasks were still running when the grace period ended.
    pub async fn drain(&self) -> bool {
        self.tracker.close();
        let pending = self.in_flight.len();
        if pending > 0 {
            info!(pending = pending, "Waiting for in-flight submissions");
        }

        match tokio::time::timeout(self.shutdown_grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                for (key, entry) in self.in_flight.snapshot() {
                    warn!(
                        sender_id = key.sender_id,
                        message_id = key.message_id,
                        sender_name = %entry.sender_name,
                        elapsed_secs = entry.started_at.elapsed().as_secs(),
                        "Submission still running at shutdown"
                    );
                }
                false
            }
        }
    }
}

/// Run the worker in its own task so a panic is observed here, not lost
async fn supervise(processor: Arc<dyn SubmissionProcessor>, record: IntakeRecord) {
    let slot = SubmissionSlot::default();
    let started = Instant::now();

    let inner = {
        let processor = Arc::clone(&processor);
        let record = record.clone();
        let slot = slot.clone();
        tokio::spawn(async move { processor.process(&record, &slot).await })
    };

    match inner.await {
        Ok(outcome) => {
            metrics::histogram!("intake.submission.duration_seconds")
                .record(started.elapsed().as_secs_f64());
            match outcome {
                WorkerOutcome::Completed {
                    submission_id,
                    receipt,
                } => {
                    metrics::counter!("intake.submissions.completed").increment(1);
                    info!(
                        submission_id = %submission_id,
                        message_id = %receipt.message_id,
                        "Submission handed to processing"
                    );
                }
                WorkerOutcome::Duplicate { submission_id } => {
                    info!(submission_id = %submission_id, "Duplicate submission ignored");
                }
                WorkerOutcome::Failed(e) => {
                    metrics::counter!("intake.submissions.failed", "kind" => e.kind())
                        .increment(1);
                    error!(
                        sender_id = record.sender_id,
                        message_id = record.message_id,
                        kind = e.kind(),
                        error = %e,
                        "Submission failed"
                    );
                }
            }
        }
        Err(join_error) => {
            metrics::counter!("intake.submissions.failed", "kind" => "crashed").increment(1);
            let message = if join_error.is_panic() {
                panic_message(join_error.into_panic())
            } else {
                "worker task was cancelled".to_string()
            };
            error!(
                sender_id = record.sender_id,
                message_id = record.message_id,
                error = %message,
                "Submission worker crashed"
            );
            processor
                .recover_crash(&record, slot.get(), &message)
                .await;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}
