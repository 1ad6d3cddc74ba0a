//! The unit of work run for each admitted video.
//!
//! Sequence: register the sender, create or resume the submission, stream the
//! file into storage, mark it for review, dispatch it and tell the user. A
//! failure after the submission exists marks it FAILED with the error text.

use crate::dispatch::{DispatchReceipt, Dispatcher, ProcessingJob};
use crate::error::IntakeError;
use crate::intake::IntakeRecord;
use crate::notifier::{Notice, Notifier};
use crate::s3_uploader::{StreamingUploader, UploadRequest};
use crate::submission_store::{
    StoreError, SubmissionOutcome, SubmissionStatus, SubmissionStore, VolunteerRegistration,
};
use crate::transport::MediaSource;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Attempts made to record a FAILED status before giving up
const FAILURE_WRITE_ATTEMPTS: u32 = 3;

/// Base delay between attempts, multiplied by the attempt number
const FAILURE_WRITE_BACKOFF: Duration = Duration::from_millis(100);

/// Shared cell holding the submission id once one exists, so a supervisor
/// can still mark it FAILED if the worker panics
#[derive(Debug, Clone, Default)]
pub struct SubmissionSlot(Arc<Mutex<Option<Uuid>>>);

impl SubmissionSlot {
    pub fn set(&self, submission_id: Uuid) {
        *self.0.lock() = Some(submission_id);
    }

    pub fn get(&self) -> Option<Uuid> {
        *self.0.lock()
    }
}

/// How a unit of work ended
#[derive(Debug)]
pub enum WorkerOutcome {
    Completed {
        submission_id: Uuid,
        receipt: DispatchReceipt,
    },
    Duplicate {
        submission_id: Uuid,
    },
    Failed(IntakeError),
}

/// Work run by the intake controller for each admitted record
#[async_trait]
pub trait SubmissionProcessor: Send + Sync {
    async fn process(&self, record: &IntakeRecord, slot: &SubmissionSlot) -> WorkerOutcome;

    /// Called once when `process` panicked
    async fn recover_crash(&self, record: &IntakeRecord, submission_id: Option<Uuid>, message: &str);
}

pub struct SubmissionWorker {
    store: Arc<dyn SubmissionStore>,
    uploader: StreamingUploader,
    media: Arc<dyn MediaSource>,
    dispatcher: Arc<dyn Dispatcher>,
    notifier: Arc<dyn Notifier>,
}

impl SubmissionWorker {
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        uploader: StreamingUploader,
        media: Arc<dyn MediaSource>,
        dispatcher: Arc<dyn Dispatcher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            uploader,
            media,
            dispatcher,
            notifier,
        }
    }

    /// Register unknown senders and refresh contact details of known ones.
    /// Returns the first name when the sender was newly registered.
    async fn ensure_volunteer(&self, record: &IntakeRecord) -> Result<Option<String>, StoreError> {
        let volunteer_id = record.volunteer_id();
        let registration = VolunteerRegistration::from_display_name(
            volunteer_id.as_str(),
            &record.sender_name,
            record.sender_username.clone(),
            record.sender_phone.clone(),
        );

        match self.store.find_volunteer(&volunteer_id).await? {
            Some(existing) => {
                let phone_changed = registration.phone.is_some()
                    && registration.phone != existing.phone_number;
                let username_changed = registration.username.is_some()
                    && registration.username != existing.username;

                if phone_changed || username_changed {
                    self.store.register_or_update_volunteer(&registration).await?;
                    info!(volunteer_id = %volunteer_id, "Volunteer contact details updated");
                }
                Ok(None)
            }
            None => {
                self.store.register_or_update_volunteer(&registration).await?;
                metrics::counter!("intake.volunteers.registered").increment(1);
                info!(volunteer_id = %volunteer_id, "Auto-registered new volunteer");
                Ok(Some(registration.first_name))
            }
        }
    }

    /// Everything after the submission row exists
    async fn deliver(
        &self,
        record: &IntakeRecord,
        submission_id: Uuid,
    ) -> Result<DispatchReceipt, IntakeError> {
        let stream = self.media.open_stream(&record.file).await?;

        let request = UploadRequest {
            submission_id,
            volunteer_id: record.volunteer_id(),
            file_name: record.file_name.clone(),
            mime_type: record.mime_type.clone(),
            declared_size: record.declared_size,
            sender_name: record.sender_name.clone(),
            sender_phone: record.sender_phone.clone(),
        };
        let stored = self.uploader.upload_stream(&request, stream).await?;

        self.store
            .update_status(submission_id, SubmissionStatus::PendingReview, None)
            .await?;

        let job = ProcessingJob {
            submission_id,
            volunteer_id: record.volunteer_id(),
            s3_key: stored.key,
            bucket: stored.bucket,
            title: submission_title(record),
            description: record.description.clone(),
            sender_name: record.sender_name.clone(),
            sender_phone: record.sender_phone.clone(),
            timestamp: Utc::now(),
            source: self.uploader.source_tag().to_string(),
        };

        match self.dispatcher.dispatch(&job).await {
            Ok(receipt) => {
                metrics::counter!("intake.dispatch.succeeded").increment(1);
                Ok(receipt)
            }
            Err(e) => {
                metrics::counter!("intake.dispatch.failed").increment(1);
                Err(e.into())
            }
        }
    }

    /// Persist the failure and tell the user which step broke
    async fn fail(&self, chat_id: i64, submission_id: Uuid, err: &IntakeError) {
        self.record_failure(submission_id, err).await;

        let notice = match err {
            IntakeError::Transport(_) => Notice::DownloadFailed,
            IntakeError::Upload(_) => Notice::UploadFailed,
            IntakeError::Dispatch(_) => Notice::DispatchFailed,
            IntakeError::DataAccess(_) => Notice::DatabaseError,
            _ => Notice::UnexpectedError,
        };
        self.notifier.send(chat_id, notice).await;
    }

    /// Write FAILED with a short retry. A row left in PROCESSING or
    /// PENDING_REVIEW blocks resubmission of the file, so exhausting the
    /// attempts is logged for manual reconciliation.
    async fn record_failure(&self, submission_id: Uuid, err: &IntakeError) -> bool {
        let reason = err.to_string();
        let mut attempt = 1;
        loop {
            match self
                .store
                .update_status(submission_id, SubmissionStatus::Failed, Some(&reason))
                .await
            {
                Ok(()) => return true,
                Err(e) if attempt < FAILURE_WRITE_ATTEMPTS => {
                    warn!(
                        submission_id = %submission_id,
                        attempt = attempt,
                        error = %e,
                        "Failed to mark submission as failed, retrying"
                    );
                    tokio::time::sleep(FAILURE_WRITE_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    metrics::counter!("intake.submissions.unreconciled").increment(1);
                    error!(
                        submission_id = %submission_id,
                        pipeline_error = err.kind(),
                        error = %e,
                        "Submission left in a non-terminal status, needs manual reconciliation"
                    );
                    return false;
                }
            }
        }
    }
}

#[async_trait]
impl SubmissionProcessor for SubmissionWorker {
    #[instrument(
        skip(self, record, slot),
        fields(sender_id = record.sender_id, message_id = record.message_id)
    )]
    async fn process(&self, record: &IntakeRecord, slot: &SubmissionSlot) -> WorkerOutcome {
        let chat_id = record.chat_id;

        self.notifier
            .send(
                chat_id,
                Notice::Received {
                    size_mb: record.size_mb(),
                },
            )
            .await;

        match self.ensure_volunteer(record).await {
            Ok(Some(first_name)) => {
                self.notifier
                    .send(chat_id, Notice::Welcome { name: first_name })
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "Volunteer registration failed");
                self.notifier.send(chat_id, Notice::RegistrationFailed).await;
                return WorkerOutcome::Failed(e.into());
            }
        }

        let outcome = match self
            .store
            .create_or_resume_submission(
                &record.volunteer_id(),
                &record.file.unique_id,
                record.description.as_deref(),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Failed to create submission");
                self.notifier.send(chat_id, Notice::DatabaseError).await;
                return WorkerOutcome::Failed(e.into());
            }
        };

        let submission_id = match outcome {
            SubmissionOutcome::Created(id) => {
                metrics::counter!("intake.submissions.created").increment(1);
                id
            }
            SubmissionOutcome::Resumed(id) => {
                metrics::counter!("intake.submissions.resumed").increment(1);
                id
            }
            SubmissionOutcome::Duplicate { id, status } => {
                metrics::counter!("intake.submissions.duplicate").increment(1);
                info!(submission_id = %id, status = %status, "File already submitted");
                self.notifier.send(chat_id, Notice::AlreadySubmitted).await;
                return WorkerOutcome::Duplicate { submission_id: id };
            }
        };
        slot.set(submission_id);

        match self.deliver(record, submission_id).await {
            Ok(receipt) => {
                self.notifier
                    .send(
                        chat_id,
                        Notice::ProcessingStarted {
                            size_mb: record.size_mb(),
                            submission_id,
                        },
                    )
                    .await;
                WorkerOutcome::Completed {
                    submission_id,
                    receipt,
                }
            }
            Err(e) => {
                self.fail(chat_id, submission_id, &e).await;
                WorkerOutcome::Failed(e)
            }
        }
    }

    async fn recover_crash(&self, record: &IntakeRecord, submission_id: Option<Uuid>, message: &str) {
        if let Some(submission_id) = submission_id {
            let reason = format!("worker crashed: {}", message);
            if let Err(e) = self
                .store
                .update_status(submission_id, SubmissionStatus::Failed, Some(&reason))
                .await
            {
                warn!(
                    submission_id = %submission_id,
                    error = %e,
                    "Failed to mark crashed submission as failed"
                );
            }
        }
        self.notifier
            .send(record.chat_id, Notice::UnexpectedError)
            .await;
    }
}

/// Title shown to reviewers; falls back to the volunteer id for nameless senders
fn submission_title(record: &IntakeRecord) -> String {
    let who = if record.sender_name.is_empty() {
        record.volunteer_id()
    } else {
        record.sender_name.clone()
    };
    format!("Telegram Submission from {}", who)
}
