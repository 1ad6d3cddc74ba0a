//! In-memory fakes shared by the unit tests.

use crate::notifier::{NoticeKind, Notifier};
use crate::s3_uploader::{CompletedPartRef, MultipartTarget, UploadError};
use crate::submission_store::{
    StoreError, SubmissionOutcome, SubmissionStatus, SubmissionStore, SubmissionView, Volunteer,
    VolunteerRegistration,
};
use crate::transport::{
    Chat, ChatKind, ChunkStream, DocumentAttribute, FileRef, InboundEvent, MediaPayload,
    MediaSource, MessageSender, Sender, SenderKind, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use uuid::Uuid;

pub const MIB: usize = 1024 * 1024;

/// Stream of `total` zero bytes in `chunk`-sized pieces
pub fn chunk_stream(total: usize, chunk: usize) -> ChunkStream {
    let mut chunks = Vec::new();
    let mut remaining = total;
    while remaining > 0 {
        let len = remaining.min(chunk);
        chunks.push(Ok(Bytes::from(vec![0u8; len])));
        remaining -= len;
    }
    Box::pin(futures::stream::iter(chunks))
}

/// Yields `total` bytes and then never produces another item
pub fn stalled_stream(total: usize, chunk: usize) -> ChunkStream {
    Box::pin(chunk_stream(total, chunk).chain(futures::stream::pending()))
}

/// Stream that yields some chunks and then breaks
pub fn failing_stream(chunks_before_error: usize, chunk: usize) -> ChunkStream {
    let mut items: Vec<Result<Bytes, TransportError>> = (0..chunks_before_error)
        .map(|_| Ok(Bytes::from(vec![0u8; chunk])))
        .collect();
    items.push(Err(TransportError::Stream("connection reset".to_string())));
    Box::pin(futures::stream::iter(items))
}

fn message_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn user(sender_id: i64) -> Sender {
    Sender {
        id: sender_id,
        kind: SenderKind::User,
        first_name: Some("Ada".to_string()),
        last_name: Some("Lovelace".to_string()),
        username: Some("ada".to_string()),
        phone: None,
    }
}

/// Private-chat document message; file unique id is `unique-<message_id>`
pub fn event(sender_id: i64, message_id: i64, mime_type: &str, size: u64) -> InboundEvent {
    InboundEvent {
        message_id,
        date: message_date(),
        chat: Chat {
            id: sender_id,
            kind: ChatKind::Private,
            title: None,
        },
        sender: Some(user(sender_id)),
        media: Some(MediaPayload::Document {
            mime_type: Some(mime_type.to_string()),
            size,
            file: FileRef {
                download_id: format!("download-{}", message_id),
                unique_id: format!("unique-{}", message_id),
            },
            attributes: vec![DocumentAttribute::FileName("clip.mp4".to_string())],
        }),
        caption: Some("  river bank ".to_string()),
    }
}

pub fn inline_video_event(sender_id: i64, message_id: i64) -> InboundEvent {
    InboundEvent {
        media: Some(MediaPayload::InlineVideo {
            mime_type: Some("video/mp4".to_string()),
            size: 2 * MIB as u64,
            file: FileRef {
                download_id: format!("download-inline-{}", message_id),
                unique_id: format!("unique-inline-{}", message_id),
            },
            file_name: None,
        }),
        ..event(sender_id, message_id, "video/mp4", 0)
    }
}

pub fn group_event(sender_id: i64, message_id: i64) -> InboundEvent {
    InboundEvent {
        chat: Chat {
            id: -4242,
            kind: ChatKind::Group,
            title: Some("Flood watch".to_string()),
        },
        ..event(sender_id, message_id, "video/mp4", 12 * MIB as u64)
    }
}

#[derive(Debug, Clone)]
struct StoredSubmission {
    id: Uuid,
    volunteer_id: String,
    file_id: String,
    status: String,
    description: Option<String>,
    decline_reason: Option<String>,
    video_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    volunteers: HashMap<String, Volunteer>,
    submissions: HashMap<Uuid, StoredSubmission>,
}

/// Submission store with the same transition rules as the SQL upsert
#[derive(Default)]
pub struct MemorySubmissionStore {
    state: Mutex<MemoryState>,
    calls: AtomicUsize,
    fail_writes: AtomicBool,
    rejected_status: Mutex<Option<(SubmissionStatus, usize)>>,
}

impl MemorySubmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with a pool timeout
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Fail the next `times` status updates that move a row to `status`
    pub fn reject_status(&self, status: SubmissionStatus, times: usize) {
        *self.rejected_status.lock() = Some((status, times));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    /// Simulate downstream processing recording the content URL
    pub fn set_video_url(&self, id: Uuid, url: &str) {
        if let Some(row) = self.state.lock().submissions.get_mut(&id) {
            row.video_url = Some(url.to_string());
        }
    }

    fn enter(&self, write: bool) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if write && self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl SubmissionStore for MemorySubmissionStore {
    async fn find_volunteer(&self, id: &str) -> Result<Option<Volunteer>, StoreError> {
        self.enter(false)?;
        Ok(self.state.lock().volunteers.get(id).cloned())
    }

    async fn register_or_update_volunteer(
        &self,
        registration: &VolunteerRegistration,
    ) -> Result<(), StoreError> {
        self.enter(true)?;
        let now = Utc::now();
        let mut state = self.state.lock();
        let verified = registration.phone.is_some();

        state
            .volunteers
            .entry(registration.id.clone())
            .and_modify(|volunteer| {
                if registration.username.is_some() {
                    volunteer.username = registration.username.clone();
                }
                if registration.phone.is_some() {
                    volunteer.phone_number = registration.phone.clone();
                }
                volunteer.phone_verified |= verified;
                volunteer.updated_at = now;
            })
            .or_insert_with(|| Volunteer {
                id: registration.id.clone(),
                first_name: registration.first_name.clone(),
                last_name: registration.last_name.clone(),
                username: registration.username.clone(),
                phone_number: registration.phone.clone(),
                phone_verified: verified,
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn create_or_resume_submission(
        &self,
        volunteer_id: &str,
        file_id: &str,
        description: Option<&str>,
    ) -> Result<SubmissionOutcome, StoreError> {
        self.enter(true)?;
        let now = Utc::now();
        let mut state = self.state.lock();

        if let Some(row) = state
            .submissions
            .values_mut()
            .find(|row| row.file_id == file_id)
        {
            let status = SubmissionStatus::parse(&row.status);
            if !status.is_retryable() {
                return Ok(SubmissionOutcome::Duplicate { id: row.id, status });
            }
            row.status = SubmissionStatus::Processing.as_str().to_string();
            if let Some(description) = description.filter(|d| !d.is_empty()) {
                row.description = Some(description.to_string());
            }
            row.decline_reason = None;
            row.updated_at = now;
            return Ok(SubmissionOutcome::Resumed(row.id));
        }

        let id = Uuid::new_v4();
        state.submissions.insert(
            id,
            StoredSubmission {
                id,
                volunteer_id: volunteer_id.to_string(),
                file_id: file_id.to_string(),
                status: SubmissionStatus::Processing.as_str().to_string(),
                description: description.filter(|d| !d.is_empty()).map(String::from),
                decline_reason: None,
                video_url: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(SubmissionOutcome::Created(id))
    }

    async fn update_status(
        &self,
        submission_id: Uuid,
        status: SubmissionStatus,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        self.enter(true)?;
        if let Some((rejected, remaining)) = self.rejected_status.lock().as_mut() {
            if *rejected == status && *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
        }
        let mut state = self.state.lock();
        let row = state
            .submissions
            .get_mut(&submission_id)
            .ok_or(StoreError::NotFound(submission_id))?;
        row.status = status.as_str().to_string();
        row.decline_reason = reason.map(String::from);
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn get_submission(
        &self,
        submission_id: Uuid,
    ) -> Result<Option<SubmissionView>, StoreError> {
        self.enter(false)?;
        let state = self.state.lock();
        Ok(state.submissions.get(&submission_id).map(|row| {
            let volunteer = state.volunteers.get(&row.volunteer_id);
            SubmissionView {
                id: row.id,
                volunteer_id: row.volunteer_id.clone(),
                telegram_file_id: row.file_id.clone(),
                status: SubmissionStatus::parse(&row.status),
                description: row.description.clone(),
                decline_reason: row.decline_reason.clone(),
                video_url: row.video_url.clone(),
                created_at: row.created_at,
                updated_at: row.updated_at,
                volunteer_first_name: volunteer.map(|v| v.first_name.clone()),
                volunteer_last_name: volunteer.and_then(|v| v.last_name.clone()),
                volunteer_username: volunteer.and_then(|v| v.username.clone()),
            }
        }))
    }
}

#[derive(Default)]
struct TargetLog {
    uploads_created: usize,
    last_upload_id: Option<String>,
    metadata: Option<HashMap<String, String>>,
    part_sizes: Vec<usize>,
    completed: Option<Vec<CompletedPartRef>>,
    aborted: Vec<String>,
}

/// Multipart target that records every call
#[derive(Default)]
pub struct RecordingTarget {
    log: Mutex<TargetLog>,
    fail_on_part: Option<i32>,
    fail_abort: bool,
    object_missing: bool,
}

impl RecordingTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on_part(mut self, part_number: i32) -> Self {
        self.fail_on_part = Some(part_number);
        self
    }

    pub fn fail_abort(mut self) -> Self {
        self.fail_abort = true;
        self
    }

    pub fn object_missing(mut self) -> Self {
        self.object_missing = true;
        self
    }

    pub fn part_sizes(&self) -> Vec<usize> {
        self.log.lock().part_sizes.clone()
    }

    pub fn completed_parts(&self) -> Option<Vec<CompletedPartRef>> {
        self.log.lock().completed.clone()
    }

    pub fn aborted_uploads(&self) -> Vec<String> {
        self.log.lock().aborted.clone()
    }

    pub fn last_upload_id(&self) -> Option<String> {
        self.log.lock().last_upload_id.clone()
    }

    pub fn created_metadata(&self) -> Option<HashMap<String, String>> {
        self.log.lock().metadata.clone()
    }
}

#[async_trait]
impl MultipartTarget for RecordingTarget {
    fn bucket(&self) -> &str {
        "videos"
    }

    async fn create_multipart_upload(
        &self,
        _key: &str,
        _content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String, UploadError> {
        let mut log = self.log.lock();
        log.uploads_created += 1;
        let upload_id = format!("upload-{}", log.uploads_created);
        log.last_upload_id = Some(upload_id.clone());
        log.metadata = Some(metadata.clone());
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        _upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, UploadError> {
        if self.fail_on_part == Some(part_number) {
            return Err(UploadError::UploadPart {
                part_number,
                message: "injected failure".to_string(),
            });
        }
        self.log.lock().part_sizes.push(body.len());
        Ok(format!("\"etag-{}\"", part_number))
    }

    async fn complete_multipart_upload(
        &self,
        _key: &str,
        _upload_id: &str,
        parts: &[CompletedPartRef],
    ) -> Result<(), UploadError> {
        self.log.lock().completed = Some(parts.to_vec());
        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<(), UploadError> {
        self.log.lock().aborted.push(upload_id.to_string());
        if self.fail_abort {
            return Err(UploadError::Abort("injected abort failure".to_string()));
        }
        Ok(())
    }

    async fn object_exists(&self, _key: &str) -> Result<bool, UploadError> {
        Ok(!self.object_missing)
    }
}

/// Media source serving zero-filled files
pub struct StaticMediaSource {
    total: usize,
    chunk: usize,
    available: bool,
    stalls: bool,
    opened: AtomicUsize,
}

impl StaticMediaSource {
    pub fn new(total: usize, chunk: usize) -> Self {
        Self {
            total,
            chunk,
            available: true,
            stalls: false,
            opened: AtomicUsize::new(0),
        }
    }

    /// Delivers `total` bytes, then the connection goes quiet
    pub fn stalled(total: usize, chunk: usize) -> Self {
        Self {
            stalls: true,
            ..Self::new(total, chunk)
        }
    }

    /// Every download request fails
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(0, 1)
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn open_stream(&self, file: &FileRef) -> Result<ChunkStream, TransportError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if !self.available {
            return Err(TransportError::FileUnavailable(file.unique_id.clone()));
        }
        if self.stalls {
            return Ok(stalled_stream(self.total, self.chunk));
        }
        Ok(chunk_stream(self.total, self.chunk))
    }
}

/// Message sender that records or rejects every message
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(i64, String)>>,
    attempts: AtomicUsize,
    failing: bool,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(TransportError::Api {
                code: 403,
                description: "Forbidden: bot was blocked by the user".to_string(),
            });
        }
        self.sent.lock().push((chat_id, text.to_string()));
        Ok(())
    }
}

/// Notifier that keeps every notice in order
#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<(i64, NoticeKind, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<(i64, NoticeKind, String)> {
        self.notices.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, chat_id: i64, kind: NoticeKind, text: &str) {
        self.notices.lock().push((chat_id, kind, text.to_string()));
    }
}
