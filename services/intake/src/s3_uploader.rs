//! Streaming multipart upload from the messaging transport into S3.
//!
//! Bytes are never staged on disk: chunks from the transport accumulate in a
//! [`MultipartState`] buffer and leave it as soon as a full part is available,
//! so memory stays at one part plus one chunk whatever the file size.

use crate::config::S3Config;
use crate::transport::{ChunkStream, TransportError};
use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Extension used when neither the file name nor the MIME type gives one
pub const DEFAULT_EXTENSION: &str = "mp4";

/// Longest silence tolerated between two chunks unless configured otherwise
pub const DEFAULT_CHUNK_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors raised while moving a video into object storage
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Failed to create multipart upload: {0}")]
    Create(String),

    #[error("Failed to upload part {part_number}: {message}")]
    UploadPart { part_number: i32, message: String },

    #[error("Failed to complete multipart upload: {0}")]
    Complete(String),

    #[error("Failed to inspect object {key}: {message}")]
    Inspect { key: String, message: String },

    #[error("Uploaded object {0} was not found on verification")]
    VerificationFailed(String),

    #[error("Failed to abort multipart upload: {0}")]
    Abort(String),

    #[error("Bucket {bucket} is not reachable: {message}")]
    BucketUnreachable { bucket: String, message: String },

    #[error("Source stream failed: {0}")]
    Source(TransportError),
}

/// Part number and ETag returned by the storage backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPartRef {
    pub part_number: i32,
    pub e_tag: String,
}

/// Multipart primitives the streaming engine needs from object storage
#[async_trait]
pub trait MultipartTarget: Send + Sync {
    fn bucket(&self) -> &str;

    /// Open a session and return its upload id
    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String, UploadError>;

    /// Upload one part and return its ETag
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, UploadError>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartRef],
    ) -> Result<(), UploadError>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), UploadError>;

    /// Metadata lookup; `Ok(false)` when the object does not exist
    async fn object_exists(&self, key: &str) -> Result<bool, UploadError>;
}

/// A part split off the buffer, ready to upload
#[derive(Debug)]
pub struct PendingPart {
    pub part_number: i32,
    pub body: Bytes,
}

/// Buffer-then-flush state threaded through the chunk loop
#[derive(Debug)]
pub struct MultipartState {
    part_size: usize,
    next_part: i32,
    buffer: BytesMut,
    completed: Vec<CompletedPartRef>,
    bytes_transferred: u64,
}

impl MultipartState {
    pub fn new(part_size: usize) -> Self {
        Self {
            part_size,
            next_part: 1,
            buffer: BytesMut::with_capacity(part_size),
            completed: Vec::new(),
            bytes_transferred: 0,
        }
    }

    /// Append a chunk read from the source
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        self.bytes_transferred += chunk.len() as u64;
    }

    /// Split off exactly one part once the buffer holds a full part
    pub fn take_full_part(&mut self) -> Option<PendingPart> {
        if self.buffer.len() < self.part_size {
            return None;
        }
        let body = self.buffer.split_to(self.part_size).freeze();
        Some(self.numbered(body))
    }

    /// Whatever is left at end of stream. A stream that produced no parts
    /// yields one (possibly empty) part so the object always gets created.
    pub fn take_final_part(&mut self) -> Option<PendingPart> {
        if self.buffer.is_empty() && self.next_part > 1 {
            return None;
        }
        let body = self.buffer.split().freeze();
        Some(self.numbered(body))
    }

    pub fn record(&mut self, part_number: i32, e_tag: String) {
        self.completed.push(CompletedPartRef {
            part_number,
            e_tag,
        });
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn completed_parts(&self) -> &[CompletedPartRef] {
        &self.completed
    }

    fn numbered(&mut self, body: Bytes) -> PendingPart {
        let part_number = self.next_part;
        self.next_part += 1;
        PendingPart { part_number, body }
    }
}

/// Reports progress each time another fifth of the declared size is crossed
#[derive(Debug)]
pub struct ProgressMarks {
    declared_total: u64,
    next_percent: u64,
}

impl ProgressMarks {
    const STEP_PERCENT: u64 = 20;

    pub fn new(declared_total: u64) -> Self {
        Self {
            declared_total,
            next_percent: Self::STEP_PERCENT,
        }
    }

    /// Highest mark crossed since the last call, if any
    pub fn advance(&mut self, transferred: u64) -> Option<u64> {
        if self.declared_total == 0 || self.next_percent > 100 {
            return None;
        }
        let percent = transferred.saturating_mul(100) / self.declared_total;
        if percent < self.next_percent {
            return None;
        }
        let crossed = (percent.min(100) / Self::STEP_PERCENT) * Self::STEP_PERCENT;
        self.next_percent = crossed + Self::STEP_PERCENT;
        Some(crossed)
    }
}

/// What the engine needs to know about the file being uploaded
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub submission_id: Uuid,
    pub volunteer_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub declared_size: u64,
    pub sender_name: String,
    pub sender_phone: Option<String>,
}

/// Verified object in storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub part_count: usize,
}

/// Streams transport chunks into a multipart upload
pub struct StreamingUploader {
    target: Arc<dyn MultipartTarget>,
    namespace: String,
    part_size: usize,
    source_tag: String,
    chunk_idle_timeout: Duration,
}

impl StreamingUploader {
    pub fn new(
        target: Arc<dyn MultipartTarget>,
        namespace: &str,
        part_size: usize,
        source_tag: &str,
    ) -> Self {
        Self {
            target,
            namespace: namespace.trim_matches('/').to_string(),
            part_size,
            source_tag: source_tag.to_string(),
            chunk_idle_timeout: DEFAULT_CHUNK_IDLE_TIMEOUT,
        }
    }

    /// Fail the transfer when the source goes silent for this long
    pub fn with_chunk_idle_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_idle_timeout = timeout;
        self
    }

    pub fn bucket(&self) -> &str {
        self.target.bucket()
    }

    pub fn source_tag(&self) -> &str {
        &self.source_tag
    }

    /// Format: {namespace}/{submission_id}.{extension}
    pub fn object_key(&self, submission_id: Uuid, extension: &str) -> String {
        format!("{}/{}.{}", self.namespace, submission_id, extension)
    }

    /// Move the stream into storage, aborting the session on any failure
    #[instrument(skip(self, request, stream), fields(submission_id = %request.submission_id))]
    pub async fn upload_stream(
        &self,
        request: &UploadRequest,
        stream: ChunkStream,
    ) -> Result<StoredObject, UploadError> {
        let extension = guess_extension(request.file_name.as_deref(), request.mime_type.as_deref());
        let key = self.object_key(request.submission_id, &extension);
        let content_type = get_content_type(request.mime_type.as_deref(), &extension);
        let metadata = self.object_metadata(request, &extension);

        let upload_id = self
            .target
            .create_multipart_upload(&key, &content_type, &metadata)
            .await?;

        debug!(s3_key = %key, upload_id = %upload_id, "Multipart upload created");

        match self.transfer(&key, &upload_id, request.declared_size, stream).await {
            Ok((size_bytes, part_count)) => {
                info!(
                    s3_key = %key,
                    size_bytes = size_bytes,
                    parts = part_count,
                    "Video uploaded successfully"
                );
                Ok(StoredObject {
                    bucket: self.target.bucket().to_string(),
                    key,
                    content_type,
                    size_bytes,
                    part_count,
                })
            }
            Err(e) => {
                self.abort(&key, &upload_id).await;
                Err(e)
            }
        }
    }

    async fn transfer(
        &self,
        key: &str,
        upload_id: &str,
        declared_size: u64,
        mut stream: ChunkStream,
    ) -> Result<(u64, usize), UploadError> {
        let started = Instant::now();
        let mut state = MultipartState::new(self.part_size);
        let mut progress = ProgressMarks::new(declared_size);

        loop {
            let chunk = match tokio::time::timeout(self.chunk_idle_timeout, stream.next()).await {
                Ok(Some(chunk)) => chunk.map_err(UploadError::Source)?,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        s3_key = %key,
                        idle_secs = self.chunk_idle_timeout.as_secs_f64(),
                        transferred_bytes = state.bytes_transferred(),
                        "Source stream stalled"
                    );
                    return Err(UploadError::Source(TransportError::Stream(format!(
                        "no data received for {:?} after {} bytes",
                        self.chunk_idle_timeout,
                        state.bytes_transferred()
                    ))));
                }
            };
            state.push(&chunk);

            while let Some(part) = state.take_full_part() {
                self.send_part(key, upload_id, part, &mut state).await?;
            }

            if let Some(percent) = progress.advance(state.bytes_transferred()) {
                info!(
                    percent = percent,
                    transferred_mb = state.bytes_transferred() / (1024 * 1024),
                    declared_mb = declared_size / (1024 * 1024),
                    "Upload progress"
                );
            }
        }

        if let Some(part) = state.take_final_part() {
            self.send_part(key, upload_id, part, &mut state).await?;
        }

        self.target
            .complete_multipart_upload(key, upload_id, state.completed_parts())
            .await?;

        if !self.target.object_exists(key).await? {
            return Err(UploadError::VerificationFailed(key.to_string()));
        }

        metrics::histogram!("intake.upload.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        Ok((state.bytes_transferred(), state.completed_parts().len()))
    }

    async fn send_part(
        &self,
        key: &str,
        upload_id: &str,
        part: PendingPart,
        state: &mut MultipartState,
    ) -> Result<(), UploadError> {
        let size = part.body.len();
        let e_tag = self
            .target
            .upload_part(key, upload_id, part.part_number, part.body)
            .await?;

        debug!(part_number = part.part_number, size_bytes = size, "Part uploaded");
        metrics::counter!("intake.upload.parts").increment(1);
        metrics::counter!("intake.upload.bytes").increment(size as u64);

        state.record(part.part_number, e_tag);
        Ok(())
    }

    /// Best effort; a failed abort never replaces the original error
    async fn abort(&self, key: &str, upload_id: &str) {
        metrics::counter!("intake.upload.aborted").increment(1);
        match self.target.abort_multipart_upload(key, upload_id).await {
            Ok(()) => warn!(s3_key = %key, upload_id = %upload_id, "Multipart upload aborted"),
            Err(e) => warn!(
                s3_key = %key,
                upload_id = %upload_id,
                error = %e,
                "Failed to abort multipart upload"
            ),
        }
    }

    fn object_metadata(&self, request: &UploadRequest, extension: &str) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        metadata.insert("submission_id".to_string(), request.submission_id.to_string());
        metadata.insert("volunteer_id".to_string(), metadata_value(&request.volunteer_id));
        metadata.insert("uploaded_at".to_string(), Utc::now().to_rfc3339());
        metadata.insert("source".to_string(), metadata_value(&self.source_tag));
        metadata.insert("sender_name".to_string(), metadata_value(&request.sender_name));
        metadata.insert(
            "sender_phone".to_string(),
            metadata_value(request.sender_phone.as_deref().unwrap_or_default()),
        );
        metadata.insert("file_extension".to_string(), extension.to_string());
        metadata.insert("original_size".to_string(), request.declared_size.to_string());
        metadata
    }
}

/// S3 implementation of the multipart primitives
pub struct S3Uploader {
    client: S3Client,
    bucket: String,
}

impl S3Uploader {
    /// Create a new S3 uploader
    pub async fn new(config: &S3Config) -> Result<Self, UploadError> {
        let timeout_config = TimeoutConfig::builder()
            .operation_timeout(Duration::from_secs(config.operation_timeout_secs))
            .build();

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .timeout_config(timeout_config)
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 uploader initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }

    /// Startup check: the bucket must exist and be reachable
    pub async fn check_bucket(&self) -> Result<(), UploadError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| UploadError::BucketUnreachable {
                bucket: self.bucket.clone(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        info!(bucket = %self.bucket, "S3 bucket accessible");
        Ok(())
    }
}

#[async_trait]
impl MultipartTarget for S3Uploader {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String, UploadError> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .set_metadata(Some(metadata.clone()))
            .send()
            .await
            .map_err(|e| UploadError::Create(DisplayErrorContext(&e).to_string()))?;

        response
            .upload_id()
            .map(String::from)
            .ok_or_else(|| UploadError::Create("No upload ID in response".to_string()))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, UploadError> {
        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| UploadError::UploadPart {
                part_number,
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(response.e_tag().unwrap_or_default().to_string())
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartRef],
    ) -> Result<(), UploadError> {
        let completed_parts: Vec<CompletedPart> = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(&part.e_tag)
                    .build()
            })
            .collect();

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| UploadError::Complete(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), UploadError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| UploadError::Abort(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }

    async fn object_exists(&self, key: &str) -> Result<bool, UploadError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(UploadError::Inspect {
                        key: key.to_string(),
                        message: DisplayErrorContext(&e).to_string(),
                    })
                }
            }
        }
    }
}

/// Pick the object extension from the file name, then the MIME type
pub fn guess_extension(file_name: Option<&str>, mime_type: Option<&str>) -> String {
    let from_name = file_name
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| sanitize_extension(ext))
        .filter(|ext| !ext.is_empty());

    if let Some(ext) = from_name {
        return ext;
    }

    mime_type
        .and_then(extension_for_mime)
        .unwrap_or(DEFAULT_EXTENSION)
        .to_string()
}

fn sanitize_extension(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn extension_for_mime(mime_type: &str) -> Option<&'static str> {
    match mime_type.to_lowercase().as_str() {
        "video/mp4" => Some("mp4"),
        "video/quicktime" => Some("mov"),
        "video/x-matroska" => Some("mkv"),
        "video/webm" => Some("webm"),
        "video/x-msvideo" => Some("avi"),
        "video/3gpp" => Some("3gp"),
        "video/mpeg" => Some("mpeg"),
        _ => None,
    }
}

/// Content type for the stored object
fn get_content_type(declared: Option<&str>, extension: &str) -> String {
    if let Some(mime) = declared {
        if mime.to_lowercase().starts_with("video/") {
            return mime.to_lowercase();
        }
    }

    match extension {
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "3gp" => "video/3gpp",
        "mpeg" | "mpg" => "video/mpeg",
        _ => "video/mp4",
    }
    .to_string()
}

/// S3 user metadata must be printable ASCII
fn metadata_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '?' })
        .collect()
}
