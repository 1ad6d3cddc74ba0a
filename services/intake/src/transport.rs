//! Messaging transport seam.
//!
//! The intake pipeline only sees the typed events and the three primitives
//! below; the Telegram adapter in [`crate::telegram`] is one implementation.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by the messaging transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport request failed: {0}")]
    Request(String),

    #[error("Transport API error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("File is not downloadable: {0}")]
    FileUnavailable(String),

    #[error("Chunk stream failed: {0}")]
    Stream(String),
}

/// Chunked download of a media payload
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Kind of conversation an event arrived in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
}

/// Conversation descriptor
#[derive(Debug, Clone)]
pub struct Chat {
    pub id: i64,
    pub kind: ChatKind,
    pub title: Option<String>,
}

/// Kind of identity that sent a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderKind {
    User,
    Bot,
    /// Message posted on behalf of a channel or group
    Chat,
}

/// Sender profile
#[derive(Debug, Clone)]
pub struct Sender {
    pub id: i64,
    pub kind: SenderKind,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub phone: Option<String>,
}

impl Sender {
    /// First and last name joined, empty parts dropped
    pub fn display_name(&self) -> String {
        [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Handle identifying a downloadable file on the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    /// Download handle, only valid for this client
    pub download_id: String,
    /// Stable identifier shared by every re-send of the same file
    pub unique_id: String,
}

/// Attributes attached to a document payload
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentAttribute {
    FileName(String),
}

/// Media carried by an inbound message
#[derive(Debug, Clone)]
pub enum MediaPayload {
    Document {
        mime_type: Option<String>,
        size: u64,
        file: FileRef,
        attributes: Vec<DocumentAttribute>,
    },
    InlineVideo {
        mime_type: Option<String>,
        size: u64,
        file: FileRef,
        file_name: Option<String>,
    },
    /// Any other media kind, named for logging
    Other(String),
}

/// One inbound message event
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub message_id: i64,
    pub date: DateTime<Utc>,
    pub chat: Chat,
    pub sender: Option<Sender>,
    pub media: Option<MediaPayload>,
    pub caption: Option<String>,
}

/// Source of inbound events
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Wait for the next batch of events; an empty batch is a normal timeout
    async fn next_batch(&self) -> Result<Vec<InboundEvent>, TransportError>;
}

/// Chunked-download primitive
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn open_stream(&self, file: &FileRef) -> Result<ChunkStream, TransportError>;
}

/// Outbound text primitive
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Send Markdown text with link previews disabled
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), TransportError>;
}
