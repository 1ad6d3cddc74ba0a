//! Telegram Bot API adapter.
//!
//! Long-polls `getUpdates`, resolves downloads through `getFile` and streams
//! the file body straight from the file endpoint. Point `api_base_url` at a
//! local Bot API server to download files above the public 20 MB limit.

use crate::config::TelegramConfig;
use crate::transport::{
    Chat, ChatKind, ChunkStream, DocumentAttribute, EventSource, FileRef, InboundEvent,
    MediaPayload, MediaSource, MessageSender, Sender, SenderKind, TransportError,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, instrument};

/// Envelope of every Bot API response
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    error_code: Option<i64>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub date: i64,
    pub chat: ApiChat,
    pub from: Option<ApiUser>,
    pub sender_chat: Option<ApiChat>,
    pub caption: Option<String>,
    pub document: Option<ApiDocument>,
    pub video: Option<ApiVideo>,
    pub video_note: Option<ApiVideoNote>,
    pub animation: Option<serde_json::Value>,
    pub photo: Option<serde_json::Value>,
    pub sticker: Option<serde_json::Value>,
    pub audio: Option<serde_json::Value>,
    pub voice: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct ApiChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiUser {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiDocument {
    pub file_id: String,
    pub file_unique_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ApiVideo {
    pub file_id: String,
    pub file_unique_id: String,
    pub width: u32,
    pub height: u32,
    pub duration: u32,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ApiVideoNote {
    pub file_id: String,
    pub file_unique_id: String,
    pub file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiFile {
    file_path: Option<String>,
}

#[derive(Debug, Serialize)]
struct GetUpdatesParams<'a> {
    offset: i64,
    timeout: u64,
    allowed_updates: &'a [&'a str],
}

/// Bot API client implementing the three transport primitives
pub struct TelegramClient {
    http: Client,
    api_url: String,
    file_url: String,
    poll_timeout: Duration,
    request_timeout: Duration,
    offset: AtomicI64,
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig) -> Result<Self, TransportError> {
        // No client-wide timeout: file downloads may legitimately run for minutes.
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let base = config.api_base_url.trim_end_matches('/');

        Ok(Self {
            http,
            api_url: format!("{}/bot{}", base, config.bot_token),
            file_url: format!("{}/file/bot{}", base, config.bot_token),
            poll_timeout: Duration::from_secs(config.poll_timeout_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            offset: AtomicI64::new(0),
        })
    }

    async fn call<P, R>(&self, method: &str, params: &P, timeout: Duration) -> Result<R, TransportError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .http
            .post(format!("{}/{}", self.api_url, method))
            .timeout(timeout)
            .json(params)
            .send()
            .await
            // The URL carries the bot token, keep it out of error text.
            .map_err(|e| TransportError::Request(format!("{}: {}", method, e.without_url())))?;

        let body: ApiResponse<R> = response
            .json()
            .await
            .map_err(|e| TransportError::Request(format!("{}: {}", method, e.without_url())))?;

        into_result(body)
    }

    /// Resolve the download path of a file
    async fn file_path(&self, file: &FileRef) -> Result<String, TransportError> {
        let api_file: ApiFile = self
            .call(
                "getFile",
                &json!({ "file_id": file.download_id }),
                self.request_timeout,
            )
            .await?;

        api_file
            .file_path
            .ok_or_else(|| TransportError::FileUnavailable(file.unique_id.clone()))
    }
}

fn into_result<R>(body: ApiResponse<R>) -> Result<R, TransportError> {
    match (body.ok, body.result) {
        (true, Some(result)) => Ok(result),
        _ => Err(TransportError::Api {
            code: body.error_code.unwrap_or_default(),
            description: body.description.unwrap_or_else(|| "empty response".to_string()),
        }),
    }
}

#[async_trait]
impl EventSource for TelegramClient {
    async fn next_batch(&self) -> Result<Vec<InboundEvent>, TransportError> {
        let params = GetUpdatesParams {
            offset: self.offset.load(Ordering::SeqCst),
            timeout: self.poll_timeout.as_secs(),
            allowed_updates: &["message"],
        };

        let updates: Vec<Update> = self
            .call("getUpdates", &params, self.poll_timeout + self.request_timeout)
            .await?;

        if let Some(last) = updates.iter().map(|update| update.update_id).max() {
            self.offset.store(last + 1, Ordering::SeqCst);
        }

        debug!(updates = updates.len(), "Polled updates");

        Ok(updates
            .into_iter()
            .filter_map(|update| update.message)
            .map(to_event)
            .collect())
    }
}

#[async_trait]
impl MediaSource for TelegramClient {
    #[instrument(skip(self, file), fields(file_unique_id = %file.unique_id))]
    async fn open_stream(&self, file: &FileRef) -> Result<ChunkStream, TransportError> {
        let path = self.file_path(file).await?;

        let response = self
            .http
            .get(format!("{}/{}", self.file_url, path))
            .send()
            .await
            .map_err(|e| TransportError::Request(e.without_url().to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::FileUnavailable(format!(
                "{} (HTTP {})",
                file.unique_id,
                response.status().as_u16()
            )));
        }

        let stream = response
            .bytes_stream()
            .map_err(|e| TransportError::Stream(e.without_url().to_string()));

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl MessageSender for TelegramClient {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), TransportError> {
        let _: serde_json::Value = self
            .call(
                "sendMessage",
                &json!({
                    "chat_id": chat_id,
                    "text": text,
                    "parse_mode": "Markdown",
                    "disable_web_page_preview": true,
                }),
                self.request_timeout,
            )
            .await?;
        Ok(())
    }
}

fn chat_kind(kind: &str) -> ChatKind {
    match kind {
        "private" => ChatKind::Private,
        "supergroup" => ChatKind::Supergroup,
        "channel" => ChatKind::Channel,
        _ => ChatKind::Group,
    }
}

fn to_sender(message: &Message) -> Option<Sender> {
    if let Some(ref chat) = message.sender_chat {
        return Some(Sender {
            id: chat.id,
            kind: SenderKind::Chat,
            first_name: chat.title.clone(),
            last_name: None,
            username: None,
            phone: None,
        });
    }

    message.from.as_ref().map(|user| Sender {
        id: user.id,
        kind: if user.is_bot {
            SenderKind::Bot
        } else {
            SenderKind::User
        },
        first_name: Some(user.first_name.clone()),
        last_name: user.last_name.clone(),
        username: user.username.clone(),
        // The Bot API only reveals phone numbers through shared contacts.
        phone: None,
    })
}

fn to_media(message: &Message) -> Option<MediaPayload> {
    // Animations also carry a `document`, so they are checked first.
    if message.animation.is_some() {
        return Some(MediaPayload::Other("animation".to_string()));
    }

    if let Some(ref document) = message.document {
        let attributes = document
            .file_name
            .iter()
            .cloned()
            .map(DocumentAttribute::FileName)
            .collect();
        return Some(MediaPayload::Document {
            mime_type: document.mime_type.clone(),
            size: document.file_size.unwrap_or_default(),
            file: FileRef {
                download_id: document.file_id.clone(),
                unique_id: document.file_unique_id.clone(),
            },
            attributes,
        });
    }

    if let Some(ref video) = message.video {
        return Some(MediaPayload::InlineVideo {
            mime_type: video.mime_type.clone(),
            size: video.file_size.unwrap_or_default(),
            file: FileRef {
                download_id: video.file_id.clone(),
                unique_id: video.file_unique_id.clone(),
            },
            file_name: video.file_name.clone(),
        });
    }

    if let Some(ref note) = message.video_note {
        return Some(MediaPayload::InlineVideo {
            mime_type: Some("video/mp4".to_string()),
            size: note.file_size.unwrap_or_default(),
            file: FileRef {
                download_id: note.file_id.clone(),
                unique_id: note.file_unique_id.clone(),
            },
            file_name: None,
        });
    }

    let other = [
        ("photo", message.photo.is_some()),
        ("sticker", message.sticker.is_some()),
        ("audio", message.audio.is_some()),
        ("voice", message.voice.is_some()),
    ];
    other
        .iter()
        .find(|(_, present)| *present)
        .map(|(kind, _)| MediaPayload::Other(kind.to_string()))
}

/// Map a Bot API message onto the transport-neutral event
pub fn to_event(message: Message) -> InboundEvent {
    let date = Utc
        .timestamp_opt(message.date, 0)
        .single()
        .unwrap_or_else(Utc::now);

    InboundEvent {
        message_id: message.message_id,
        date,
        chat: Chat {
            id: message.chat.id,
            kind: chat_kind(&message.chat.kind),
            title: message.chat.title.clone(),
        },
        sender: to_sender(&message),
        media: to_media(&message),
        caption: message.caption.clone(),
    }
}
