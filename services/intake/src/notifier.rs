use crate::transport::MessageSender;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Severity tag selecting the prefix glyph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Info,
    Success,
    Error,
    Warning,
}

impl NoticeKind {
    pub fn glyph(&self) -> &'static str {
        match self {
            NoticeKind::Info => "ℹ️",
            NoticeKind::Success => "✅",
            NoticeKind::Error => "❌",
            NoticeKind::Warning => "⚠️",
        }
    }
}

/// Messages sent back to the submitter
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Received { size_mb: f64 },
    Welcome { name: String },
    RegistrationFailed,
    DatabaseError,
    AlreadySubmitted,
    DownloadFailed,
    UploadFailed,
    DispatchFailed,
    UnexpectedError,
    ProcessingStarted { size_mb: f64, submission_id: Uuid },
}

impl Notice {
    pub fn kind(&self) -> NoticeKind {
        match self {
            Notice::Received { .. } | Notice::AlreadySubmitted => NoticeKind::Info,
            Notice::Welcome { .. } | Notice::ProcessingStarted { .. } => NoticeKind::Success,
            Notice::RegistrationFailed
            | Notice::DatabaseError
            | Notice::DownloadFailed
            | Notice::UploadFailed
            | Notice::DispatchFailed
            | Notice::UnexpectedError => NoticeKind::Error,
        }
    }

    /// Markdown body, without the glyph
    pub fn text(&self) -> String {
        match self {
            Notice::Received { size_mb } => format!(
                "*Video Received!*\n\nYour {:.2} MB video is being processed.\nPlease wait...",
                size_mb
            ),
            Notice::Welcome { name } => format!(
                "*Welcome {}!*\n\nYou've been registered successfully. Processing your video...",
                escape_markdown(name)
            ),
            Notice::RegistrationFailed => {
                "*Registration Failed*\n\nCannot create your account. Please try again later."
                    .to_string()
            }
            Notice::DatabaseError => {
                "*Database Error*\n\nCannot create submission record. Please try again.".to_string()
            }
            Notice::AlreadySubmitted => {
                "*Already Submitted*\n\nThis video has already been received and is under review."
                    .to_string()
            }
            Notice::DownloadFailed => {
                "*Download Failed*\n\nCannot download your video from Telegram. Please try sending it again."
                    .to_string()
            }
            Notice::UploadFailed => {
                "*Upload Failed*\n\nCannot upload your video to cloud storage. Please try again."
                    .to_string()
            }
            Notice::DispatchFailed => {
                "*Processing Failed*\n\nVideo uploaded but cannot start processing. Our team has been notified."
                    .to_string()
            }
            Notice::UnexpectedError => {
                "*Unexpected Error*\n\nSomething went wrong while processing your video. Please try again or contact support."
                    .to_string()
            }
            Notice::ProcessingStarted {
                size_mb,
                submission_id,
            } => {
                let short_id: String = submission_id.to_string().chars().take(8).collect();
                format!(
                    "*Processing Started!*\n\nYour video has been uploaded successfully and is now being processed.\n\n*Details:*\n• Size: {:.2} MB\n• Submission ID: `{}...`\n\nYou'll receive another message when processing is complete!",
                    size_mb, short_id
                )
            }
        }
    }
}

/// Prefix the message with the glyph for its kind
pub fn format_notice(kind: NoticeKind, text: &str) -> String {
    format!("{} {}", kind.glyph(), text)
}

/// Escape characters that legacy Markdown treats as entity markers
fn escape_markdown(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Fire-and-forget feedback channel to the submitter
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Never fails; delivery problems are logged
    async fn notify(&self, chat_id: i64, kind: NoticeKind, text: &str);

    async fn send(&self, chat_id: i64, notice: Notice) {
        self.notify(chat_id, notice.kind(), &notice.text()).await
    }
}

/// Notifier posting through the transport's send API
pub struct TransportNotifier {
    sender: Arc<dyn MessageSender>,
}

impl TransportNotifier {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Notifier for TransportNotifier {
    async fn notify(&self, chat_id: i64, kind: NoticeKind, text: &str) {
        match self.sender.send_text(chat_id, &format_notice(kind, text)).await {
            Ok(()) => debug!(chat_id = chat_id, kind = ?kind, "Notification sent"),
            Err(e) => {
                metrics::counter!("intake.notifications.failed").increment(1);
                warn!(chat_id = chat_id, kind = ?kind, error = %e, "Failed to send notification");
            }
        }
    }
}
