//! Video Intake Service
//!
//! Accepts video files sent to a Telegram bot, records each submission in
//! PostgreSQL, streams the file into S3 without touching local disk and hands
//! the stored object to downstream processing through Kafka or an
//! asynchronous function invocation.
//!
//! ## Features
//!
//! - **Admission control**: only videos sent by individual users in private
//!   chats are accepted; everything else is dropped with a log line
//! - **Deduplicated submissions**: the stable Telegram file id maps to one
//!   submission row; failed or interrupted uploads resume that row
//! - **Streaming multipart upload**: memory stays bounded by one part
//! - **Pluggable dispatch**: Kafka job message or HTTP function invocation
//! - **User feedback**: every step reports back to the sender
//!
//! ## Architecture
//!
//! ```text
//! Telegram              Intake                    S3 Bucket
//! ┌────────────┐       ┌──────────────┐          ┌──────────────┐
//! │ getUpdates │──────▶│ Controller   │          │ temp_videos/ │
//! └────────────┘       │ (admission)  │          │   {id}.{ext} │
//!       ▲              └──────────────┘          └──────────────┘
//!       │                     │ spawn                    ▲
//!       │                     ▼                          │
//!       │              ┌──────────────┐  stream   ┌──────────────┐
//!       │ sendMessage  │ Submission   │──────────▶│ Streaming    │
//!       └──────────────│ Worker       │           │ Uploader     │
//!                      └──────────────┘           └──────────────┘
//!                        │         │
//!                        ▼         ▼
//!               ┌──────────────┐ ┌──────────────┐
//!               │ PostgreSQL   │ │ Kafka topic /│
//!               │ submissions  │ │ function     │
//!               └──────────────┘ └──────────────┘
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod intake;
pub mod notifier;
pub mod s3_uploader;
pub mod submission_store;
pub mod telegram;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use dispatch::{build_dispatcher, DispatchReceipt, Dispatcher, ProcessingJob};
pub use error::IntakeError;
pub use intake::{admit, IntakeController, IntakeRecord, RejectReason};
pub use notifier::{Notice, NoticeKind, Notifier, TransportNotifier};
pub use s3_uploader::{S3Uploader, StreamingUploader};
pub use submission_store::{PgSubmissionStore, SubmissionOutcome, SubmissionStatus, SubmissionStore};
pub use telegram::TelegramClient;
pub use worker::{SubmissionWorker, WorkerOutcome};
