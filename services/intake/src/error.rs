//! Pipeline-level error classification.
//!
//! Component errors stay in their own modules; a unit of work folds whatever
//! went wrong into an [`IntakeError`] so it can pick the submission status and
//! the message shown to the user.

use crate::config::ConfigError;
use crate::dispatch::DispatchError;
use crate::intake::RejectReason;
use crate::s3_uploader::UploadError;
use crate::submission_store::StoreError;
use crate::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("event rejected: {0}")]
    Validation(#[from] RejectReason),

    #[error("data access error: {0}")]
    DataAccess(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("upload error: {0}")]
    Upload(UploadError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("worker task aborted: {0}")]
    Crashed(String),
}

impl From<UploadError> for IntakeError {
    fn from(err: UploadError) -> Self {
        match err {
            // A broken download is the transport's fault, not storage's.
            UploadError::Source(source) => IntakeError::Transport(source),
            other => IntakeError::Upload(other),
        }
    }
}

impl IntakeError {
    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            IntakeError::Configuration(_) => "configuration",
            IntakeError::Validation(_) => "validation",
            IntakeError::DataAccess(_) => "data_access",
            IntakeError::Transport(_) => "transport",
            IntakeError::Upload(_) => "upload",
            IntakeError::Dispatch(_) => "dispatch",
            IntakeError::Crashed(_) => "crashed",
        }
    }
}
