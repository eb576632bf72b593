use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to callers of the request/reply API.
///
/// Replies that are dropped on arrival (no correlation id, unknown id, late)
/// have no variant here; they are logged and counted instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplyError {
    #[error("request with correlation id `{correlation_id}` is already in flight")]
    DuplicateRequest { correlation_id: String },
    #[error("no reply for correlation id `{correlation_id}` within {timeout:?}")]
    Timeout {
        correlation_id: String,
        timeout: Duration,
    },
    #[error("remote error: {message}")]
    Remote { message: String },
    #[error("unsupported grouped payload: {reason}")]
    UnsupportedPayload { reason: String },
    #[error("failed to send to `{destination}`: {reason}")]
    Send { destination: String, reason: String },
    #[error("request `{correlation_id}` was cancelled")]
    Cancelled { correlation_id: String },
    #[error("payload conversion failed: {0}")]
    Conversion(String),
    #[error("no tokio runtime available to run request/reply work")]
    NoRuntime,
}

impl ReplyError {
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::UnsupportedPayload {
            reason: reason.into(),
        }
    }

    /// Whether the failure came from the deadline rather than the remote side.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
