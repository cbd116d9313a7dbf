//! Caller-facing error taxonomy.
//!
//! Every failure the bridge can observe maps onto one [`ErrorKind`]. Only
//! `Validation`, `Timeout` and a terminal `WorkerFailure` ever reach the
//! original caller; the rest surface through logs, metrics and dead letters.

use std::fmt;
use std::time::Duration;

use uuid::Uuid;

use crate::bus::BusError;

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors produced by the request/response bridge.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("Validation failed for '{field}': {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] BusError),

    #[error("Request {correlation_id} timed out after {after:?}")]
    Timeout { correlation_id: Uuid, after: Duration },

    #[error("Worker failed ({code}): {message}")]
    WorkerFailure { code: String, message: String },

    #[error("Failed to decode envelope: {0}")]
    DecodeFailure(String),

    #[error("No pending request for correlation id {0}")]
    UnknownCorrelation(Uuid),

    #[error("Correlation id {0} is already being tracked")]
    DuplicateCorrelation(Uuid),

    #[error("Correlation tracker closed before a response arrived")]
    Closed,
}

impl BridgeError {
    /// Shorthand for a validation failure on a named field.
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// The taxonomy bucket this error falls into.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::DuplicateCorrelation(_) => ErrorKind::Validation,
            Self::Transport(_) | Self::Closed => ErrorKind::Transport,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::WorkerFailure { .. } => ErrorKind::WorkerFailure,
            Self::DecodeFailure(_) => ErrorKind::DecodeFailure,
            Self::UnknownCorrelation(_) => ErrorKind::UnknownCorrelation,
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        Self::DecodeFailure(e.to_string())
    }
}

/// Error taxonomy buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Rejected before publish, never retried.
    Validation,
    /// Publish/subscribe connectivity failure.
    Transport,
    /// No response within the configured bound. The caller may retry.
    Timeout,
    /// Processing failed; retried by the worker, then dead-lettered.
    WorkerFailure,
    /// Malformed envelope; dead-lettered immediately.
    DecodeFailure,
    /// Response for an absent or expired waiter.
    UnknownCorrelation,
}

impl ErrorKind {
    /// Whether errors of this kind propagate back to the original caller.
    ///
    /// Transport failures reach the caller only when the transport's own
    /// retry policy is exhausted at submit time, which is reported as a
    /// `Transport` error from `submit` rather than through the pending reply.
    pub fn is_caller_visible(&self) -> bool {
        matches!(
            self,
            Self::Validation | Self::Timeout | Self::WorkerFailure | Self::Transport
        )
    }

    /// Whether the caller may reasonably resubmit the same request.
    pub fn is_retryable_by_caller(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transport)
    }

    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::WorkerFailure => "worker_failure",
            Self::DecodeFailure => "decode_failure",
            Self::UnknownCorrelation => "unknown_correlation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
