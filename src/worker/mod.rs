//! Worker side of the bridge.
//!
//! The [`Worker`] trait is the opaque processing capability (translation,
//! summarization). [`runner::WorkerRunner`] consumes request topics, drives
//! each message through processing, retry and dead-lettering, and publishes
//! exactly one terminal response per request.

use async_trait::async_trait;

use crate::envelope::{WorkPayload, WorkResult};

pub mod loopback;
pub mod retry;
pub mod runner;

pub use loopback::LoopbackWorker;
pub use retry::{RetryDecision, RetryPolicy, RetryState};
pub use runner::WorkerRunner;

/// Error codes produced by the bridge itself rather than the capability.
pub mod codes {
    /// A processing attempt exceeded the configured deadline.
    pub const DEADLINE_EXCEEDED: &str = "DEADLINE_EXCEEDED";
    /// The request failed validation at worker ingestion.
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
}

/// Opaque failure reported by the capability.
///
/// Carries no retry-safety or partial-result semantics: every failure is
/// treated the same way by the runner.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct WorkerError {
    pub code: String,
    pub message: String,
}

impl WorkerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// The processing capability behind the bridge.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Process one request payload.
    async fn process(&self, payload: &WorkPayload) -> Result<WorkResult, WorkerError>;

    /// Side-effect-free readiness probe.
    async fn health_check(&self) -> Result<(), WorkerError>;
}
