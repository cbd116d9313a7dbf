//! Langbridge - request/response over a partitioned message bus
//!
//! Callers dispatch translation and summarization requests onto request
//! topics and await a future bound to a correlation id. Workers consume
//! those topics, call an opaque processing capability with retry and
//! dead-lettering, and answer on response topics, where a router completes
//! the waiting futures.

pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod dlq;
pub mod envelope;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod router;
pub mod topics;
pub mod tracker;
pub mod utils;
pub mod validation;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_utils;

pub use dispatcher::{PendingReply, RequestDispatcher};
pub use envelope::{RequestEnvelope, ResponseEnvelope, WorkPayload, WorkRequest, WorkResult};
pub use error::{BridgeError, ErrorKind, Result};
pub use router::ResponseRouter;
pub use tracker::CorrelationTracker;
pub use worker::{Worker, WorkerError, WorkerRunner};
