//! Dead Letter Queue (DLQ) infrastructure.
//!
//! Requests that cannot be processed end up here: payloads that fail to
//! decode, envelopes that fail validation at worker ingestion, and requests
//! whose worker retries are exhausted. Records are written once and never
//! consumed by the bridge itself.
//!
//! ## Message Format
//!
//! A [`DeadLetterRecord`] is published as JSON on the configured dead-letter
//! topic (default `dead-letter`), keyed by correlation id when known. The
//! original message is embedded as JSON when it parses, otherwise as a
//! lossy UTF-8 string.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use crate::bus::{publish_with_retry, BusError, Delivery, MessageBus, TransportRetryConfig};
use crate::envelope::encode_message;

/// Errors that can occur during DLQ operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Failed to serialize dead letter: {0}")]
    Serialization(String),

    #[error("Failed to publish to DLQ: {0}")]
    PublishFailed(String),

    #[error("Transport error: {0}")]
    Transport(#[from] BusError),
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Payload was not a decodable request envelope.
    DecodeFailure,
    /// Envelope decoded but failed validation.
    InvalidRequest,
    /// Every processing attempt failed.
    RetriesExhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DecodeFailure => "decode_failure",
            Self::InvalidRequest => "invalid_request",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }
}

/// Terminal record of a message removed from normal processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub reason: DeadLetterReason,
    /// Correlation id, when the payload decoded far enough to have one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub source_topic: String,
    pub source_partition: i32,
    pub source_offset: i64,
    pub original_message: serde_json::Value,
    pub last_error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub failed_attempts: u32,
    pub first_seen_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
    /// Service that routed the message here.
    pub source_component: String,
}

impl DeadLetterRecord {
    fn from_delivery(
        delivery: &Delivery,
        reason: DeadLetterReason,
        last_error: String,
        first_seen_at: DateTime<Utc>,
        source_component: &str,
    ) -> Self {
        Self {
            reason,
            correlation_id: None,
            source_topic: delivery.topic.clone(),
            source_partition: delivery.partition,
            source_offset: delivery.offset,
            original_message: original_message(&delivery.payload),
            last_error,
            error_code: None,
            failed_attempts: 0,
            first_seen_at,
            dead_lettered_at: Utc::now(),
            source_component: source_component.to_string(),
        }
    }

    /// A payload that could not be decoded. Never retried.
    pub fn decode_failure(delivery: &Delivery, error: &str, source_component: &str) -> Self {
        Self::from_delivery(
            delivery,
            DeadLetterReason::DecodeFailure,
            error.to_string(),
            Utc::now(),
            source_component,
        )
    }

    /// An envelope that decoded but failed validation. Never retried.
    pub fn invalid_request(
        delivery: &Delivery,
        correlation_id: Uuid,
        error: &str,
        source_component: &str,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::from_delivery(
                delivery,
                DeadLetterReason::InvalidRequest,
                error.to_string(),
                Utc::now(),
                source_component,
            )
        }
    }

    /// A request whose processing attempts all failed.
    pub fn retries_exhausted(
        delivery: &Delivery,
        correlation_id: Uuid,
        error_code: &str,
        last_error: &str,
        failed_attempts: u32,
        first_seen_at: DateTime<Utc>,
        source_component: &str,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            error_code: Some(error_code.to_string()),
            failed_attempts,
            ..Self::from_delivery(
                delivery,
                DeadLetterReason::RetriesExhausted,
                last_error.to_string(),
                first_seen_at,
                source_component,
            )
        }
    }

    /// Partition key for the dead-letter topic.
    pub fn key(&self) -> String {
        match self.correlation_id {
            Some(id) => id.to_string(),
            None => format!("{}-{}-{}", self.source_topic, self.source_partition, self.source_offset),
        }
    }
}

fn original_message(payload: &[u8]) -> serde_json::Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(payload).into_owned()))
}

/// Trait for publishing messages to a dead letter queue.
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    /// Publish a dead letter to the queue.
    async fn publish(&self, record: DeadLetterRecord) -> Result<(), DlqError>;
}

/// DLQ publisher that writes records to a topic on the message bus.
pub struct BusDeadLetterPublisher {
    bus: Arc<dyn MessageBus>,
    topic: String,
    source: String,
    retry: TransportRetryConfig,
}

impl BusDeadLetterPublisher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        topic: impl Into<String>,
        source: impl Into<String>,
        retry: TransportRetryConfig,
    ) -> Self {
        Self {
            bus,
            topic: topic.into(),
            source: source.into(),
            retry,
        }
    }
}

#[async_trait]
impl DeadLetterPublisher for BusDeadLetterPublisher {
    async fn publish(&self, record: DeadLetterRecord) -> Result<(), DlqError> {
        let mut message = encode_message(
            &self.topic,
            &record.key(),
            &self.source,
            record.correlation_id,
            &record,
        )
        .map_err(|e| DlqError::Serialization(e.to_string()))?;
        message.headers.extend(record_headers(&record));

        publish_with_retry(self.bus.as_ref(), message, &self.retry).await?;

        error!(
            topic = %self.topic,
            reason = record.reason.as_str(),
            correlation_id = ?record.correlation_id,
            source_topic = %record.source_topic,
            failed_attempts = record.failed_attempts,
            last_error = %record.last_error,
            "Message dead-lettered"
        );
        Ok(())
    }
}

/// In-memory DLQ publisher using a channel.
///
/// Used for testing and for embedding the runner without a dead-letter topic.
pub struct ChannelDeadLetterPublisher {
    sender: mpsc::UnboundedSender<DeadLetterRecord>,
}

impl ChannelDeadLetterPublisher {
    /// Create a new channel-based DLQ publisher.
    ///
    /// Returns the publisher and a receiver for consuming dead letters.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetterRecord>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterPublisher for ChannelDeadLetterPublisher {
    async fn publish(&self, record: DeadLetterRecord) -> Result<(), DlqError> {
        info!(
            reason = record.reason.as_str(),
            correlation_id = ?record.correlation_id,
            "Publishing to channel DLQ"
        );
        self.sender
            .send(record)
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }
}

/// Headers carried alongside a dead letter, for consumers that filter on them.
pub fn record_headers(record: &DeadLetterRecord) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert("dead-letter-reason".to_string(), record.reason.as_str().to_string());
    headers.insert(
        "failed-attempts".to_string(),
        record.failed_attempts.to_string(),
    );
    headers
}
