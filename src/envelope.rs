//! Wire envelopes exchanged over the bus.
//!
//! Envelopes are JSON objects with `snake_case` fields and RFC 3339
//! timestamps. A [`RequestEnvelope`] is immutable once published; the
//! worker answers it with exactly one [`ResponseEnvelope`] per terminal
//! outcome.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::OutboundMessage;
use crate::error::{BridgeError, Result};
use crate::metrics::RequestLabels;
use crate::topics::Operation;

/// Header carrying the payload content type.
pub const HEADER_CONTENT_TYPE: &str = "content-type";
/// Header carrying the publishing service name.
pub const HEADER_SOURCE: &str = "source";
/// Header carrying the correlation id, when the payload has one.
pub const HEADER_CORRELATION_ID: &str = "correlation-id";
/// Content type of every envelope.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Request priority. Carried end to end, not interpreted by the bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// Summary length style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryType {
    Short,
    Detailed,
}

/// Domain fields of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum WorkPayload {
    Translation {
        text: String,
        source_language: String,
        target_language: String,
    },
    Summarization {
        text: String,
        summary_type: SummaryType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<u32>,
    },
}

impl WorkPayload {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Translation { .. } => Operation::Translation,
            Self::Summarization { .. } => Operation::Summarization,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Translation { text, .. } | Self::Summarization { text, .. } => text,
        }
    }

    /// Source and target language, for operations that have them.
    pub fn languages(&self) -> Option<(&str, &str)> {
        match self {
            Self::Translation {
                source_language,
                target_language,
                ..
            } => Some((source_language, target_language)),
            Self::Summarization { .. } => None,
        }
    }
}

/// Domain result of a successfully processed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum WorkResult {
    Translation {
        translated_text: String,
    },
    Summarization {
        summarized_text: String,
        original_length: usize,
        summary_length: usize,
    },
}

impl WorkResult {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Translation { .. } => Operation::Translation,
            Self::Summarization { .. } => Operation::Summarization,
        }
    }

    /// The produced text, whichever operation made it.
    pub fn text(&self) -> &str {
        match self {
            Self::Translation { translated_text } => translated_text,
            Self::Summarization {
                summarized_text, ..
            } => summarized_text,
        }
    }
}

/// Caller input for a request, before it becomes an envelope.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub correlation_id: Option<Uuid>,
    pub user_id: String,
    pub payload: WorkPayload,
    pub priority: Priority,
    pub callback_url: Option<String>,
}

impl WorkRequest {
    pub fn new(user_id: impl Into<String>, payload: WorkPayload) -> Self {
        Self {
            correlation_id: None,
            user_id: user_id.into(),
            payload,
            priority: Priority::default(),
            callback_url: None,
        }
    }

    pub fn translation(
        user_id: impl Into<String>,
        text: impl Into<String>,
        source_language: impl Into<String>,
        target_language: impl Into<String>,
    ) -> Self {
        Self::new(
            user_id,
            WorkPayload::Translation {
                text: text.into(),
                source_language: source_language.into(),
                target_language: target_language.into(),
            },
        )
    }

    pub fn summarization(
        user_id: impl Into<String>,
        text: impl Into<String>,
        summary_type: SummaryType,
        max_length: Option<u32>,
    ) -> Self {
        Self::new(
            user_id,
            WorkPayload::Summarization {
                text: text.into(),
                summary_type,
                max_length,
            },
        )
    }

    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    /// Build the envelope, generating a correlation id if none was given.
    pub fn into_envelope(self) -> RequestEnvelope {
        RequestEnvelope {
            correlation_id: self.correlation_id.unwrap_or_else(Uuid::new_v4),
            user_id: self.user_id,
            payload: self.payload,
            created_at: Utc::now(),
            priority: self.priority,
            callback_url: self.callback_url,
        }
    }
}

/// A request as published on a `{domain}-requests` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub correlation_id: Uuid,
    pub user_id: String,
    pub payload: WorkPayload,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

impl RequestEnvelope {
    pub fn operation(&self) -> Operation {
        self.payload.operation()
    }

    pub fn labels(&self) -> RequestLabels {
        RequestLabels::from_languages(self.operation(), self.payload.languages())
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Encode into a bus message on `topic`, keyed by user id.
    pub fn to_message(&self, topic: &str, source: &str) -> Result<OutboundMessage> {
        encode_message(topic, &self.user_id, source, Some(self.correlation_id), self)
    }
}

/// Terminal status of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Structured error attached to an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// A response as published on a `{domain}-responses` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub correlation_id: Uuid,
    pub user_id: String,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,
    #[serde(default)]
    pub result: Option<WorkResult>,
    pub processing_time_ms: u64,
    pub completed_at: DateTime<Utc>,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseEnvelope {
    fn for_request(request: &RequestEnvelope, processing_time_ms: u64) -> Self {
        let (source_language, target_language) = match request.payload.languages() {
            Some((s, t)) => (Some(s.to_string()), Some(t.to_string())),
            None => (None, None),
        };
        Self {
            correlation_id: request.correlation_id,
            user_id: request.user_id.clone(),
            operation: request.operation(),
            source_language,
            target_language,
            result: None,
            processing_time_ms,
            completed_at: Utc::now(),
            status: ResponseStatus::Success,
            error: None,
        }
    }

    /// Successful response to `request`.
    pub fn success(request: &RequestEnvelope, result: WorkResult, processing_time_ms: u64) -> Self {
        Self {
            result: Some(result),
            ..Self::for_request(request, processing_time_ms)
        }
    }

    /// Error response to `request`.
    pub fn failure(
        request: &RequestEnvelope,
        code: impl Into<String>,
        message: impl Into<String>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(ErrorBody {
                code: code.into(),
                message: message.into(),
            }),
            ..Self::for_request(request, processing_time_ms)
        }
    }

    pub fn labels(&self) -> RequestLabels {
        let languages = match (&self.source_language, &self.target_language) {
            (Some(s), Some(t)) => Some((s.as_str(), t.as_str())),
            _ => None,
        };
        RequestLabels::from_languages(self.operation, languages)
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Convert into the caller-facing outcome.
    pub fn into_result(self) -> Result<WorkResult> {
        match self.status {
            ResponseStatus::Success => self.result.ok_or_else(|| {
                BridgeError::DecodeFailure("success response carries no result".to_string())
            }),
            ResponseStatus::Error => {
                let body = self.error.unwrap_or_else(|| ErrorBody {
                    code: "UNKNOWN".to_string(),
                    message: "worker reported an error without details".to_string(),
                });
                Err(BridgeError::WorkerFailure {
                    code: body.code,
                    message: body.message,
                })
            }
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Encode into a bus message on `topic`, keyed by user id.
    pub fn to_message(&self, topic: &str, source: &str) -> Result<OutboundMessage> {
        encode_message(topic, &self.user_id, source, Some(self.correlation_id), self)
    }
}

/// Serialize `value` as JSON into an [`OutboundMessage`] with the standard headers.
pub fn encode_message<T: Serialize>(
    topic: &str,
    key: &str,
    source: &str,
    correlation_id: Option<Uuid>,
    value: &T,
) -> Result<OutboundMessage> {
    let payload = serde_json::to_vec(value).map_err(|e| {
        BridgeError::validation("payload", format!("failed to serialize message: {}", e))
    })?;

    let mut headers = HashMap::new();
    headers.insert(HEADER_CONTENT_TYPE.to_string(), JSON_CONTENT_TYPE.to_string());
    headers.insert(HEADER_SOURCE.to_string(), source.to_string());
    if let Some(id) = correlation_id {
        headers.insert(HEADER_CORRELATION_ID.to_string(), id.to_string());
    }

    Ok(OutboundMessage {
        topic: topic.to_string(),
        key: Some(key.to_string()),
        payload: Bytes::from(payload),
        headers,
    })
}
