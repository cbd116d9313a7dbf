//! Logical operations and the topics they travel on.
//!
//! Topic naming:
//! - `{domain}-requests` / `{domain}-responses` per operation
//! - `dead-letter`, `system-metrics`, `user-events` shared
//!
//! All names are configurable through [`TopicConfig`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default domain for translation requests.
pub const DEFAULT_TRANSLATION_DOMAIN: &str = "translation";
/// Default domain for summarization requests.
pub const DEFAULT_SUMMARIZATION_DOMAIN: &str = "summarization";
/// Default dead-letter topic.
pub const DEFAULT_DEAD_LETTER_TOPIC: &str = "dead-letter";
/// Default system metrics topic.
pub const DEFAULT_SYSTEM_METRICS_TOPIC: &str = "system-metrics";
/// Default user events topic.
pub const DEFAULT_USER_EVENTS_TOPIC: &str = "user-events";

/// A logical operation the bridge can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Translation,
    Summarization,
}

impl Operation {
    /// All operations, in a stable order.
    pub const ALL: [Operation; 2] = [Operation::Translation, Operation::Summarization];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Translation => "translation",
            Self::Summarization => "summarization",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topic name configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Domain used to build translation topic names.
    pub translation_domain: String,
    /// Domain used to build summarization topic names.
    pub summarization_domain: String,
    /// Terminal sink for undeliverable requests.
    pub dead_letter: String,
    /// Topic for published system metrics.
    pub system_metrics: String,
    /// Topic for user activity events.
    pub user_events: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            translation_domain: DEFAULT_TRANSLATION_DOMAIN.to_string(),
            summarization_domain: DEFAULT_SUMMARIZATION_DOMAIN.to_string(),
            dead_letter: DEFAULT_DEAD_LETTER_TOPIC.to_string(),
            system_metrics: DEFAULT_SYSTEM_METRICS_TOPIC.to_string(),
            user_events: DEFAULT_USER_EVENTS_TOPIC.to_string(),
        }
    }
}

impl TopicConfig {
    /// Domain name for an operation.
    pub fn domain(&self, operation: Operation) -> &str {
        match operation {
            Operation::Translation => &self.translation_domain,
            Operation::Summarization => &self.summarization_domain,
        }
    }

    /// Topic carrying requests for an operation.
    pub fn request_topic(&self, operation: Operation) -> String {
        format!("{}-requests", self.domain(operation))
    }

    /// Topic carrying responses for an operation.
    pub fn response_topic(&self, operation: Operation) -> String {
        format!("{}-responses", self.domain(operation))
    }

    /// Request topics for every operation.
    pub fn request_topics(&self) -> Vec<String> {
        Operation::ALL
            .iter()
            .map(|op| self.request_topic(*op))
            .collect()
    }

    /// Response topics for every operation.
    pub fn response_topics(&self) -> Vec<String> {
        Operation::ALL
            .iter()
            .map(|op| self.response_topic(*op))
            .collect()
    }

    /// Reverse lookup: which operation does a request or response topic belong to.
    pub fn operation_for_topic(&self, topic: &str) -> Option<Operation> {
        Operation::ALL.into_iter().find(|op| {
            topic == self.request_topic(*op) || topic == self.response_topic(*op)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_topic_names() {
        let topics = TopicConfig::default();
        assert_eq!(
            topics.request_topic(Operation::Translation),
            "translation-requests"
        );
        assert_eq!(
            topics.response_topic(Operation::Summarization),
            "summarization-responses"
        );
        assert_eq!(topics.dead_letter, "dead-letter");
        assert_eq!(topics.system_metrics, "system-metrics");
        assert_eq!(topics.user_events, "user-events");
    }

    #[test]
    fn test_custom_domain() {
        let topics = TopicConfig {
            translation_domain: "mt".to_string(),
            ..Default::default()
        };
        assert_eq!(topics.request_topic(Operation::Translation), "mt-requests");
        assert_eq!(
            topics.operation_for_topic("mt-responses"),
            Some(Operation::Translation)
        );
    }

    #[test]
    fn test_operation_for_unknown_topic() {
        let topics = TopicConfig::default();
        assert_eq!(topics.operation_for_topic("dead-letter"), None);
        assert_eq!(
            topics.operation_for_topic("summarization-requests"),
            Some(Operation::Summarization)
        );
    }

    #[test]
    fn test_operation_serde() {
        let json = serde_json::to_string(&Operation::Summarization).unwrap();
        assert_eq!(json, "\"summarization\"");
    }
}
