//! User activity events and system metrics published onto the bus.
//!
//! Both are fire-and-forget from the bridge's point of view: a failed
//! publish is logged and reported to the caller, never retried beyond the
//! transport's own policy.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::bus::{publish_with_retry, MessageBus, TransportRetryConfig};
use crate::envelope::encode_message;
use crate::error::Result;
use crate::topics::TopicConfig;

/// Something a user did, published to the user events topic keyed by user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEvent {
    pub event_id: Uuid,
    pub user_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl UserEvent {
    pub fn new(user_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            user_id: user_id.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// A single metric sample, published to the system metrics topic keyed by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetric {
    pub metric_name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub service: String,
}

impl SystemMetric {
    pub fn new(metric_name: impl Into<String>, value: f64, service: impl Into<String>) -> Self {
        Self {
            metric_name: metric_name.into(),
            value,
            timestamp: Utc::now(),
            labels: HashMap::new(),
            service: service.into(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Publishes [`UserEvent`]s and [`SystemMetric`]s.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn MessageBus>,
    user_events_topic: String,
    system_metrics_topic: String,
    service_name: String,
    transport_retry: TransportRetryConfig,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn MessageBus>, topics: &TopicConfig, service_name: impl Into<String>) -> Self {
        Self {
            bus,
            user_events_topic: topics.user_events.clone(),
            system_metrics_topic: topics.system_metrics.clone(),
            service_name: service_name.into(),
            transport_retry: TransportRetryConfig::default(),
        }
    }

    pub fn with_transport_retry(mut self, transport_retry: TransportRetryConfig) -> Self {
        self.transport_retry = transport_retry;
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub async fn publish_user_event(&self, event: &UserEvent) -> Result<()> {
        let message = encode_message(
            &self.user_events_topic,
            &event.user_id,
            &self.service_name,
            None,
            event,
        )?;
        publish_with_retry(self.bus.as_ref(), message, &self.transport_retry).await?;
        debug!(user_id = %event.user_id, event_type = %event.event_type, "User event published");
        Ok(())
    }

    pub async fn publish_metric(&self, metric: &SystemMetric) -> Result<()> {
        let message = encode_message(
            &self.system_metrics_topic,
            &metric.metric_name,
            &self.service_name,
            None,
            metric,
        )?;
        publish_with_retry(self.bus.as_ref(), message, &self.transport_retry).await?;
        debug!(metric = %metric.metric_name, value = metric.value, "System metric published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;
    use crate::error::BridgeError;

    fn publisher(bus: Arc<MockBus>) -> EventPublisher {
        EventPublisher::new(bus, &TopicConfig::default(), "langbridge")
            .with_transport_retry(TransportRetryConfig::none())
    }

    #[tokio::test]
    async fn test_user_event_keyed_by_user() {
        let bus = Arc::new(MockBus::new());
        let event = UserEvent::new("user-7", "translation_requested")
            .with_details(serde_json::json!({"target_language": "ar"}));

        publisher(bus.clone()).publish_user_event(&event).await.unwrap();

        let published = bus.published_to("user-events").await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key.as_deref(), Some("user-7"));
        let decoded: UserEvent = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(decoded, event);
    }

    #[tokio::test]
    async fn test_metric_keyed_by_name() {
        let bus = Arc::new(MockBus::new());
        let metric = SystemMetric::new("translation_request_completed", 42.0, "langbridge")
            .with_label("language_pair", "en-ar");

        publisher(bus.clone()).publish_metric(&metric).await.unwrap();

        let published = bus.published_to("system-metrics").await;
        assert_eq!(published[0].key.as_deref(), Some("translation_request_completed"));
        let decoded: SystemMetric = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(decoded.labels.get("language_pair").map(String::as_str), Some("en-ar"));
        assert_eq!(decoded.service, "langbridge");
    }

    #[tokio::test]
    async fn test_publish_failure_surfaces_as_transport() {
        let bus = Arc::new(MockBus::new());
        bus.set_fail_on_publish(true).await;

        let result = publisher(bus)
            .publish_user_event(&UserEvent::new("user-1", "login"))
            .await;
        assert!(matches!(result, Err(BridgeError::Transport(_))));
    }
}
