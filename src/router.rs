//! Response router: feeds consumed responses into the correlation tracker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::bus::{BusError, Delivery, MessageBus, MessageHandler, Outcome, Subscription};
use crate::envelope::ResponseEnvelope;
use crate::events::{EventPublisher, SystemMetric};
use crate::metrics::{MetricsSink, PrometheusMetrics};
use crate::topics::TopicConfig;
use crate::tracker::{CorrelationTracker, Resolution};

/// Consumes response topics and completes pending waiters.
///
/// Malformed payloads and responses nobody is waiting for are acked and
/// dropped; the consume loop never stops on bad input.
pub struct ResponseRouter {
    tracker: CorrelationTracker,
    topics: TopicConfig,
    metrics: Arc<dyn MetricsSink>,
    events: Option<EventPublisher>,
}

impl ResponseRouter {
    pub fn new(tracker: CorrelationTracker) -> Self {
        Self {
            tracker,
            topics: TopicConfig::default(),
            metrics: Arc::new(PrometheusMetrics::new()),
            events: None,
        }
    }

    pub fn with_topics(mut self, topics: TopicConfig) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Publish a `<operation>_request_completed` system metric per matched response.
    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    /// Subscribe consumer group `group` to every response topic.
    pub async fn start(
        self: Arc<Self>,
        bus: &dyn MessageBus,
        group: &str,
    ) -> Result<Subscription, BusError> {
        let topics = self.topics.response_topics();
        let subscription = bus.subscribe(group, &topics, self).await?;
        info!(group = %group, topics = ?topics, "Response router started");
        Ok(subscription)
    }

    async fn publish_completion(&self, response: &ResponseEnvelope, latency: Duration) {
        let Some(events) = &self.events else {
            return;
        };
        let labels = response.labels();
        let metric = SystemMetric::new(
            format!("{}_request_completed", response.operation),
            latency.as_secs_f64() * 1_000.0,
            events.service_name(),
        )
        .with_label("status", response.status.as_str())
        .with_label("language_pair", labels.language_pair());

        if let Err(e) = events.publish_metric(&metric).await {
            warn!(correlation_id = %response.correlation_id, error = %e, "Failed to publish system metric");
        }
    }
}

#[async_trait]
impl MessageHandler for ResponseRouter {
    #[tracing::instrument(
        name = "router.handle",
        skip_all,
        fields(topic = %delivery.topic, partition = delivery.partition, offset = delivery.offset)
    )]
    async fn handle(&self, delivery: &Delivery) -> Outcome {
        let response = match ResponseEnvelope::decode(&delivery.payload) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Malformed response, skipping");
                self.metrics.malformed_message(&delivery.topic);
                return Outcome::Ack;
            }
        };

        let correlation_id = response.correlation_id;
        let labels = response.labels();
        let status = response.status;
        let completed_at = response.completed_at;

        // The tracker consumes the envelope; keep a copy only when it is needed.
        let snapshot = self.events.as_ref().map(|_| response.clone());

        self.metrics.request_completed(&labels, status);
        match self.tracker.resolve(correlation_id, response) {
            Resolution::Matched { issued_at, waited } => {
                let latency = (completed_at - issued_at).to_std().unwrap_or(waited);
                debug!(correlation_id = %correlation_id, latency = ?latency, "Response matched");
                self.metrics.observe_latency(&labels, latency);
                if let Some(response) = snapshot {
                    self.publish_completion(&response, latency).await;
                }
            }
            Resolution::Unmatched => {
                self.metrics.unmatched_response(&labels);
            }
        }
        Outcome::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MockBus, TransportRetryConfig};
    use crate::envelope::{ResponseStatus, WorkRequest, WorkResult};
    use crate::error::BridgeError;
    use crate::metrics::{MemoryMetrics, MetricEvent};

    const RESPONSES: &str = "translation-responses";
    const TIMEOUT: Duration = Duration::from_millis(30_000);

    struct Fixture {
        bus: Arc<MockBus>,
        tracker: CorrelationTracker,
        metrics: Arc<MemoryMetrics>,
        _subscription: Subscription,
    }

    async fn fixture(publish_to_bus: bool) -> Fixture {
        let bus = Arc::new(MockBus::new());
        let tracker = CorrelationTracker::new();
        let metrics = Arc::new(MemoryMetrics::new());
        let mut router = ResponseRouter::new(tracker.clone()).with_metrics(metrics.clone());
        if publish_to_bus {
            router = router.with_events(
                EventPublisher::new(bus.clone(), &TopicConfig::default(), "langbridge")
                    .with_transport_retry(TransportRetryConfig::none()),
            );
        }
        let subscription = Arc::new(router)
            .start(bus.as_ref(), "langbridge-router")
            .await
            .unwrap();
        Fixture {
            bus,
            tracker,
            metrics,
            _subscription: subscription,
        }
    }

    fn success_payload(correlation_id: uuid::Uuid, text: &str) -> Vec<u8> {
        let request = WorkRequest::translation("user-1", "Hello", "en", "ar")
            .with_correlation_id(correlation_id)
            .into_envelope();
        let response = ResponseEnvelope::success(
            &request,
            WorkResult::Translation {
                translated_text: text.to_string(),
            },
            5,
        );
        serde_json::to_vec(&response).unwrap()
    }

    #[tokio::test]
    async fn test_matching_response_resolves_waiter() {
        let f = fixture(false).await;
        let id = uuid::Uuid::new_v4();
        let pending = f.tracker.track(id, TIMEOUT).unwrap();

        let outcome = f
            .bus
            .deliver(RESPONSES, Some("user-1"), &success_payload(id, "مرحبا"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Ack);

        let response = pending.await.unwrap();
        assert_eq!(response.into_result().unwrap().text(), "مرحبا");
        assert_eq!(f.metrics.count(|e| matches!(e, MetricEvent::Latency(..))), 1);
        assert_eq!(
            f.metrics
                .count(|e| matches!(e, MetricEvent::Completed(_, ResponseStatus::Success))),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_response_acked_without_latency() {
        let f = fixture(false).await;
        let outcome = f
            .bus
            .deliver(RESPONSES, None, &success_payload(uuid::Uuid::new_v4(), "x"))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Ack);
        assert_eq!(f.metrics.count(|e| matches!(e, MetricEvent::Unmatched(_))), 1);
        assert_eq!(f.metrics.count(|e| matches!(e, MetricEvent::Latency(..))), 0);
        // Completion volume is counted whether or not anyone was waiting.
        assert_eq!(f.metrics.count(|e| matches!(e, MetricEvent::Completed(..))), 1);
    }

    #[tokio::test]
    async fn test_unmatched_response_with_bogus_languages_labelled_none() {
        let f = fixture(false).await;
        let mut response: ResponseEnvelope =
            serde_json::from_slice(&success_payload(uuid::Uuid::new_v4(), "x")).unwrap();
        response.source_language = Some("x-evil-1".to_string());
        response.target_language = Some("ar".to_string());

        f.bus
            .deliver(RESPONSES, None, &serde_json::to_vec(&response).unwrap())
            .await
            .unwrap();

        let labelled = |e: &MetricEvent| match e {
            MetricEvent::Completed(labels, _) | MetricEvent::Unmatched(labels) => {
                Some(labels.language_pair())
            }
            _ => None,
        };
        let pairs: Vec<String> = f.metrics.events().iter().filter_map(labelled).collect();
        assert_eq!(pairs, vec!["none".to_string(), "none".to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_response_skipped() {
        let f = fixture(false).await;
        let id = uuid::Uuid::new_v4();
        let pending = f.tracker.track(id, TIMEOUT).unwrap();

        let outcome = f
            .bus
            .deliver(RESPONSES, None, b"\x00\x01 garbage")
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Ack);
        assert_eq!(f.metrics.count(|e| matches!(e, MetricEvent::Malformed(_))), 1);

        // The next good message still gets through.
        f.bus
            .deliver(RESPONSES, None, &success_payload(id, "ok"))
            .await
            .unwrap();
        assert!(pending.await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_response_only_first_delivered() {
        let f = fixture(false).await;
        let id = uuid::Uuid::new_v4();
        let pending = f.tracker.track(id, TIMEOUT).unwrap();

        f.bus
            .deliver(RESPONSES, None, &success_payload(id, "first"))
            .await
            .unwrap();
        f.bus
            .deliver(RESPONSES, None, &success_payload(id, "second"))
            .await
            .unwrap();

        let response = pending.await.unwrap();
        assert_eq!(response.into_result().unwrap().text(), "first");
        assert_eq!(f.metrics.count(|e| matches!(e, MetricEvent::Unmatched(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_after_timeout_is_noop() {
        let f = fixture(false).await;
        let id = uuid::Uuid::new_v4();
        let pending = f.tracker.track(id, Duration::from_millis(100)).unwrap();
        assert!(matches!(pending.await, Err(BridgeError::Timeout { .. })));

        let outcome = f
            .bus
            .deliver(RESPONSES, None, &success_payload(id, "late"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Ack);
        assert_eq!(f.tracker.pending_count(), 0);
        assert_eq!(f.metrics.count(|e| matches!(e, MetricEvent::Unmatched(_))), 1);
    }

    #[tokio::test]
    async fn test_completion_metric_published_when_enabled() {
        let f = fixture(true).await;
        let id = uuid::Uuid::new_v4();
        let _pending = f.tracker.track(id, TIMEOUT).unwrap();

        f.bus
            .deliver(RESPONSES, None, &success_payload(id, "ok"))
            .await
            .unwrap();

        let published = f.bus.published_to("system-metrics").await;
        assert_eq!(published.len(), 1);
        let metric: SystemMetric = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(metric.metric_name, "translation_request_completed");
        assert_eq!(metric.labels.get("status").map(String::as_str), Some("success"));
    }

    #[tokio::test]
    async fn test_unmatched_response_publishes_no_metric() {
        let f = fixture(true).await;
        f.bus
            .deliver(RESPONSES, None, &success_payload(uuid::Uuid::new_v4(), "x"))
            .await
            .unwrap();
        assert!(f.bus.published_to("system-metrics").await.is_empty());
    }
}
