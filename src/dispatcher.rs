//! Request dispatcher: the caller's side of the bridge.
//!
//! `dispatch` validates a request, registers it with the correlation
//! tracker, then publishes it. Registration happens before publish so a
//! fast response can never arrive ahead of its waiter. Dropping the
//! returned [`PendingReply`] stops waiting locally; nothing is sent
//! upstream and the worker still answers into the void.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::bus::{publish_with_retry, MessageBus, TransportRetryConfig};
use crate::config::{DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_SERVICE_NAME};
use crate::envelope::{WorkRequest, WorkResult};
use crate::error::{BridgeError, ErrorKind, Result};
use crate::events::{EventPublisher, UserEvent};
use crate::metrics::{MetricsSink, PrometheusMetrics, RequestLabels};
use crate::topics::TopicConfig;
use crate::tracker::{CorrelationTracker, PendingResponse};
use crate::validation::{validate_request, ValidationLimits};

/// Default time a caller waits for a response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS);

/// Publishes requests and hands back futures for their responses.
///
/// Cloning is cheap; clones share the tracker.
#[derive(Clone)]
pub struct RequestDispatcher {
    bus: Arc<dyn MessageBus>,
    tracker: CorrelationTracker,
    topics: TopicConfig,
    limits: ValidationLimits,
    default_timeout: Duration,
    transport_retry: TransportRetryConfig,
    metrics: Arc<dyn MetricsSink>,
    events: Option<EventPublisher>,
    service_name: String,
}

impl RequestDispatcher {
    pub fn new(bus: Arc<dyn MessageBus>, tracker: CorrelationTracker) -> Self {
        Self {
            bus,
            tracker,
            topics: TopicConfig::default(),
            limits: ValidationLimits::default(),
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            transport_retry: TransportRetryConfig::default(),
            metrics: Arc::new(PrometheusMetrics::new()),
            events: None,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }

    pub fn with_topics(mut self, topics: TopicConfig) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_limits(mut self, limits: ValidationLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_transport_retry(mut self, transport_retry: TransportRetryConfig) -> Self {
        self.transport_retry = transport_retry;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Publish a `<operation>_requested` user event for every dispatched request.
    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    pub fn tracker(&self) -> &CorrelationTracker {
        &self.tracker
    }

    /// Validate, register and publish `request`.
    ///
    /// `timeout` falls back to the dispatcher default. Fails with
    /// `Validation` before anything is published, or `Transport` if the
    /// publish failed after the transport's retries.
    #[tracing::instrument(name = "dispatcher.dispatch", skip_all, fields(user_id = %request.user_id))]
    pub async fn dispatch(
        &self,
        request: WorkRequest,
        timeout: Option<Duration>,
    ) -> Result<PendingReply> {
        let envelope = request.into_envelope();
        let labels = envelope.labels();
        let correlation_id = envelope.correlation_id;

        if let Err(e) = validate_request(&envelope, &self.limits) {
            debug!(correlation_id = %correlation_id, error = %e, "Request rejected");
            self.metrics.request_failed(&labels, ErrorKind::Validation);
            return Err(e);
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        let pending = self.tracker.track(correlation_id, timeout)?;

        let topic = self.topics.request_topic(envelope.operation());
        let message = envelope.to_message(&topic, &self.service_name)?;
        if let Err(e) = publish_with_retry(self.bus.as_ref(), message, &self.transport_retry).await
        {
            self.tracker.cancel(correlation_id);
            error!(correlation_id = %correlation_id, topic = %topic, error = %e, "Failed to publish request");
            self.metrics.request_failed(&labels, ErrorKind::Transport);
            return Err(BridgeError::Transport(e));
        }

        debug!(correlation_id = %correlation_id, topic = %topic, timeout = ?timeout, "Request dispatched");
        self.metrics.request_dispatched(&labels);

        if let Some(events) = &self.events {
            let event = UserEvent::new(
                envelope.user_id.clone(),
                format!("{}_requested", envelope.operation()),
            )
            .with_details(serde_json::json!({
                "correlation_id": correlation_id,
                "priority": envelope.priority,
            }));
            if let Err(e) = events.publish_user_event(&event).await {
                warn!(correlation_id = %correlation_id, error = %e, "Failed to publish user event");
            }
        }

        Ok(PendingReply {
            inner: pending,
            labels,
            metrics: Arc::clone(&self.metrics),
        })
    }

    /// Dispatch and wait for the outcome.
    pub async fn submit(&self, request: WorkRequest, timeout: Option<Duration>) -> Result<WorkResult> {
        self.dispatch(request, timeout).await?.await
    }
}

/// The caller's handle on one dispatched request.
///
/// Resolves to the worker's result, `WorkerFailure` for a terminal error
/// response, or `Timeout`. Dropping it cancels the wait.
#[must_use = "dropping a PendingReply cancels the wait"]
pub struct PendingReply {
    inner: PendingResponse,
    labels: RequestLabels,
    metrics: Arc<dyn MetricsSink>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> Uuid {
        self.inner.correlation_id()
    }
}

impl Future for PendingReply {
    type Output = Result<WorkResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let response = match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(response) => response,
            Poll::Pending => return Poll::Pending,
        };

        let outcome = response.and_then(|r| r.into_result());
        if let Err(e) = &outcome {
            self.metrics.request_failed(&self.labels, e.kind());
        }
        Poll::Ready(outcome)
    }
}
