//! Worker runner: consumes requests and publishes terminal responses.
//!
//! Per message:
//!
//! ```text
//! Received -> Processing -> Succeeded
//!                 |
//!                 v
//!          Failed(attempt) -> Retrying -> Processing
//!                 |
//!                 v
//!           DeadLettered
//! ```
//!
//! Malformed or invalid requests skip straight to dead-lettering. Retries
//! are driven here, never by the transport's redelivery, and the backoff
//! sleep only holds up the partition the message arrived on.
//!
//! Once a message reaches a terminal state it is always acked. A response
//! or dead-letter record that cannot be published after the transport retry
//! policy is logged and counted, then dropped; the caller's timeout bounds
//! the wait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::codes;
use super::retry::{RetryDecision, RetryPolicy};
use super::{Worker, WorkerError};
use crate::bus::{
    publish_with_retry, BusError, Delivery, MessageBus, MessageHandler, Outcome, Subscription,
    TransportRetryConfig,
};
use crate::config::DEFAULT_SERVICE_NAME;
use crate::dlq::{DeadLetterPublisher, DeadLetterRecord};
use crate::envelope::{RequestEnvelope, ResponseEnvelope, ResponseStatus, WorkResult};
use crate::error::ErrorKind;
use crate::metrics::{MetricsSink, PrometheusMetrics};
use crate::topics::TopicConfig;
use crate::validation::{validate_request, ValidationLimits};

/// Where one message's processing currently stands.
enum Step {
    Processing,
    Failed(WorkerError),
    Retrying(Duration),
}

/// How one message's processing ended.
enum Terminal {
    Succeeded(WorkResult),
    DeadLettered {
        error: WorkerError,
        failed_attempts: u32,
    },
}

/// Consumes request topics and answers each request exactly once.
pub struct WorkerRunner {
    worker: Arc<dyn Worker>,
    bus: Arc<dyn MessageBus>,
    dlq: Arc<dyn DeadLetterPublisher>,
    metrics: Arc<dyn MetricsSink>,
    topics: TopicConfig,
    limits: ValidationLimits,
    retry: RetryPolicy,
    transport_retry: TransportRetryConfig,
    readiness: Option<watch::Receiver<bool>>,
    service_name: String,
}

impl WorkerRunner {
    pub fn new(
        worker: Arc<dyn Worker>,
        bus: Arc<dyn MessageBus>,
        dlq: Arc<dyn DeadLetterPublisher>,
    ) -> Self {
        Self {
            worker,
            bus,
            dlq,
            metrics: Arc::new(PrometheusMetrics::new()),
            topics: TopicConfig::default(),
            limits: ValidationLimits::default(),
            retry: RetryPolicy::default(),
            transport_retry: TransportRetryConfig::default(),
            readiness: None,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_topics(mut self, topics: TopicConfig) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_limits(mut self, limits: ValidationLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_transport_retry(mut self, transport_retry: TransportRetryConfig) -> Self {
        self.transport_retry = transport_retry;
        self
    }

    /// Hold each message until the capability reports ready.
    pub fn with_readiness(mut self, readiness: watch::Receiver<bool>) -> Self {
        self.readiness = Some(readiness);
        self
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Subscribe consumer group `group` to every request topic.
    pub async fn start(self: Arc<Self>, group: &str) -> Result<Subscription, BusError> {
        let topics = self.topics.request_topics();
        let bus = Arc::clone(&self.bus);
        let subscription = bus.subscribe(group, &topics, self).await?;
        info!(group = %group, topics = ?topics, "Worker runner started");
        Ok(subscription)
    }

    async fn wait_until_ready(&self) {
        let Some(readiness) = &self.readiness else {
            return;
        };
        let mut readiness = readiness.clone();
        if !*readiness.borrow() {
            info!("Worker not ready, holding consumption");
        }
        if readiness.wait_for(|ready| *ready).await.is_err() {
            debug!("Readiness source gone, continuing without gate");
        }
    }

    /// One bounded call into the capability.
    async fn attempt(&self, request: &RequestEnvelope) -> Result<WorkResult, WorkerError> {
        let deadline = self.retry.processing_deadline();
        match tokio::time::timeout(deadline, self.worker.process(&request.payload)).await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::new(
                codes::DEADLINE_EXCEEDED,
                format!("processing exceeded {:?}", deadline),
            )),
        }
    }

    /// Run the retry state machine to a terminal state.
    async fn process(&self, request: &RequestEnvelope) -> Terminal {
        let labels = request.labels();
        let mut retry = self.retry.start();
        let mut step = Step::Processing;

        loop {
            step = match step {
                Step::Processing => match self.attempt(request).await {
                    Ok(result) => return Terminal::Succeeded(result),
                    Err(error) => Step::Failed(error),
                },
                Step::Failed(error) => match retry.record_failure() {
                    RetryDecision::Retry { attempt, delay } => {
                        warn!(
                            correlation_id = %request.correlation_id,
                            attempt = attempt,
                            retry_in = ?delay,
                            error = %error,
                            "Processing failed, retrying"
                        );
                        self.metrics.retry_scheduled(&labels, attempt);
                        Step::Retrying(delay)
                    }
                    RetryDecision::DeadLetter { failed_attempts } => {
                        return Terminal::DeadLettered {
                            error,
                            failed_attempts,
                        }
                    }
                },
                Step::Retrying(delay) => {
                    tokio::time::sleep(delay).await;
                    Step::Processing
                }
            };
        }
    }

    /// Publish the terminal response on its operation's response topic.
    ///
    /// Always acks: redelivering would rerun a request that already finished.
    async fn respond(&self, response: &ResponseEnvelope) -> Outcome {
        let topic = self.topics.response_topic(response.operation);
        let published = match response.to_message(&topic, &self.service_name) {
            Ok(message) => publish_with_retry(self.bus.as_ref(), message, &self.transport_retry)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        if let Err(e) = published {
            error!(
                correlation_id = %response.correlation_id,
                topic = %topic,
                error = %e,
                "Failed to publish response, dropping it"
            );
            self.metrics.response_lost(&response.labels());
        }
        Outcome::Ack
    }

    async fn dead_letter(&self, record: DeadLetterRecord) {
        let reason = record.reason;
        let correlation_id = record.correlation_id;
        match self.dlq.publish(record).await {
            Ok(()) => self.metrics.dead_lettered(reason.as_str()),
            Err(e) => {
                error!(
                    reason = reason.as_str(),
                    correlation_id = ?correlation_id,
                    error = %e,
                    "Failed to publish dead letter, record lost"
                );
                self.metrics.dead_letter_failed(reason.as_str());
            }
        }
    }

    async fn reject_undecodable(&self, delivery: &Delivery, error: &str) -> Outcome {
        warn!(
            topic = %delivery.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            error = %error,
            "Malformed request, dead-lettering"
        );
        self.metrics.malformed_message(&delivery.topic);
        let record = DeadLetterRecord::decode_failure(delivery, error, &self.service_name);
        self.dead_letter(record).await;
        Outcome::Ack
    }

    async fn reject_invalid(
        &self,
        delivery: &Delivery,
        request: &RequestEnvelope,
        error: &str,
    ) -> Outcome {
        warn!(
            correlation_id = %request.correlation_id,
            error = %error,
            "Invalid request, dead-lettering"
        );
        let record = DeadLetterRecord::invalid_request(
            delivery,
            request.correlation_id,
            error,
            &self.service_name,
        );
        self.dead_letter(record).await;

        let response = ResponseEnvelope::failure(request, codes::INVALID_REQUEST, error, 0);
        self.metrics
            .request_failed(&request.labels(), ErrorKind::Validation);
        self.respond(&response).await
    }

    async fn finish(
        &self,
        delivery: &Delivery,
        request: &RequestEnvelope,
        terminal: Terminal,
        first_seen_at: DateTime<Utc>,
        started: Instant,
    ) -> Outcome {
        let labels = request.labels();
        let elapsed = started.elapsed();
        let processing_time_ms = elapsed.as_millis() as u64;

        let response = match terminal {
            Terminal::Succeeded(result) => {
                info!(
                    correlation_id = %request.correlation_id,
                    processing_time_ms = processing_time_ms,
                    "Request processed"
                );
                self.metrics
                    .observe_processing(&labels, ResponseStatus::Success, elapsed);
                ResponseEnvelope::success(request, result, processing_time_ms)
            }
            Terminal::DeadLettered {
                error,
                failed_attempts,
            } => {
                let record = DeadLetterRecord::retries_exhausted(
                    delivery,
                    request.correlation_id,
                    &error.code,
                    &error.message,
                    failed_attempts,
                    first_seen_at,
                    &self.service_name,
                );
                self.dead_letter(record).await;
                self.metrics
                    .observe_processing(&labels, ResponseStatus::Error, elapsed);
                ResponseEnvelope::failure(request, error.code, error.message, processing_time_ms)
            }
        };

        self.respond(&response).await
    }
}

#[async_trait]
impl MessageHandler for WorkerRunner {
    #[tracing::instrument(
        name = "worker.handle",
        skip_all,
        fields(topic = %delivery.topic, partition = delivery.partition, offset = delivery.offset)
    )]
    async fn handle(&self, delivery: &Delivery) -> Outcome {
        self.wait_until_ready().await;

        let request = match RequestEnvelope::decode(&delivery.payload) {
            Ok(request) => request,
            Err(e) => return self.reject_undecodable(delivery, &e.to_string()).await,
        };

        if let Err(e) = validate_request(&request, &self.limits) {
            return self.reject_invalid(delivery, &request, &e.to_string()).await;
        }

        debug!(
            correlation_id = %request.correlation_id,
            operation = %request.operation(),
            delivery_count = delivery.delivery_count,
            "Request received"
        );
        self.metrics.request_received(&request.labels());

        let first_seen_at = Utc::now();
        let started = Instant::now();
        let terminal = self.process(&request).await;
        self.finish(delivery, &request, terminal, first_seen_at, started)
            .await
    }
}
