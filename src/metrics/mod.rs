//! Metrics sink for the bridge.
//!
//! Components report through the [`MetricsSink`] trait so the backend stays
//! swappable. [`PrometheusMetrics`] records into a [`Registry`] that
//! [`server`] renders for scraping. [`MemoryMetrics`] records calls for
//! tests.
//!
//! Emitted series:
//! - `langbridge_requests_dispatched_total` (operation, language_pair)
//! - `langbridge_requests_received_total` (operation, language_pair)
//! - `langbridge_requests_completed_total` (operation, language_pair, status)
//! - `langbridge_requests_failed_total` (operation, language_pair, kind)
//! - `langbridge_request_latency_seconds` (operation, language_pair)
//! - `langbridge_processing_duration_seconds` (operation, language_pair, status)
//! - `langbridge_worker_retries_total` (operation, language_pair)
//! - `langbridge_dead_letters_total` (reason)
//! - `langbridge_dead_letter_failures_total` (reason)
//! - `langbridge_responses_lost_total` (operation, language_pair)
//! - `langbridge_unmatched_responses_total` (operation)
//! - `langbridge_malformed_messages_total` (topic)
//! - `langbridge_worker_ready` gauge

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::envelope::ResponseStatus;
use crate::error::ErrorKind;
use crate::topics::Operation;
use crate::validation::validate_language_code;

#[cfg(feature = "otel")]
pub mod otel;
pub mod registry;
pub mod server;

pub use registry::{Instrument, Registry};

pub const REQUESTS_DISPATCHED: Instrument = Instrument::counter(
    "langbridge_requests_dispatched_total",
    "Requests published by the dispatcher",
);
pub const REQUESTS_RECEIVED: Instrument = Instrument::counter(
    "langbridge_requests_received_total",
    "Requests accepted by the worker runner",
);
pub const REQUESTS_COMPLETED: Instrument = Instrument::counter(
    "langbridge_requests_completed_total",
    "Responses consumed by the router",
);
pub const REQUESTS_FAILED: Instrument = Instrument::counter(
    "langbridge_requests_failed_total",
    "Requests that ended in a caller-visible failure",
);
pub const REQUEST_LATENCY: Instrument = Instrument::histogram(
    "langbridge_request_latency_seconds",
    "Dispatch to response latency of matched responses",
);
pub const PROCESSING_DURATION: Instrument = Instrument::histogram(
    "langbridge_processing_duration_seconds",
    "Worker time per request across all attempts",
);
pub const WORKER_RETRIES: Instrument =
    Instrument::counter("langbridge_worker_retries_total", "Processing retries scheduled");
pub const DEAD_LETTERS: Instrument =
    Instrument::counter("langbridge_dead_letters_total", "Messages dead-lettered");
pub const DEAD_LETTER_FAILURES: Instrument = Instrument::counter(
    "langbridge_dead_letter_failures_total",
    "Dead-letter records the sink refused",
);
pub const RESPONSES_LOST: Instrument = Instrument::counter(
    "langbridge_responses_lost_total",
    "Terminal responses that could not be published",
);
pub const UNMATCHED_RESPONSES: Instrument = Instrument::counter(
    "langbridge_unmatched_responses_total",
    "Responses with no live waiter",
);
pub const MALFORMED_MESSAGES: Instrument = Instrument::counter(
    "langbridge_malformed_messages_total",
    "Payloads that failed to decode",
);
pub const WORKER_READY: Instrument =
    Instrument::gauge("langbridge_worker_ready", "1 when the worker capability is ready");

/// Label value used when a request has no language pair.
pub const NO_LANGUAGE_PAIR: &str = "none";

/// Labels shared by per-request series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLabels {
    operation: Operation,
    language_pair: Option<(String, String)>,
}

impl RequestLabels {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            language_pair: None,
        }
    }

    /// Codes that are not valid language codes collapse to `none`, keeping
    /// the series count bounded for values read off the wire.
    pub fn from_languages(operation: Operation, languages: Option<(&str, &str)>) -> Self {
        let language_pair = languages
            .filter(|(s, t)| {
                validate_language_code("source_language", s).is_ok()
                    && validate_language_code("target_language", t).is_ok()
            })
            .map(|(s, t)| (s.to_ascii_lowercase(), t.to_ascii_lowercase()));
        Self {
            operation,
            language_pair,
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// `source-target`, e.g. `en-ar`, or `none`.
    pub fn language_pair(&self) -> String {
        match &self.language_pair {
            Some((source, target)) => format!("{}-{}", source, target),
            None => NO_LANGUAGE_PAIR.to_string(),
        }
    }
}

/// Where bridge components report what happened.
pub trait MetricsSink: Send + Sync {
    /// A request was published by the dispatcher.
    fn request_dispatched(&self, labels: &RequestLabels);

    /// A request was accepted by the worker runner.
    fn request_received(&self, labels: &RequestLabels);

    /// A response reached the router.
    fn request_completed(&self, labels: &RequestLabels, status: ResponseStatus);

    /// A request ended in a caller-visible failure.
    fn request_failed(&self, labels: &RequestLabels, kind: ErrorKind);

    /// Dispatch-to-response latency for a matched response.
    fn observe_latency(&self, labels: &RequestLabels, latency: Duration);

    /// Time the worker spent on one request, across all attempts.
    fn observe_processing(&self, labels: &RequestLabels, status: ResponseStatus, took: Duration);

    /// The worker scheduled another attempt.
    fn retry_scheduled(&self, labels: &RequestLabels, attempt: u32);

    fn dead_lettered(&self, reason: &str);

    /// The dead-letter sink rejected a record; the record is gone.
    fn dead_letter_failed(&self, reason: &str);

    /// A terminal response could not be published and was dropped.
    fn response_lost(&self, labels: &RequestLabels);

    fn unmatched_response(&self, labels: &RequestLabels);

    fn malformed_message(&self, topic: &str);

    fn worker_ready(&self, ready: bool);
}

/// Sink that records into a [`Registry`] for the `/metrics` endpoint.
///
/// With the `otel` feature, every call is also forwarded to the
/// OpenTelemetry instruments in [`otel`].
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Arc<Registry>,
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusMetrics {
    /// Sink over the process-wide registry.
    pub fn new() -> Self {
        Self::with_registry(registry::global())
    }

    pub fn with_registry(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

impl MetricsSink for PrometheusMetrics {
    fn request_dispatched(&self, labels: &RequestLabels) {
        let pair = labels.language_pair();
        self.registry.increment(
            &REQUESTS_DISPATCHED,
            &[("operation", labels.operation().as_str()), ("language_pair", pair.as_str())],
        );
        #[cfg(feature = "otel")]
        otel::request(labels, "dispatched");
    }

    fn request_received(&self, labels: &RequestLabels) {
        let pair = labels.language_pair();
        self.registry.increment(
            &REQUESTS_RECEIVED,
            &[("operation", labels.operation().as_str()), ("language_pair", pair.as_str())],
        );
        #[cfg(feature = "otel")]
        otel::request(labels, "received");
    }

    fn request_completed(&self, labels: &RequestLabels, status: ResponseStatus) {
        let pair = labels.language_pair();
        self.registry.increment(
            &REQUESTS_COMPLETED,
            &[
                ("operation", labels.operation().as_str()),
                ("language_pair", pair.as_str()),
                ("status", status.as_str()),
            ],
        );
        #[cfg(feature = "otel")]
        otel::request(labels, "completed");
    }

    fn request_failed(&self, labels: &RequestLabels, kind: ErrorKind) {
        let pair = labels.language_pair();
        self.registry.increment(
            &REQUESTS_FAILED,
            &[
                ("operation", labels.operation().as_str()),
                ("language_pair", pair.as_str()),
                ("kind", kind.as_str()),
            ],
        );
        #[cfg(feature = "otel")]
        otel::request(labels, "failed");
    }

    fn observe_latency(&self, labels: &RequestLabels, latency: Duration) {
        let pair = labels.language_pair();
        self.registry.observe(
            &REQUEST_LATENCY,
            &[("operation", labels.operation().as_str()), ("language_pair", pair.as_str())],
            latency.as_secs_f64(),
        );
        #[cfg(feature = "otel")]
        otel::latency(labels, latency);
    }

    fn observe_processing(&self, labels: &RequestLabels, status: ResponseStatus, took: Duration) {
        let pair = labels.language_pair();
        self.registry.observe(
            &PROCESSING_DURATION,
            &[
                ("operation", labels.operation().as_str()),
                ("language_pair", pair.as_str()),
                ("status", status.as_str()),
            ],
            took.as_secs_f64(),
        );
        #[cfg(feature = "otel")]
        otel::processing(labels, status, took);
    }

    fn retry_scheduled(&self, labels: &RequestLabels, _attempt: u32) {
        let pair = labels.language_pair();
        self.registry.increment(
            &WORKER_RETRIES,
            &[("operation", labels.operation().as_str()), ("language_pair", pair.as_str())],
        );
        #[cfg(feature = "otel")]
        otel::retry(labels);
    }

    fn dead_lettered(&self, reason: &str) {
        self.registry.increment(&DEAD_LETTERS, &[("reason", reason)]);
        #[cfg(feature = "otel")]
        otel::dead_letter(reason);
    }

    fn dead_letter_failed(&self, reason: &str) {
        self.registry
            .increment(&DEAD_LETTER_FAILURES, &[("reason", reason)]);
        #[cfg(feature = "otel")]
        otel::dead_letter_failed(reason);
    }

    fn response_lost(&self, labels: &RequestLabels) {
        let pair = labels.language_pair();
        self.registry.increment(
            &RESPONSES_LOST,
            &[("operation", labels.operation().as_str()), ("language_pair", pair.as_str())],
        );
        #[cfg(feature = "otel")]
        otel::request(labels, "lost");
    }

    fn unmatched_response(&self, labels: &RequestLabels) {
        self.registry
            .increment(&UNMATCHED_RESPONSES, &[("operation", labels.operation().as_str())]);
        #[cfg(feature = "otel")]
        otel::unmatched(labels);
    }

    fn malformed_message(&self, topic: &str) {
        self.registry.increment(&MALFORMED_MESSAGES, &[("topic", topic)]);
        #[cfg(feature = "otel")]
        otel::malformed(topic);
    }

    fn worker_ready(&self, ready: bool) {
        self.registry
            .set_gauge(&WORKER_READY, &[], if ready { 1.0 } else { 0.0 });
        #[cfg(feature = "otel")]
        otel::ready(ready);
    }
}

/// One recorded sink call.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    Dispatched(RequestLabels),
    Received(RequestLabels),
    Completed(RequestLabels, ResponseStatus),
    Failed(RequestLabels, ErrorKind),
    Latency(RequestLabels, Duration),
    Processing(RequestLabels, ResponseStatus),
    Retry(RequestLabels, u32),
    DeadLettered(String),
    DeadLetterFailed(String),
    ResponseLost(RequestLabels),
    Unmatched(RequestLabels),
    Malformed(String),
    Ready(bool),
}

/// Sink that keeps every call in memory.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.lock().clone()
    }

    /// Number of recorded events matching `pred`.
    pub fn count(&self, pred: impl Fn(&MetricEvent) -> bool) -> usize {
        self.lock().iter().filter(|e| pred(e)).count()
    }

    fn record(&self, event: MetricEvent) {
        self.lock().push(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<MetricEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MetricsSink for MemoryMetrics {
    fn request_dispatched(&self, labels: &RequestLabels) {
        self.record(MetricEvent::Dispatched(labels.clone()));
    }

    fn request_received(&self, labels: &RequestLabels) {
        self.record(MetricEvent::Received(labels.clone()));
    }

    fn request_completed(&self, labels: &RequestLabels, status: ResponseStatus) {
        self.record(MetricEvent::Completed(labels.clone(), status));
    }

    fn request_failed(&self, labels: &RequestLabels, kind: ErrorKind) {
        self.record(MetricEvent::Failed(labels.clone(), kind));
    }

    fn observe_latency(&self, labels: &RequestLabels, latency: Duration) {
        self.record(MetricEvent::Latency(labels.clone(), latency));
    }

    fn observe_processing(&self, labels: &RequestLabels, status: ResponseStatus, _took: Duration) {
        self.record(MetricEvent::Processing(labels.clone(), status));
    }

    fn retry_scheduled(&self, labels: &RequestLabels, attempt: u32) {
        self.record(MetricEvent::Retry(labels.clone(), attempt));
    }

    fn dead_lettered(&self, reason: &str) {
        self.record(MetricEvent::DeadLettered(reason.to_string()));
    }

    fn dead_letter_failed(&self, reason: &str) {
        self.record(MetricEvent::DeadLetterFailed(reason.to_string()));
    }

    fn response_lost(&self, labels: &RequestLabels) {
        self.record(MetricEvent::ResponseLost(labels.clone()));
    }

    fn unmatched_response(&self, labels: &RequestLabels) {
        self.record(MetricEvent::Unmatched(labels.clone()));
    }

    fn malformed_message(&self, topic: &str) {
        self.record(MetricEvent::Malformed(topic.to_string()));
    }

    fn worker_ready(&self, ready: bool) {
        self.record(MetricEvent::Ready(ready));
    }
}
