//! OTel-native metrics instruments.
//!
//! Instruments are created lazily on the global meter. Nothing is exported
//! unless the embedding application installs a meter provider.
//!
//! Naming follows OTel semantic conventions (dot-separated).

use std::sync::LazyLock;
use std::time::Duration;

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::{global, KeyValue};

use super::RequestLabels;
use crate::envelope::ResponseStatus;

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("langbridge"));

/// Requests by lifecycle stage (dispatched, received, completed, failed, lost).
pub static REQUEST_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("langbridge.request.total")
        .with_description("Requests by lifecycle stage")
        .build()
});

/// Dispatch to response latency of matched responses.
pub static REQUEST_LATENCY: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("langbridge.request.latency")
        .with_description("Dispatch to response latency")
        .with_unit("s")
        .build()
});

/// Worker time per request across all attempts.
pub static PROCESSING_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("langbridge.worker.processing.duration")
        .with_description("Worker processing duration")
        .with_unit("s")
        .build()
});

pub static WORKER_RETRY_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("langbridge.worker.retry.total")
        .with_description("Processing retries scheduled")
        .build()
});

pub static DEAD_LETTER_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("langbridge.dlq.total")
        .with_description("Messages dead-lettered")
        .build()
});

pub static DEAD_LETTER_FAILURE_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("langbridge.dlq.failure.total")
        .with_description("Dead-letter records the sink refused")
        .build()
});

pub static UNMATCHED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("langbridge.router.unmatched.total")
        .with_description("Responses with no live waiter")
        .build()
});

pub static MALFORMED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("langbridge.bus.malformed.total")
        .with_description("Payloads that failed to decode")
        .build()
});

pub static WORKER_READY: LazyLock<Gauge<u64>> = LazyLock::new(|| {
    METER
        .u64_gauge("langbridge.worker.ready")
        .with_description("1 when the worker capability is ready")
        .build()
});

fn attributes(labels: &RequestLabels) -> [KeyValue; 2] {
    [
        KeyValue::new("operation", labels.operation().as_str()),
        KeyValue::new("language_pair", labels.language_pair()),
    ]
}

pub(super) fn request(labels: &RequestLabels, stage: &'static str) {
    let [operation, pair] = attributes(labels);
    REQUEST_TOTAL.add(1, &[operation, pair, KeyValue::new("stage", stage)]);
}

pub(super) fn latency(labels: &RequestLabels, latency: Duration) {
    REQUEST_LATENCY.record(latency.as_secs_f64(), &attributes(labels));
}

pub(super) fn processing(labels: &RequestLabels, status: ResponseStatus, took: Duration) {
    let [operation, pair] = attributes(labels);
    PROCESSING_DURATION.record(
        took.as_secs_f64(),
        &[operation, pair, KeyValue::new("status", status.as_str())],
    );
}

pub(super) fn retry(labels: &RequestLabels) {
    WORKER_RETRY_TOTAL.add(1, &attributes(labels));
}

pub(super) fn dead_letter(reason: &str) {
    DEAD_LETTER_TOTAL.add(1, &[KeyValue::new("reason", reason.to_string())]);
}

pub(super) fn dead_letter_failed(reason: &str) {
    DEAD_LETTER_FAILURE_TOTAL.add(1, &[KeyValue::new("reason", reason.to_string())]);
}

pub(super) fn unmatched(labels: &RequestLabels) {
    UNMATCHED_TOTAL.add(1, &[KeyValue::new("operation", labels.operation().as_str())]);
}

pub(super) fn malformed(topic: &str) {
    MALFORMED_TOTAL.add(1, &[KeyValue::new("topic", topic.to_string())]);
}

pub(super) fn ready(ready: bool) {
    WORKER_READY.record(u64::from(ready), &[]);
}
