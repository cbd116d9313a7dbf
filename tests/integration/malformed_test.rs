//! Malformed payloads never stop consumption.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use langbridge::bus::{MessageBus, OutboundMessage};
use langbridge::dlq::DeadLetterReason;
use langbridge::envelope::WorkRequest;
use langbridge::metrics::MetricEvent;

use crate::common::{FlakyWorker, Pipeline};

fn raw(topic: &str, key: &str, payload: &'static [u8]) -> OutboundMessage {
    OutboundMessage {
        topic: topic.to_string(),
        key: Some(key.to_string()),
        payload: Bytes::from_static(payload),
        headers: HashMap::new(),
    }
}

#[tokio::test]
async fn test_malformed_request_dead_lettered_and_consumption_continues() {
    let pipeline = Pipeline::start(FlakyWorker::new(0)).await;

    // Same key as the real request below, so both land on one partition.
    pipeline
        .bus
        .publish(raw("translation-requests", "user-1", b"{\"correlation_id\": 42"))
        .await
        .unwrap();

    let result = pipeline
        .dispatcher
        .submit(
            WorkRequest::translation("user-1", "Hello", "en", "ar"),
            Some(Duration::from_millis(30_000)),
        )
        .await
        .unwrap();
    assert_eq!(result.text(), "ar:Hello");

    pipeline.dead_letters.wait_for(1).await;
    let records = pipeline.dead_letters.dead_letters();
    assert_eq!(records[0].reason, DeadLetterReason::DecodeFailure);
    assert_eq!(records[0].correlation_id, None);
    assert_eq!(
        records[0].original_message,
        serde_json::Value::String("{\"correlation_id\": 42".to_string())
    );

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_malformed_response_skipped_by_router() {
    let pipeline = Pipeline::start(FlakyWorker::new(0)).await;

    pipeline
        .bus
        .publish(raw("translation-responses", "user-1", b"not json at all"))
        .await
        .unwrap();

    let result = pipeline
        .dispatcher
        .submit(WorkRequest::translation("user-1", "Hello", "en", "ar"), None)
        .await
        .unwrap();
    assert_eq!(result.text(), "ar:Hello");
    assert_eq!(
        pipeline
            .metrics
            .count(|e| matches!(e, MetricEvent::Malformed(t) if t == "translation-responses")),
        1
    );

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_invalid_request_answered_with_error() {
    let pipeline = Pipeline::start(FlakyWorker::new(0)).await;

    // Bypass dispatcher validation by publishing the envelope directly.
    let tracker = pipeline.tracker.clone();
    let mut envelope = WorkRequest::translation("user-1", "Hello", "en", "ar").into_envelope();
    envelope.user_id = String::new();
    let pending = tracker
        .track(envelope.correlation_id, Duration::from_millis(30_000))
        .unwrap();
    let message = envelope
        .to_message("translation-requests", "it-test")
        .unwrap();
    pipeline.bus.publish(message).await.unwrap();

    let response = pending.await.unwrap();
    assert!(!response.is_success());
    assert_eq!(
        response.error.as_ref().map(|e| e.code.as_str()),
        Some("INVALID_REQUEST")
    );

    pipeline.dead_letters.wait_for(1).await;
    assert_eq!(
        pipeline.dead_letters.dead_letters()[0].reason,
        DeadLetterReason::InvalidRequest
    );

    pipeline.shutdown().await;
}
