//! Worker retry, backoff and dead-lettering end to end.

use std::time::Duration;

use langbridge::dlq::DeadLetterReason;
use langbridge::envelope::WorkRequest;
use langbridge::error::BridgeError;

use crate::common::{FlakyWorker, Pipeline};

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_dead_letters_and_fails_caller() {
    let worker = FlakyWorker::always_failing();
    let pipeline = Pipeline::start(worker.clone()).await;

    let result = pipeline
        .dispatcher
        .submit(
            WorkRequest::translation("user-1", "Hello", "en", "ar"),
            Some(Duration::from_millis(30_000)),
        )
        .await;

    match result {
        Err(BridgeError::WorkerFailure { code, message }) => {
            assert_eq!(code, "MODEL_UNAVAILABLE");
            assert_eq!(message, "attempt 2 failed");
        }
        other => panic!("expected worker failure, got {:?}", other),
    }
    assert_eq!(worker.calls(), 3);

    pipeline.dead_letters.wait_for(1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let records = pipeline.dead_letters.dead_letters();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, DeadLetterReason::RetriesExhausted);
    assert_eq!(records[0].failed_attempts, 3);
    assert_eq!(records[0].source_topic, "translation-requests");
    assert_eq!(records[0].original_message["payload"]["text"], "Hello");

    let responses = pipeline.responses.responses();
    assert_eq!(responses.len(), 1);
    assert!(!responses[0].is_success());

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_recovered_by_retry() {
    let worker = FlakyWorker::new(2);
    let pipeline = Pipeline::start(worker.clone()).await;

    let started = tokio::time::Instant::now();
    let result = pipeline
        .dispatcher
        .submit(WorkRequest::translation("user-1", "Hello", "en", "ar"), None)
        .await
        .unwrap();

    assert_eq!(result.text(), "ar:Hello");
    assert_eq!(worker.calls(), 3);
    assert!(started.elapsed() >= Duration::from_millis(3_000));
    assert_eq!(pipeline.dead_letters.len(), 0);

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_window_longer_than_timeout_times_out() {
    let worker = FlakyWorker::always_failing();
    let pipeline = Pipeline::start(worker.clone()).await;

    let result = pipeline
        .dispatcher
        .submit(
            WorkRequest::translation("user-1", "Hello", "en", "ar"),
            Some(Duration::from_millis(1_500)),
        )
        .await;
    assert!(matches!(result, Err(BridgeError::Timeout { .. })));

    // The worker still finishes its cycle and dead-letters once.
    pipeline.dead_letters.wait_for(1).await;
    assert_eq!(pipeline.dead_letters.len(), 1);

    pipeline.shutdown().await;
}
