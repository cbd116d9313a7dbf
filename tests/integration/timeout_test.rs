//! Unanswered requests time out; late responses are ignored.

use std::time::Duration;

use langbridge::envelope::WorkRequest;
use langbridge::error::BridgeError;
use langbridge::metrics::MetricEvent;

use crate::common::{GatedWorker, Pipeline};

#[tokio::test(start_paused = true)]
async fn test_timeout_then_late_response_is_noop() {
    let worker = GatedWorker::new();
    let pipeline = Pipeline::start(worker.clone()).await;

    let reply = pipeline
        .dispatcher
        .dispatch(
            WorkRequest::translation("user-1", "Hello", "en", "ar"),
            Some(Duration::from_millis(500)),
        )
        .await
        .unwrap();
    let id = reply.correlation_id();

    match reply.await {
        Err(BridgeError::Timeout { correlation_id, .. }) => assert_eq!(correlation_id, id),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(!pipeline.tracker.is_pending(id));

    // The worker answers after the caller gave up.
    worker.release();
    pipeline.responses.wait_for(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(pipeline.responses.responses()[0].correlation_id, id);
    assert_eq!(pipeline.tracker.pending_count(), 0);
    assert_eq!(
        pipeline
            .metrics
            .count(|e| matches!(e, MetricEvent::Unmatched(_))),
        1
    );
    assert_eq!(
        pipeline
            .metrics
            .count(|e| matches!(e, MetricEvent::Latency(..))),
        0
    );

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_wait_leaves_no_entry() {
    let worker = GatedWorker::new();
    let pipeline = Pipeline::start(worker.clone()).await;

    let reply = pipeline
        .dispatcher
        .dispatch(WorkRequest::translation("user-1", "Hello", "en", "ar"), None)
        .await
        .unwrap();
    assert_eq!(pipeline.tracker.pending_count(), 1);

    drop(reply);
    assert_eq!(pipeline.tracker.pending_count(), 0);

    worker.release();
    pipeline.responses.wait_for(1).await;

    pipeline.shutdown().await;
}
