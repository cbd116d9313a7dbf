//! Dispatch, process and resolve over the channel bus.

use std::time::Duration;

use langbridge::envelope::{SummaryType, WorkRequest, WorkResult};
use langbridge::metrics::MetricEvent;
use langbridge::worker::LoopbackWorker;

use crate::common::{FlakyWorker, Pipeline};

#[tokio::test]
async fn test_translation_round_trip() {
    let pipeline = Pipeline::start(std::sync::Arc::new(LoopbackWorker::new())).await;

    let result = pipeline
        .dispatcher
        .submit(
            WorkRequest::translation("user-1", "Hello", "en", "ar"),
            Some(Duration::from_millis(30_000)),
        )
        .await
        .unwrap();

    assert_eq!(
        result,
        WorkResult::Translation {
            translated_text: "[en-ar] Hello".to_string()
        }
    );
    assert_eq!(pipeline.tracker.pending_count(), 0);
    assert_eq!(pipeline.dead_letters.len(), 0);
    assert_eq!(
        pipeline
            .metrics
            .count(|e| matches!(e, MetricEvent::Latency(..))),
        1
    );

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_summarization_round_trip() {
    let pipeline = Pipeline::start(std::sync::Arc::new(LoopbackWorker::new())).await;

    let result = pipeline
        .dispatcher
        .submit(
            WorkRequest::summarization(
                "user-2",
                "The quick brown fox jumps over the lazy dog",
                SummaryType::Short,
                Some(15),
            ),
            None,
        )
        .await
        .unwrap();

    match result {
        WorkResult::Summarization {
            summarized_text,
            original_length,
            ..
        } => {
            assert_eq!(summarized_text, "The quick brown");
            assert_eq!(original_length, 43);
        }
        other => panic!("unexpected result {:?}", other),
    }

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_requests_resolve_independently() {
    let pipeline = Pipeline::start(FlakyWorker::new(0)).await;

    let mut replies = Vec::new();
    for i in 0..20 {
        let reply = pipeline
            .dispatcher
            .dispatch(
                WorkRequest::translation(format!("user-{}", i % 5), format!("text {}", i), "en", "ar"),
                None,
            )
            .await
            .unwrap();
        replies.push((i, reply));
    }

    for (i, reply) in replies {
        let result = reply.await.unwrap();
        assert_eq!(result.text(), format!("ar:text {}", i));
    }
    assert_eq!(pipeline.tracker.pending_count(), 0);

    pipeline.shutdown().await;
}
