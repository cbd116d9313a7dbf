use super::*;
use crate::bus::Outcome;
use crate::test_utils::{message, RecordingHandler};
use std::time::Duration;

fn bus_with_partitions(partitions: usize) -> ChannelBus {
    ChannelBus::new(ChannelBusConfig {
        partitions,
        ..Default::default()
    })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[test]
fn test_partition_for_is_stable() {
    let a = partition_for("user-42", 8);
    let b = partition_for("user-42", 8);
    assert_eq!(a, b);
    assert!(a < 8);
}

#[test]
fn test_default_config() {
    let config = ChannelBusConfig::default();
    assert_eq!(config.partitions, 8);
    assert_eq!(config.max_redeliveries, 3);
    assert_eq!(config.lane_capacity, 1024);
}

#[test]
fn test_zero_partitions_clamped() {
    let bus = bus_with_partitions(0);
    assert_eq!(bus.config().partitions, 1);
}

#[tokio::test]
async fn test_publish_no_subscribers() {
    let bus = ChannelBus::new(ChannelBusConfig::default());
    let result = bus.publish(message("orders", "k", b"{}")).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_subscribe_and_receive() {
    let bus = ChannelBus::new(ChannelBusConfig::default());
    let handler = RecordingHandler::new();
    let _sub = bus
        .subscribe("g1", &["orders".to_string()], handler.clone())
        .await
        .unwrap();

    bus.publish(message("orders", "k1", b"hello")).await.unwrap();
    settle().await;

    let seen = handler.deliveries();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].topic, "orders");
    assert_eq!(seen[0].key.as_deref(), Some("k1"));
    assert_eq!(&seen[0].payload[..], b"hello");
    assert_eq!(seen[0].delivery_count, 1);
}

#[tokio::test]
async fn test_other_topics_not_delivered() {
    let bus = ChannelBus::new(ChannelBusConfig::default());
    let handler = RecordingHandler::new();
    let _sub = bus
        .subscribe("g1", &["orders".to_string()], handler.clone())
        .await
        .unwrap();

    bus.publish(message("inventory", "k1", b"x")).await.unwrap();
    settle().await;

    assert!(handler.deliveries().is_empty());
}

#[tokio::test]
async fn test_same_key_preserves_order() {
    let bus = bus_with_partitions(4);
    let handler = RecordingHandler::with_delay(Duration::from_millis(1));
    let _sub = bus
        .subscribe("g1", &["orders".to_string()], handler.clone())
        .await
        .unwrap();

    for i in 0..20u32 {
        bus.publish(message("orders", "same-key", i.to_string().as_bytes()))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let order: Vec<u32> = handler
        .deliveries()
        .iter()
        .map(|d| std::str::from_utf8(&d.payload).unwrap().parse().unwrap())
        .collect();
    assert_eq!(order, (0..20).collect::<Vec<_>>());

    let offsets: Vec<i64> = handler.deliveries().iter().map(|d| d.offset).collect();
    assert_eq!(offsets, (0..20).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_each_group_gets_a_copy() {
    let bus = ChannelBus::new(ChannelBusConfig::default());
    let first = RecordingHandler::new();
    let second = RecordingHandler::new();
    let topics = vec!["orders".to_string()];
    let _a = bus.subscribe("g1", &topics, first.clone()).await.unwrap();
    let _b = bus.subscribe("g2", &topics, second.clone()).await.unwrap();

    bus.publish(message("orders", "k", b"x")).await.unwrap();
    settle().await;

    assert_eq!(first.deliveries().len(), 1);
    assert_eq!(second.deliveries().len(), 1);
}

#[tokio::test]
async fn test_duplicate_group_rejected() {
    let bus = ChannelBus::new(ChannelBusConfig::default());
    let topics = vec!["orders".to_string()];
    let _a = bus
        .subscribe("g1", &topics, RecordingHandler::new())
        .await
        .unwrap();

    let result = bus.subscribe("g1", &topics, RecordingHandler::new()).await;
    assert!(matches!(result, Err(BusError::Subscribe(_))));
}

#[tokio::test]
async fn test_group_can_resubscribe_after_close() {
    let bus = ChannelBus::new(ChannelBusConfig::default());
    let topics = vec!["orders".to_string()];
    let sub = bus
        .subscribe("g1", &topics, RecordingHandler::new())
        .await
        .unwrap();
    sub.close().await;

    let handler = RecordingHandler::new();
    let _sub = bus.subscribe("g1", &topics, handler.clone()).await.unwrap();
    bus.publish(message("orders", "k", b"x")).await.unwrap();
    settle().await;
    assert_eq!(handler.deliveries().len(), 1);
}

#[tokio::test]
async fn test_retryable_fail_redelivers_until_limit() {
    let bus = ChannelBus::new(ChannelBusConfig {
        max_redeliveries: 2,
        ..Default::default()
    });
    let handler = RecordingHandler::with_outcomes(vec![Outcome::RetryableFail; 10]);
    let _sub = bus
        .subscribe("g1", &["orders".to_string()], handler.clone())
        .await
        .unwrap();

    bus.publish(message("orders", "k", b"x")).await.unwrap();
    settle().await;

    let counts: Vec<u32> = handler
        .deliveries()
        .iter()
        .map(|d| d.delivery_count)
        .collect();
    assert_eq!(counts, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_fatal_fail_not_redelivered() {
    let bus = ChannelBus::new(ChannelBusConfig::default());
    let handler = RecordingHandler::with_outcomes(vec![Outcome::FatalFail]);
    let _sub = bus
        .subscribe("g1", &["orders".to_string()], handler.clone())
        .await
        .unwrap();

    bus.publish(message("orders", "k", b"x")).await.unwrap();
    bus.publish(message("orders", "k", b"y")).await.unwrap();
    settle().await;

    // First message dropped after the fatal outcome, the second still flows.
    assert_eq!(handler.deliveries().len(), 2);
}

#[tokio::test]
async fn test_close_subscription_stops_delivery() {
    let bus = ChannelBus::new(ChannelBusConfig::default());
    let handler = RecordingHandler::new();
    let sub = bus
        .subscribe("g1", &["orders".to_string()], handler.clone())
        .await
        .unwrap();
    sub.close().await;

    bus.publish(message("orders", "k", b"x")).await.unwrap();
    settle().await;
    assert!(handler.deliveries().is_empty());
}

#[tokio::test]
async fn test_closed_bus_rejects_publish_and_subscribe() {
    let bus = ChannelBus::new(ChannelBusConfig::default());
    bus.close().await.unwrap();

    let result = bus.publish(message("orders", "k", b"x")).await;
    assert!(matches!(result, Err(BusError::Closed)));

    let result = bus
        .subscribe("g1", &["orders".to_string()], RecordingHandler::new())
        .await;
    assert!(matches!(result, Err(BusError::Closed)));
}
