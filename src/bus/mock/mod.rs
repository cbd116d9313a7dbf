//! Mock message bus implementation for testing.
//!
//! Records every published message and lets tests drive registered
//! handlers directly with [`MockBus::deliver`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{watch, RwLock};

use super::{
    BusError, Delivery, MessageBus, MessageHandler, OutboundMessage, Outcome, Result,
    Subscription,
};

/// Mock message bus for testing.
#[derive(Default)]
pub struct MockBus {
    published: RwLock<Vec<OutboundMessage>>,
    /// Number of upcoming publishes that fail with `Unavailable`.
    failures_remaining: RwLock<usize>,
    fail_on_publish: RwLock<bool>,
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every publish until reset.
    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    /// Fail the next `n` publishes, then succeed.
    pub async fn fail_next(&self, n: usize) {
        *self.failures_remaining.write().await = n;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    /// Published messages on one topic, oldest first.
    pub async fn published_to(&self, topic: &str) -> Vec<OutboundMessage> {
        self.published
            .read()
            .await
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub async fn take_published(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.published.write().await)
    }

    /// Hand a raw payload to whichever handler subscribed to `topic`.
    pub async fn deliver(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<Outcome> {
        let handler = self
            .handlers
            .read()
            .await
            .get(topic)
            .cloned()
            .ok_or_else(|| BusError::Subscribe(format!("no handler for '{}'", topic)))?;

        let delivery = Delivery {
            topic: topic.to_string(),
            partition: 0,
            offset: 0,
            key: key.map(str::to_string),
            payload: Bytes::copy_from_slice(payload),
            headers: HashMap::new(),
            delivery_count: 1,
        };
        Ok(handler.handle(&delivery).await)
    }
}

#[async_trait]
impl MessageBus for MockBus {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Unavailable("Mock publish failure".to_string()));
        }
        {
            let mut remaining = self.failures_remaining.write().await;
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BusError::Unavailable("Mock transient failure".to_string()));
            }
        }
        self.published.write().await.push(message);
        Ok(())
    }

    async fn subscribe(
        &self,
        group: &str,
        topics: &[String],
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription> {
        let mut handlers = self.handlers.write().await;
        for topic in topics {
            handlers.insert(topic.clone(), Arc::clone(&handler));
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Subscription::new(group, topics.to_vec(), shutdown, Vec::new()))
    }

    async fn close(&self) -> Result<()> {
        self.handlers.write().await.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{message, RecordingHandler};

    #[tokio::test]
    async fn test_mock_bus_publish() {
        let bus = MockBus::new();
        bus.publish(message("orders", "k", b"x")).await.unwrap();
        assert_eq!(bus.published_count().await, 1);
        assert_eq!(bus.published_to("orders").await.len(), 1);
        assert!(bus.published_to("other").await.is_empty());
    }

    #[tokio::test]
    async fn test_mock_bus_fail_on_publish() {
        let bus = MockBus::new();
        bus.set_fail_on_publish(true).await;
        let result = bus.publish(message("orders", "k", b"x")).await;
        assert!(matches!(result, Err(BusError::Unavailable(_))));
        assert_eq!(bus.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_mock_bus_fail_next() {
        let bus = MockBus::new();
        bus.fail_next(2).await;
        assert!(bus.publish(message("t", "k", b"1")).await.is_err());
        assert!(bus.publish(message("t", "k", b"2")).await.is_err());
        assert!(bus.publish(message("t", "k", b"3")).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_bus_deliver_reaches_handler() {
        let bus = MockBus::new();
        let handler = RecordingHandler::new();
        bus.subscribe("g", &["orders".to_string()], handler.clone())
            .await
            .unwrap();

        let outcome = bus.deliver("orders", Some("k"), b"payload").await.unwrap();
        assert_eq!(outcome, Outcome::Ack);
        assert_eq!(handler.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_bus_deliver_without_handler() {
        let bus = MockBus::new();
        assert!(bus.deliver("orders", None, b"x").await.is_err());
    }
}
