//! Message bus transport.
//!
//! This module contains:
//! - `MessageBus` trait: keyed publish and consumer-group subscribe
//! - `MessageHandler` trait: per-message processing with an ack `Outcome`
//! - `Subscription`: handle that closes a consumer group
//! - Transport-level publish retry (`publish_with_retry`)
//! - Implementations: in-memory channel bus, Kafka (feature `kafka`), mock
//!
//! Delivery contract: a subscriber's handler is invoked serially per
//! partition, so messages sharing a key are handled in publish order.
//! Different partitions are handled concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod channel;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod mock;

pub use channel::{ChannelBus, ChannelBusConfig};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBus, KafkaBusConfig};
pub use mock::MockBus;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Bus is closed")]
    Closed,
}

impl BusError {
    /// Whether the transport's own retry policy should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Publish(_))
    }
}

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    /// Partition key. Messages sharing a key keep their relative order.
    pub key: Option<String>,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
}

/// A consumed message handed to a [`MessageHandler`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
    /// 1 on first delivery, incremented on each transport redelivery.
    pub delivery_count: u32,
}

/// What the handler wants the transport to do with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Processed (or deliberately discarded). Do not redeliver.
    Ack,
    /// Transient failure. Redeliver according to the transport's policy.
    RetryableFail,
    /// Permanent failure. Do not redeliver.
    FatalFail,
}

/// Handler for consumed messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one delivery. Never called concurrently for the same partition.
    async fn handle(&self, delivery: &Delivery) -> Outcome;
}

/// Interface to a partitioned publish/subscribe broker.
///
/// Implementations:
/// - `ChannelBus`: in-process, partitioned tokio channels
/// - `KafkaBus`: Apache Kafka via rdkafka (feature `kafka`)
/// - `MockBus`: records publishes for tests
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish one keyed message. Returns once the broker has acknowledged it.
    async fn publish(&self, message: OutboundMessage) -> Result<()>;

    /// Join consumer group `group` on `topics` and deliver to `handler`.
    ///
    /// Consumption runs until the returned subscription is closed.
    async fn subscribe(
        &self,
        group: &str,
        topics: &[String],
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription>;

    /// Close the producer side. Further publishes fail with `BusError::Closed`.
    async fn close(&self) -> Result<()>;

    /// Short backend name for logs and metrics.
    fn name(&self) -> &'static str;
}

// ============================================================================
// Subscription
// ============================================================================

/// Handle to a running consumer group.
///
/// Dropping the handle signals consumers to stop without waiting for them.
/// Call [`Subscription::close`] to stop and wait for in-flight handlers.
pub struct Subscription {
    group: String,
    topics: Vec<String>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(
        group: impl Into<String>,
        topics: Vec<String>,
        shutdown: watch::Sender<bool>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            group: group.into(),
            topics,
            shutdown,
            tasks,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Stop consuming. In-flight deliveries finish before this returns.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(group = %self.group, error = %e, "Consumer task ended abnormally");
            }
        }
        info!(group = %self.group, topics = ?self.topics, "Subscription closed");
    }
}

/// Run `handler` on `delivery`, redelivering in place after a retryable
/// failure until `max_redeliveries` is used up. Returns the final outcome.
pub(crate) async fn deliver(
    handler: &dyn MessageHandler,
    mut delivery: Delivery,
    max_redeliveries: u32,
    group: &str,
) -> Outcome {
    loop {
        match handler.handle(&delivery).await {
            Outcome::Ack => return Outcome::Ack,
            Outcome::FatalFail => {
                error!(
                    group = %group,
                    topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Handler reported fatal failure, dropping message"
                );
                return Outcome::FatalFail;
            }
            Outcome::RetryableFail if delivery.delivery_count <= max_redeliveries => {
                warn!(
                    group = %group,
                    topic = %delivery.topic,
                    offset = delivery.offset,
                    delivery_count = delivery.delivery_count,
                    "Handler asked for redelivery"
                );
                delivery.delivery_count += 1;
            }
            Outcome::RetryableFail => {
                error!(
                    group = %group,
                    topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    delivery_count = delivery.delivery_count,
                    "Redeliveries exhausted, dropping message"
                );
                return Outcome::RetryableFail;
            }
        }
    }
}

// ============================================================================
// Transport retry
// ============================================================================

/// Default initial delay between publish retries.
pub const DEFAULT_TRANSPORT_MIN_DELAY_MS: u64 = 100;
/// Default ceiling on the delay between publish retries.
pub const DEFAULT_TRANSPORT_MAX_DELAY_MS: u64 = 5_000;
/// Default number of publish retries.
pub const DEFAULT_TRANSPORT_MAX_TIMES: usize = 8;

/// The transport's own publish retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportRetryConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_times: usize,
}

impl Default for TransportRetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: DEFAULT_TRANSPORT_MIN_DELAY_MS,
            max_delay_ms: DEFAULT_TRANSPORT_MAX_DELAY_MS,
            max_times: DEFAULT_TRANSPORT_MAX_TIMES,
        }
    }
}

impl TransportRetryConfig {
    /// No retries; the first failure is final.
    pub fn none() -> Self {
        Self {
            max_times: 0,
            ..Self::default()
        }
    }

    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_max_times(self.max_times)
            .with_jitter()
    }
}

/// Publish with the transport retry policy applied to retryable errors.
#[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %message.topic))]
pub async fn publish_with_retry(
    bus: &dyn MessageBus,
    message: OutboundMessage,
    policy: &TransportRetryConfig,
) -> Result<()> {
    (|| async { bus.publish(message.clone()).await })
        .retry(policy.backoff())
        .when(BusError::is_retryable)
        .notify(|err: &BusError, delay: Duration| {
            warn!(error = %err, retry_in = ?delay, "Publish failed, retrying");
        })
        .await?;
    debug!("Published");
    Ok(())
}

// ============================================================================
// Configuration
// ============================================================================

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process partitioned channels.
    #[default]
    Channel,
    /// Apache Kafka.
    Kafka,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// Channel-specific configuration.
    pub channel: ChannelBusConfig,
    /// Kafka-specific configuration.
    pub kafka: KafkaConfig,
}

/// Kafka-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Client id reported to the broker.
    pub client_id: String,
    /// SASL username (optional, for authenticated clusters).
    pub sasl_username: Option<String>,
    /// SASL password (optional, for authenticated clusters).
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SSL CA certificate path (for SSL connections).
    pub ssl_ca_location: Option<String>,
    /// In-place redeliveries after `Outcome::RetryableFail`.
    pub max_redeliveries: u32,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: "langbridge".to_string(),
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
            max_redeliveries: channel::DEFAULT_MAX_REDELIVERIES,
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the message bus selected by configuration.
///
/// Kafka requires the `kafka` feature.
pub async fn init_bus(config: &MessagingConfig) -> Result<Arc<dyn MessageBus>> {
    match config.messaging_type {
        MessagingType::Channel => {
            let bus = ChannelBus::new(config.channel.clone());
            info!(messaging_type = "channel", "Message bus initialized");
            Ok(Arc::new(bus))
        }
        MessagingType::Kafka => {
            #[cfg(feature = "kafka")]
            {
                let bus = KafkaBus::new(KafkaBusConfig::from(&config.kafka))?;
                info!(messaging_type = "kafka", "Message bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "kafka"))]
            {
                Err(BusError::Unavailable(
                    "Kafka support requires the 'kafka' feature. Rebuild with --features kafka"
                        .to_string(),
                ))
            }
        }
    }
}
