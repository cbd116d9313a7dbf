//! Kafka message bus implementation.
//!
//! Topic names are used as-is. Message key is the envelope's partition key
//! (user id for requests and responses), so one user's messages stay on one
//! partition.
//!
//! Each subscription owns a `StreamConsumer` in its own consumer group.
//! Polled messages are fanned out to one lane task per assigned partition,
//! which runs the handler serially and stores the offset only once the
//! handler has finished with the message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    deliver, BusError, Delivery, KafkaConfig, MessageBus, MessageHandler, OutboundMessage,
    Result, Subscription,
};

/// Producer delivery timeout.
const MESSAGE_TIMEOUT_MS: &str = "5000";
/// How long a publish may wait for room in the producer queue.
const QUEUE_TIMEOUT: Duration = Duration::from_secs(5);
/// Buffered messages per partition lane.
const LANE_CAPACITY: usize = 256;

/// Configuration for Kafka connection.
#[derive(Clone, Debug)]
pub struct KafkaBusConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Client id reported to the broker.
    pub client_id: String,
    /// In-place redeliveries after a retryable handler failure.
    pub max_redeliveries: u32,
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
}

impl KafkaBusConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        let defaults = KafkaConfig::default();
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            client_id: defaults.client_id,
            max_redeliveries: defaults.max_redeliveries,
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
        }
    }

    /// Add SASL authentication.
    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    /// Set security protocol.
    pub fn with_security_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.security_protocol = Some(protocol.into());
        self
    }

    /// Set SSL CA certificate location.
    pub fn with_ssl_ca(mut self, ca_location: impl Into<String>) -> Self {
        self.ssl_ca_location = Some(ca_location.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Build a ClientConfig for producers.
    fn build_producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("message.timeout.ms", MESSAGE_TIMEOUT_MS);
        config.set("acks", "all");
        config.set("enable.idempotence", "true");

        self.apply_security_config(&mut config);
        config
    }

    /// Build a ClientConfig for a consumer in `group`.
    ///
    /// Offsets are committed automatically, but only offsets the lanes have
    /// explicitly stored, so nothing is committed ahead of the handler.
    fn build_consumer_config(&self, group: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("group.id", group);
        config.set("enable.auto.commit", "true");
        config.set("enable.auto.offset.store", "false");
        config.set("auto.offset.reset", "earliest");

        self.apply_security_config(&mut config);
        config
    }

    /// Apply security settings to a ClientConfig.
    fn apply_security_config(&self, config: &mut ClientConfig) {
        if let Some(ref protocol) = self.security_protocol {
            config.set("security.protocol", protocol);
        }

        if let Some(ref mechanism) = self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }

        if let Some(ref username) = self.sasl_username {
            config.set("sasl.username", username);
        }

        if let Some(ref password) = self.sasl_password {
            config.set("sasl.password", password);
        }

        if let Some(ref ca_location) = self.ssl_ca_location {
            config.set("ssl.ca.location", ca_location);
        }
    }
}

impl From<&KafkaConfig> for KafkaBusConfig {
    fn from(config: &KafkaConfig) -> Self {
        Self {
            bootstrap_servers: config.bootstrap_servers.clone(),
            client_id: config.client_id.clone(),
            max_redeliveries: config.max_redeliveries,
            sasl_username: config.sasl_username.clone(),
            sasl_password: config.sasl_password.clone(),
            sasl_mechanism: config.sasl_mechanism.clone(),
            security_protocol: config.security_protocol.clone(),
            ssl_ca_location: config.ssl_ca_location.clone(),
        }
    }
}

/// Kafka message bus implementation.
pub struct KafkaBus {
    producer: FutureProducer,
    config: KafkaBusConfig,
    closed: AtomicBool,
}

impl KafkaBus {
    /// Create the producer. Consumers are created per subscription.
    pub fn new(config: KafkaBusConfig) -> Result<Self> {
        let producer: FutureProducer = config.build_producer_config().create().map_err(|e| {
            BusError::Unavailable(format!("Failed to create Kafka producer: {}", e))
        })?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            client_id = %config.client_id,
            "Connected to Kafka"
        );

        Ok(Self {
            producer,
            config,
            closed: AtomicBool::new(false),
        })
    }

    fn headers_for(message: &OutboundMessage) -> OwnedHeaders {
        message
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_str()),
                })
            })
    }
}

/// Map a producer error onto the bus taxonomy.
fn classify(err: &KafkaError) -> BusError {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::QueueFull)
        | Some(RDKafkaErrorCode::AllBrokersDown)
        | Some(RDKafkaErrorCode::BrokerTransportFailure)
        | Some(RDKafkaErrorCode::MessageTimedOut) => BusError::Unavailable(err.to_string()),
        _ => BusError::Publish(err.to_string()),
    }
}

/// Copy a borrowed Kafka message into a [`Delivery`].
fn to_delivery(message: &BorrowedMessage<'_>) -> Delivery {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|h| {
                    h.value
                        .map(|v| (h.key.to_string(), String::from_utf8_lossy(v).into_owned()))
                })
                .collect()
        })
        .unwrap_or_default();

    Delivery {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned()),
        payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
        headers,
        delivery_count: 1,
    }
}

#[async_trait]
impl MessageBus for KafkaBus {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let headers = Self::headers_for(&message);
        let mut record = FutureRecord::to(&message.topic)
            .payload(message.payload.as_ref())
            .headers(headers);
        if let Some(ref key) = message.key {
            record = record.key(key.as_str());
        }

        let (partition, offset) = self
            .producer
            .send(record, QUEUE_TIMEOUT)
            .await
            .map_err(|(e, _)| classify(&e))?;

        debug!(
            topic = %message.topic,
            key = ?message.key,
            partition = partition,
            offset = offset,
            "Published message to Kafka"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        group: &str,
        topics: &[String],
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let consumer: StreamConsumer = self
            .config
            .build_consumer_config(group)
            .create()
            .map_err(|e| BusError::Unavailable(format!("Failed to create Kafka consumer: {}", e)))?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| BusError::Subscribe(format!("Failed to subscribe to topics: {}", e)))?;

        info!(group = %group, topics = ?topics, "Subscribed to Kafka topics");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(poll_loop(
            Arc::new(consumer),
            handler,
            shutdown_rx,
            self.config.max_redeliveries,
            group.to_string(),
        ));

        Ok(Subscription::new(group, topics.to_vec(), shutdown_tx, vec![task]))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        if let Err(e) = self.producer.flush(QUEUE_TIMEOUT) {
            warn!(error = %e, "Kafka producer flush failed on close");
        }
        info!("Kafka bus closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "kafka"
    }
}

/// Poll the consumer and fan messages out to per-partition lanes.
async fn poll_loop(
    consumer: Arc<StreamConsumer>,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: watch::Receiver<bool>,
    max_redeliveries: u32,
    group: String,
) {
    let mut lanes: HashMap<(String, i32), mpsc::Sender<Delivery>> = HashMap::new();
    let mut lane_tasks: Vec<JoinHandle<()>> = Vec::new();

    {
        let mut stream = consumer.stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = stream.next() => next,
            };

            let delivery = match next {
                Some(Ok(message)) => to_delivery(&message),
                Some(Err(e)) => {
                    error!(group = %group, error = %e, "Kafka consumer error");
                    continue;
                }
                None => break,
            };

            let lane_key = (delivery.topic.clone(), delivery.partition);
            let lane = lanes.entry(lane_key).or_insert_with(|| {
                let (tx, rx) = mpsc::channel(LANE_CAPACITY);
                lane_tasks.push(tokio::spawn(run_lane(
                    rx,
                    Arc::clone(&handler),
                    Arc::clone(&consumer),
                    max_redeliveries,
                    group.clone(),
                )));
                tx
            });

            if lane.send(delivery).await.is_err() {
                warn!(group = %group, "Kafka partition lane closed unexpectedly");
            }
        }
    }

    // Closing the senders lets each lane finish what it already holds.
    drop(lanes);
    for task in lane_tasks {
        if let Err(e) = task.await {
            warn!(group = %group, error = %e, "Kafka lane ended abnormally");
        }
    }
    debug!(group = %group, "Kafka consumer stopped");
}

/// Handle one partition's messages in order, storing each offset afterwards.
async fn run_lane(
    mut rx: mpsc::Receiver<Delivery>,
    handler: Arc<dyn MessageHandler>,
    consumer: Arc<StreamConsumer>,
    max_redeliveries: u32,
    group: String,
) {
    while let Some(delivery) = rx.recv().await {
        let topic = delivery.topic.clone();
        let partition = delivery.partition;
        let offset = delivery.offset;

        deliver(handler.as_ref(), delivery, max_redeliveries, &group).await;

        // Every terminal outcome moves the committed position past the message.
        if let Err(e) = consumer.store_offset(&topic, partition, offset + 1) {
            error!(
                group = %group,
                topic = %topic,
                partition = partition,
                offset = offset,
                error = %e,
                "Failed to store Kafka offset"
            );
        }
    }
}
