//! In-memory partitioned message bus for standalone mode.
//!
//! Each topic is split into a fixed number of partitions. A message goes to
//! the partition chosen by hashing its key, and every consumer group
//! subscribed to the topic gets its own copy. Within a group, each
//! partition is drained by one task, so same-key messages are handled in
//! order while partitions progress independently.
//!
//! Messages published to a topic with no subscribed group are dropped, the
//! same way a broadcast channel with no receivers drops them.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::{
    deliver, BusError, Delivery, MessageBus, MessageHandler, OutboundMessage, Result,
    Subscription,
};

/// Default number of partitions per topic.
pub const DEFAULT_PARTITIONS: usize = 8;
/// Default number of transport redeliveries after a retryable failure.
pub const DEFAULT_MAX_REDELIVERIES: u32 = 3;
/// Default buffered messages per partition lane.
pub const DEFAULT_LANE_CAPACITY: usize = 1024;

/// Configuration for the channel bus.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelBusConfig {
    /// Partitions per topic.
    pub partitions: usize,
    /// Redeliveries after `Outcome::RetryableFail` before a message is dropped.
    pub max_redeliveries: u32,
    /// Buffered messages per partition lane. Publishers wait when it is full.
    pub lane_capacity: usize,
}

impl Default for ChannelBusConfig {
    fn default() -> Self {
        Self {
            partitions: DEFAULT_PARTITIONS,
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
            lane_capacity: DEFAULT_LANE_CAPACITY,
        }
    }
}

/// Choose the partition for a key.
fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

/// One consumer group's partition lanes on one topic.
struct GroupLanes {
    lanes: Vec<mpsc::Sender<Delivery>>,
}

impl GroupLanes {
    fn is_stale(&self) -> bool {
        self.lanes.iter().all(|lane| lane.is_closed())
    }
}

struct Inner {
    config: ChannelBusConfig,
    /// topic -> group -> lanes
    topics: RwLock<HashMap<String, HashMap<String, GroupLanes>>>,
    /// (topic, partition) -> next offset
    offsets: Mutex<HashMap<(String, usize), i64>>,
    /// Round-robin cursor for keyless messages.
    cursor: AtomicUsize,
    closed: AtomicBool,
}

/// In-memory message bus using partitioned tokio mpsc channels.
#[derive(Clone)]
pub struct ChannelBus {
    inner: Arc<Inner>,
}

impl ChannelBus {
    /// Create a new channel bus.
    pub fn new(config: ChannelBusConfig) -> Self {
        let config = ChannelBusConfig {
            partitions: config.partitions.max(1),
            lane_capacity: config.lane_capacity.max(1),
            ..config
        };

        info!(
            partitions = config.partitions,
            max_redeliveries = config.max_redeliveries,
            "Channel bus initialized"
        );

        Self {
            inner: Arc::new(Inner {
                config,
                topics: RwLock::new(HashMap::new()),
                offsets: Mutex::new(HashMap::new()),
                cursor: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ChannelBusConfig {
        &self.inner.config
    }

    fn partition(&self, key: Option<&str>) -> usize {
        let partitions = self.inner.config.partitions;
        match key {
            Some(k) => partition_for(k, partitions),
            None => self.inner.cursor.fetch_add(1, Ordering::Relaxed) % partitions,
        }
    }

    fn next_offset(&self, topic: &str, partition: usize) -> i64 {
        let mut offsets = self
            .inner
            .offsets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = offsets.entry((topic.to_string(), partition)).or_insert(0);
        let offset = *next;
        *next += 1;
        offset
    }

    fn lanes_for(&self, topic: &str, partition: usize) -> Vec<(String, mpsc::Sender<Delivery>)> {
        let topics = self
            .inner
            .topics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        topics
            .get(topic)
            .map(|groups| {
                groups
                    .iter()
                    .map(|(group, lanes)| (group.clone(), lanes.lanes[partition].clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageBus for ChannelBus {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let partition = self.partition(message.key.as_deref());
        let offset = self.next_offset(&message.topic, partition);
        let lanes = self.lanes_for(&message.topic, partition);

        if lanes.is_empty() {
            debug!(topic = %message.topic, "Published message (no subscribers)");
            return Ok(());
        }

        let delivery = Delivery {
            topic: message.topic,
            partition: partition as i32,
            offset,
            key: message.key,
            payload: message.payload,
            headers: message.headers,
            delivery_count: 1,
        };

        for (group, lane) in lanes {
            if lane.send(delivery.clone()).await.is_err() {
                debug!(
                    topic = %delivery.topic,
                    group = %group,
                    "Consumer group lane closed, skipping"
                );
            }
        }

        debug!(
            topic = %delivery.topic,
            partition = partition,
            offset = offset,
            "Published message to channel"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        group: &str,
        topics: &[String],
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        let config = &self.inner.config;

        let mut registry = self
            .inner
            .topics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        for topic in topics {
            if let Some(existing) = registry.get(topic).and_then(|groups| groups.get(group)) {
                if !existing.is_stale() {
                    return Err(BusError::Subscribe(format!(
                        "group '{}' is already subscribed to '{}'",
                        group, topic
                    )));
                }
            }
        }

        for topic in topics {
            let mut lanes = Vec::with_capacity(config.partitions);
            for partition in 0..config.partitions {
                let (tx, rx) = mpsc::channel(config.lane_capacity);
                lanes.push(tx);
                tasks.push(tokio::spawn(run_lane(
                    rx,
                    Arc::clone(&handler),
                    shutdown_rx.clone(),
                    config.max_redeliveries,
                    LaneId {
                        group: group.to_string(),
                        topic: topic.clone(),
                        partition,
                    },
                )));
            }
            registry
                .entry(topic.clone())
                .or_default()
                .insert(group.to_string(), GroupLanes { lanes });
        }
        drop(registry);

        info!(
            group = %group,
            topics = ?topics,
            partitions = config.partitions,
            "Consumer group subscribed to channel bus"
        );

        Ok(Subscription::new(group, topics.to_vec(), shutdown_tx, tasks))
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        // Dropping the senders lets every lane drain and exit.
        self.inner
            .topics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        info!("Channel bus closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

struct LaneId {
    group: String,
    topic: String,
    partition: usize,
}

/// Drain one partition lane for one consumer group.
async fn run_lane(
    mut rx: mpsc::Receiver<Delivery>,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: watch::Receiver<bool>,
    max_redeliveries: u32,
    lane: LaneId,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = rx.recv() => match next {
                Some(d) => d,
                None => break,
            },
        };
        deliver(handler.as_ref(), delivery, max_redeliveries, &lane.group).await;
    }
    debug!(
        group = %lane.group,
        topic = %lane.topic,
        partition = lane.partition,
        "Channel lane stopped"
    );
}

#[cfg(test)]
mod tests;
