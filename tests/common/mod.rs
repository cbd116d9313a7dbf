//! Shared utilities for integration tests.
//!
//! Wires a full pipeline (dispatcher, router, worker runner, dead-letter
//! sink) over the in-process channel bus.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use langbridge::bus::{
    ChannelBus, ChannelBusConfig, Delivery, MessageBus, MessageHandler, Outcome, Subscription,
    TransportRetryConfig,
};
use langbridge::dispatcher::RequestDispatcher;
use langbridge::dlq::{BusDeadLetterPublisher, DeadLetterRecord};
use langbridge::envelope::{ResponseEnvelope, WorkPayload, WorkResult};
use langbridge::metrics::MemoryMetrics;
use langbridge::router::ResponseRouter;
use langbridge::topics::TopicConfig;
use langbridge::tracker::CorrelationTracker;
use langbridge::worker::{RetryPolicy, Worker, WorkerError, WorkerRunner};

pub const WORKER_GROUP: &str = "it-worker";
pub const ROUTER_GROUP: &str = "it-router";
pub const OBSERVER_GROUP: &str = "it-observer";

/// Handler that keeps every delivery, for observing a topic from the side.
#[derive(Default)]
pub struct Collector {
    deliveries: Mutex<Vec<Delivery>>,
}

impl Collector {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.deliveries()
            .iter()
            .map(|d| serde_json::from_slice(&d.payload).unwrap())
            .collect()
    }

    pub fn responses(&self) -> Vec<ResponseEnvelope> {
        self.deliveries()
            .iter()
            .map(|d| ResponseEnvelope::decode(&d.payload).unwrap())
            .collect()
    }

    /// Wait until at least `n` deliveries arrived.
    pub async fn wait_for(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(60), async {
            while self.len() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {} deliveries, saw {}", n, self.len()));
    }
}

#[async_trait]
impl MessageHandler for Collector {
    async fn handle(&self, delivery: &Delivery) -> Outcome {
        self.deliveries.lock().unwrap().push(delivery.clone());
        Outcome::Ack
    }
}

/// Worker that fails the first `failures` calls, then translates by tagging.
pub struct FlakyWorker {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyWorker {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn always_failing() -> Arc<Self> {
        Self::new(usize::MAX)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for FlakyWorker {
    async fn process(&self, payload: &WorkPayload) -> Result<WorkResult, WorkerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(WorkerError::new(
                "MODEL_UNAVAILABLE",
                format!("attempt {} failed", call),
            ));
        }
        Ok(WorkResult::Translation {
            translated_text: format!("ar:{}", payload.text()),
        })
    }

    async fn health_check(&self) -> Result<(), WorkerError> {
        Ok(())
    }
}

/// Worker that holds every call until released.
#[derive(Default)]
pub struct GatedWorker {
    gate: Notify,
}

impl GatedWorker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl Worker for GatedWorker {
    async fn process(&self, payload: &WorkPayload) -> Result<WorkResult, WorkerError> {
        self.gate.notified().await;
        Ok(WorkResult::Translation {
            translated_text: format!("late:{}", payload.text()),
        })
    }

    async fn health_check(&self) -> Result<(), WorkerError> {
        Ok(())
    }
}

/// A running dispatcher/router/worker pipeline over one channel bus.
pub struct Pipeline {
    pub bus: Arc<ChannelBus>,
    pub tracker: CorrelationTracker,
    pub dispatcher: RequestDispatcher,
    pub metrics: Arc<MemoryMetrics>,
    pub dead_letters: Arc<Collector>,
    pub responses: Arc<Collector>,
    subscriptions: Vec<Subscription>,
}

impl Pipeline {
    pub async fn start(worker: Arc<dyn Worker>) -> Self {
        Self::start_with_retry(worker, RetryPolicy::default()).await
    }

    pub async fn start_with_retry(worker: Arc<dyn Worker>, retry: RetryPolicy) -> Self {
        let topics = TopicConfig::default();
        let bus = Arc::new(ChannelBus::new(ChannelBusConfig::default()));
        let metrics = Arc::new(MemoryMetrics::new());
        let mut subscriptions = Vec::new();

        let dead_letters = Arc::new(Collector::default());
        subscriptions.push(
            bus.subscribe(
                OBSERVER_GROUP,
                &[topics.dead_letter.clone()],
                dead_letters.clone(),
            )
            .await
            .unwrap(),
        );

        let responses = Arc::new(Collector::default());
        subscriptions.push(
            bus.subscribe(OBSERVER_GROUP, &topics.response_topics(), responses.clone())
                .await
                .unwrap(),
        );

        let dlq = Arc::new(BusDeadLetterPublisher::new(
            bus.clone(),
            topics.dead_letter.clone(),
            "it-worker",
            TransportRetryConfig::none(),
        ));
        let runner = Arc::new(
            WorkerRunner::new(worker, bus.clone(), dlq)
                .with_metrics(metrics.clone())
                .with_retry_policy(retry),
        );
        subscriptions.push(runner.start(WORKER_GROUP).await.unwrap());

        let tracker = CorrelationTracker::new();
        let router = Arc::new(ResponseRouter::new(tracker.clone()).with_metrics(metrics.clone()));
        subscriptions.push(router.start(bus.as_ref(), ROUTER_GROUP).await.unwrap());

        let dispatcher = RequestDispatcher::new(bus.clone(), tracker.clone())
            .with_metrics(metrics.clone());

        Self {
            bus,
            tracker,
            dispatcher,
            metrics,
            dead_letters,
            responses,
            subscriptions,
        }
    }

    pub async fn shutdown(self) {
        for subscription in self.subscriptions {
            subscription.close().await;
        }
        self.tracker.close();
        self.bus.close().await.unwrap();
    }
}
