//! Test doubles shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::bus::{Delivery, MessageHandler, OutboundMessage, Outcome};
use crate::envelope::{WorkPayload, WorkResult};
use crate::worker::{Worker, WorkerError};

/// Build a keyed message with no headers.
pub fn message(topic: &str, key: &str, payload: &[u8]) -> OutboundMessage {
    OutboundMessage {
        topic: topic.to_string(),
        key: Some(key.to_string()),
        payload: Bytes::copy_from_slice(payload),
        headers: HashMap::new(),
    }
}

/// Handler that records every delivery and replies from a script.
#[derive(Default)]
pub struct RecordingHandler {
    deliveries: Mutex<Vec<Delivery>>,
    /// Outcomes returned in order; `Ack` once exhausted.
    outcomes: Mutex<Vec<Outcome>>,
    delay: Option<Duration>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn with_outcomes(mut outcomes: Vec<Outcome>) -> Arc<Self> {
        outcomes.reverse();
        Arc::new(Self {
            outcomes: Mutex::new(outcomes),
            ..Self::default()
        })
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, delivery: &Delivery) -> Outcome {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.deliveries.lock().unwrap().push(delivery.clone());
        self.outcomes.lock().unwrap().pop().unwrap_or(Outcome::Ack)
    }
}

/// Worker that fails a fixed number of times, then echoes its input.
pub struct ScriptedWorker {
    failures: usize,
    calls: AtomicUsize,
    healthy: AtomicBool,
    delay: Option<Duration>,
}

impl ScriptedWorker {
    /// Succeeds on every call.
    pub fn ok() -> Arc<Self> {
        Self::failing(0)
    }

    /// Fails the first `failures` calls.
    pub fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            delay: None,
        })
    }

    /// Takes `delay` to answer every call.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            failures: 0,
            calls: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            delay: Some(delay),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn process(&self, payload: &WorkPayload) -> Result<WorkResult, WorkerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if call < self.failures {
            return Err(WorkerError::new(
                "SCRIPTED_FAILURE",
                format!("scripted failure {}", call + 1),
            ));
        }
        Ok(match payload {
            WorkPayload::Translation { text, .. } => WorkResult::Translation {
                translated_text: format!("[ar] {}", text),
            },
            WorkPayload::Summarization { text, .. } => WorkResult::Summarization {
                summarized_text: text.clone(),
                original_length: text.chars().count(),
                summary_length: text.chars().count(),
            },
        })
    }

    async fn health_check(&self) -> Result<(), WorkerError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WorkerError::new("UNHEALTHY", "scripted health failure"))
        }
    }
}
