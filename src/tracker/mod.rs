//! Correlation tracker.
//!
//! Maps a correlation id to the caller waiting on it. Each waiter is removed
//! exactly once: by a matching response, by its timeout firing, or by the
//! caller dropping its [`PendingResponse`]. Removal happens under one mutex,
//! so a response racing the timeout completes the future at most once and
//! the loser observes an absent entry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::envelope::ResponseEnvelope;
use crate::error::{BridgeError, Result};

type Completion = Result<ResponseEnvelope>;

/// A caller waiting for one response.
struct PendingWaiter {
    /// Distinguishes this waiter from a later one reusing the same id.
    token: u64,
    complete: oneshot::Sender<Completion>,
    issued_at: DateTime<Utc>,
    started: Instant,
    timeout: Duration,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    waiters: Mutex<HashMap<Uuid, PendingWaiter>>,
    next_token: AtomicU64,
}

impl Inner {
    fn waiters(&self) -> MutexGuard<'_, HashMap<Uuid, PendingWaiter>> {
        self.waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remove the waiter for `id` only if it is still the one holding `token`.
    fn remove_if_current(&self, id: Uuid, token: u64) -> Option<PendingWaiter> {
        let mut waiters = self.waiters();
        match waiters.get(&id) {
            Some(w) if w.token == token => waiters.remove(&id),
            _ => None,
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let waiters = self
            .waiters
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, waiter) in waiters.drain() {
            waiter.timer.abort();
        }
    }
}

/// How a response was matched against the pending table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A live waiter received the response.
    Matched {
        /// Wall-clock dispatch time recorded when the waiter was registered.
        issued_at: DateTime<Utc>,
        /// Monotonic time the caller spent waiting.
        waited: Duration,
    },
    /// No live waiter: unknown, duplicate or late response.
    Unmatched,
}

impl Resolution {
    pub fn is_matched(&self) -> bool {
        matches!(self, Self::Matched { .. })
    }
}

/// Owned table of pending waiters keyed by correlation id.
///
/// Cloning is cheap; clones share the same table.
#[derive(Clone, Default)]
pub struct CorrelationTracker {
    inner: Arc<Inner>,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `correlation_id` that expires after `timeout`.
    ///
    /// Must be called from within a tokio runtime; the timeout clock is a
    /// spawned task on tokio's timer.
    pub fn track(&self, correlation_id: Uuid, timeout: Duration) -> Result<PendingResponse> {
        let mut waiters = self.inner.waiters();
        if waiters.contains_key(&correlation_id) {
            return Err(BridgeError::DuplicateCorrelation(correlation_id));
        }

        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let (complete, receiver) = oneshot::channel();
        let timer = tokio::spawn(expire_after(
            Arc::downgrade(&self.inner),
            correlation_id,
            token,
            timeout,
        ));

        waiters.insert(
            correlation_id,
            PendingWaiter {
                token,
                complete,
                issued_at: Utc::now(),
                started: Instant::now(),
                timeout,
                timer,
            },
        );
        debug!(correlation_id = %correlation_id, timeout = ?timeout, "Tracking request");

        Ok(PendingResponse {
            correlation_id,
            token,
            receiver,
            tracker: Arc::downgrade(&self.inner),
            finished: false,
        })
    }

    /// Hand `response` to the waiter for `correlation_id`, if one is live.
    pub fn resolve(&self, correlation_id: Uuid, response: ResponseEnvelope) -> Resolution {
        let Some(waiter) = self.inner.waiters().remove(&correlation_id) else {
            info!(
                correlation_id = %correlation_id,
                "Response has no pending waiter (unknown, duplicate or late)"
            );
            return Resolution::Unmatched;
        };

        waiter.timer.abort();
        let waited = waiter.started.elapsed();
        if waiter.complete.send(Ok(response)).is_err() {
            debug!(correlation_id = %correlation_id, "Waiter dropped before resolution");
        }
        debug!(correlation_id = %correlation_id, waited = ?waited, "Resolved request");

        Resolution::Matched {
            issued_at: waiter.issued_at,
            waited,
        }
    }

    /// Complete the waiter for `correlation_id` with a timeout error.
    ///
    /// Returns false if the waiter was already gone.
    pub fn expire(&self, correlation_id: Uuid) -> bool {
        let Some(waiter) = self.inner.waiters().remove(&correlation_id) else {
            return false;
        };
        expire_waiter(correlation_id, waiter);
        true
    }

    /// Stop waiting for `correlation_id` without completing it.
    ///
    /// The in-flight request is not recalled; its response becomes unmatched.
    pub fn cancel(&self, correlation_id: Uuid) -> bool {
        match self.inner.waiters().remove(&correlation_id) {
            Some(waiter) => {
                waiter.timer.abort();
                debug!(correlation_id = %correlation_id, "Cancelled pending request");
                true
            }
            None => false,
        }
    }

    /// Drop every waiter. Their futures complete with `BridgeError::Closed`.
    pub fn close(&self) -> usize {
        let drained: Vec<_> = self.inner.waiters().drain().collect();
        let count = drained.len();
        for (_, waiter) in drained {
            waiter.timer.abort();
        }
        if count > 0 {
            warn!(pending = count, "Correlation tracker closed with pending requests");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.inner.waiters().len()
    }

    pub fn is_pending(&self, correlation_id: Uuid) -> bool {
        self.inner.waiters().contains_key(&correlation_id)
    }
}

fn expire_waiter(correlation_id: Uuid, waiter: PendingWaiter) {
    waiter.timer.abort();
    warn!(
        correlation_id = %correlation_id,
        timeout = ?waiter.timeout,
        "Request timed out waiting for a response"
    );
    let _ = waiter.complete.send(Err(BridgeError::Timeout {
        correlation_id,
        after: waiter.timeout,
    }));
}

/// Timeout clock for one waiter.
///
/// Only expires the waiter holding `token`: an abort cannot stop a timer that
/// has already woken, and the id may have been tracked again since.
async fn expire_after(tracker: Weak<Inner>, correlation_id: Uuid, token: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(inner) = tracker.upgrade() {
        let waiter = inner.remove_if_current(correlation_id, token);
        if let Some(waiter) = waiter {
            expire_waiter(correlation_id, waiter);
        }
    }
}

/// Future for one tracked response.
///
/// Resolves with the response, or fails with `Timeout` (or `Closed` if the
/// tracker went away). Dropping it before completion removes the waiter.
#[must_use = "dropping a PendingResponse cancels the wait"]
pub struct PendingResponse {
    correlation_id: Uuid,
    token: u64,
    receiver: oneshot::Receiver<Completion>,
    tracker: Weak<Inner>,
    finished: bool,
}

impl PendingResponse {
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

impl Future for PendingResponse {
    type Output = Result<ResponseEnvelope>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let polled = Pin::new(&mut self.receiver).poll(cx);
        match polled {
            Poll::Ready(completion) => {
                self.finished = true;
                Poll::Ready(completion.unwrap_or(Err(BridgeError::Closed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(inner) = self.tracker.upgrade() {
            if let Some(waiter) = inner.remove_if_current(self.correlation_id, self.token) {
                waiter.timer.abort();
                debug!(correlation_id = %self.correlation_id, "Caller stopped waiting");
            }
        }
    }
}
