//! Per-message retry policy for worker failures.
//!
//! Attempts are numbered from 0. After failed attempt `n` the runner waits
//! `backoff_base * 2^n` and tries again, until `max_attempts` attempts have
//! failed. The delays come from a jitter-free `backon` exponential backoff,
//! so with the defaults a message is tried at 0s, 1s and 3s and then
//! dead-lettered with `failed_attempts = 3`.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use serde::Deserialize;

/// Default number of processing attempts per message.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay after the first failed attempt.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
/// Default deadline for one processing attempt.
pub const DEFAULT_PROCESSING_DEADLINE_MS: u64 = 60_000;

/// Worker retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts before dead-lettering. Values below 1 are treated as 1.
    pub max_attempts: u32,
    /// Delay after attempt 0; doubles after each further failure.
    pub backoff_base_ms: u64,
    /// Deadline for a single call into the worker capability.
    pub processing_deadline_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            processing_deadline_ms: DEFAULT_PROCESSING_DEADLINE_MS,
        }
    }
}

impl RetryPolicy {
    pub fn processing_deadline(&self) -> Duration {
        Duration::from_millis(self.processing_deadline_ms)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Exponential, jitter-free backoff yielding one delay per permitted retry.
    fn backoff(&self) -> ExponentialBackoff {
        let base = Duration::from_millis(self.backoff_base_ms);
        let retries = self.max_attempts() - 1;
        let ceiling = base.saturating_mul(2u32.saturating_pow(retries));
        ExponentialBuilder::default()
            .with_min_delay(base)
            .with_max_delay(ceiling)
            .with_factor(2.0)
            .with_max_times(retries as usize)
            .build()
    }

    /// Fresh state for one message.
    pub fn start(&self) -> RetryState {
        RetryState {
            attempt: 0,
            max_attempts: self.max_attempts(),
            next_delay: None,
            delays: self.backoff(),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then run attempt number `attempt`.
    Retry { attempt: u32, delay: Duration },
    /// Give up; `failed_attempts` attempts were made.
    DeadLetter { failed_attempts: u32 },
}

/// Retry bookkeeping for one message. Discarded once it reaches a terminal state.
pub struct RetryState {
    attempt: u32,
    max_attempts: u32,
    next_delay: Option<Duration>,
    delays: ExponentialBackoff,
}

impl RetryState {
    /// The attempt currently being run, starting at 0.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay chosen by the most recent retry decision.
    pub fn next_delay(&self) -> Option<Duration> {
        self.next_delay
    }

    /// Record that the current attempt failed and decide what happens next.
    pub fn record_failure(&mut self) -> RetryDecision {
        match self.delays.next() {
            Some(delay) if self.attempt + 1 < self.max_attempts => {
                self.attempt += 1;
                self.next_delay = Some(delay);
                RetryDecision::Retry {
                    attempt: self.attempt,
                    delay,
                }
            }
            _ => {
                self.next_delay = None;
                RetryDecision::DeadLetter {
                    failed_attempts: self.attempt + 1,
                }
            }
        }
    }
}
