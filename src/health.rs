//! Readiness probing for the worker capability.
//!
//! The [`HealthMonitor`] calls the capability's side-effect-free health
//! check on an interval and publishes the result on a `watch` channel. A
//! failing probe flips readiness off; it never stops the process. The
//! worker runner holds messages while readiness is off.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::{MetricsSink, PrometheusMetrics};
use crate::worker::Worker;

/// Default time between probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(10_000);
/// Default bound on a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Periodic readiness probe.
pub struct HealthMonitor {
    worker: Arc<dyn Worker>,
    interval: Duration,
    probe_timeout: Duration,
    metrics: Arc<dyn MetricsSink>,
    ready: watch::Sender<bool>,
}

impl HealthMonitor {
    /// Not ready until the first probe succeeds.
    pub fn new(worker: Arc<dyn Worker>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            worker,
            interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            metrics: Arc::new(PrometheusMetrics::new()),
            ready,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// A receiver tracking current readiness.
    pub fn readiness(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Probe once and publish the result. Returns the new readiness.
    pub async fn probe_once(&self) -> bool {
        let ready = match tokio::time::timeout(self.probe_timeout, self.worker.health_check()).await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(code = %e.code, error = %e.message, "Worker health check failed");
                false
            }
            Err(_) => {
                warn!(timeout = ?self.probe_timeout, "Worker health check timed out");
                false
            }
        };

        let was_ready = self.ready.send_replace(ready);
        if was_ready != ready {
            info!(ready = ready, "Worker readiness changed");
        } else {
            debug!(ready = ready, "Worker probed");
        }
        self.metrics.worker_ready(ready);
        ready
    }

    /// Probe on the configured interval until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                self.probe_once().await;
            }
        })
    }
}
