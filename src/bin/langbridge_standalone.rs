//! langbridge-standalone: dispatcher, router and worker in one process
//!
//! ## Architecture
//! ```text
//! stdin ──→ RequestDispatcher ──→ {domain}-requests ──→ WorkerRunner ──→ LoopbackWorker
//!                 ▲                                          │
//!                 │                                          ▼
//!        CorrelationTracker ◀── ResponseRouter ◀── {domain}-responses
//! ```
//!
//! Each stdin line `<source> <target> <text>` becomes one translation
//! request; `sum <text>` becomes a short summarization. Results are printed
//! to stdout as they arrive.
//!
//! ## Configuration
//! ```yaml
//! messaging:
//!   type: channel        # or kafka (requires the `kafka` feature)
//! retry:
//!   max_attempts: 3
//!   backoff_base_ms: 1000
//! requests:
//!   default_timeout_ms: 30000
//! metrics:
//!   port: 9090
//! ```

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};

use langbridge::bus::init_bus;
use langbridge::config::BridgeConfig;
use langbridge::dispatcher::RequestDispatcher;
use langbridge::dlq::BusDeadLetterPublisher;
use langbridge::envelope::{SummaryType, WorkRequest};
use langbridge::events::EventPublisher;
use langbridge::health::HealthMonitor;
use langbridge::metrics::{self, server};
use langbridge::router::ResponseRouter;
use langbridge::tracker::CorrelationTracker;
use langbridge::utils::bootstrap::{init_tracing, shutdown_signal};
use langbridge::worker::{LoopbackWorker, Worker, WorkerRunner};

const STDIN_USER: &str = "stdin";

/// Parse one input line into a request.
fn parse_line(line: &str) -> Option<WorkRequest> {
    let line = line.trim();
    if let Some(text) = line.strip_prefix("sum ") {
        return Some(WorkRequest::summarization(
            STDIN_USER,
            text.trim(),
            SummaryType::Short,
            None,
        ));
    }
    let mut parts = line.splitn(3, ' ');
    let source = parts.next()?;
    let target = parts.next()?;
    let text = parts.next()?.trim();
    Some(WorkRequest::translation(STDIN_USER, text, source, target))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = BridgeConfig::load(config_path.as_deref())?;
    info!(
        messaging_type = ?config.messaging.messaging_type,
        service = %config.service_name,
        "Starting langbridge-standalone"
    );

    let bus = init_bus(&config.messaging).await?;
    let events = EventPublisher::new(bus.clone(), &config.topics, config.service_name.clone())
        .with_transport_retry(config.transport_retry.clone());

    // Worker side
    let worker: Arc<dyn Worker> = Arc::new(LoopbackWorker::new());
    let monitor = HealthMonitor::new(worker.clone())
        .with_interval(config.health.interval())
        .with_probe_timeout(config.health.probe_timeout());
    let readiness = monitor.readiness();
    let health_task = monitor.spawn();

    let dlq = Arc::new(BusDeadLetterPublisher::new(
        bus.clone(),
        config.topics.dead_letter.clone(),
        config.service_name.clone(),
        config.transport_retry.clone(),
    ));
    let runner = Arc::new(
        WorkerRunner::new(worker, bus.clone(), dlq)
            .with_topics(config.topics.clone())
            .with_limits(config.limits.clone())
            .with_retry_policy(config.retry.clone())
            .with_transport_retry(config.transport_retry.clone())
            .with_readiness(readiness.clone())
            .with_service_name(config.service_name.clone()),
    );
    let worker_subscription = runner.start(&config.groups.worker).await?;

    // Caller side
    let tracker = CorrelationTracker::new();
    let mut router = ResponseRouter::new(tracker.clone()).with_topics(config.topics.clone());
    if config.metrics.publish_to_bus {
        router = router.with_events(events.clone());
    }
    let router_subscription = Arc::new(router)
        .start(bus.as_ref(), &config.groups.router)
        .await?;

    let dispatcher = RequestDispatcher::new(bus.clone(), tracker.clone())
        .with_topics(config.topics.clone())
        .with_limits(config.limits.clone())
        .with_default_timeout(config.requests.default_timeout())
        .with_transport_retry(config.transport_retry.clone())
        .with_events(events)
        .with_service_name(config.service_name.clone());

    // Metrics endpoint
    let (stop_tx, _) = watch::channel(false);
    let metrics_task = {
        let registry = metrics::registry::global();
        let port = config.metrics.port;
        let mut stop = stop_tx.subscribe();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop.wait_for(|stopped| *stopped).await;
            };
            if let Err(e) = server::serve(registry, readiness, port, shutdown).await {
                error!(error = %e, "Metrics endpoint failed");
            }
        })
    };

    info!("Ready: enter '<source> <target> <text>' or 'sum <text>'");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Failed to read stdin");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let Some(request) = parse_line(&line) else {
                    warn!(line = %line, "Expected '<source> <target> <text>' or 'sum <text>'");
                    continue;
                };
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    match dispatcher.submit(request, None).await {
                        Ok(result) => println!("{}", result.text()),
                        Err(e) => println!("error [{}]: {}", e.kind(), e),
                    }
                });
            }
        }
    }

    // Let in-flight requests settle before tearing the pipeline down.
    let drain_deadline = tokio::time::Instant::now() + config.requests.default_timeout();
    while tracker.pending_count() > 0 && tokio::time::Instant::now() < drain_deadline {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    let _ = stop_tx.send(true);
    router_subscription.close().await;
    worker_subscription.close().await;
    let abandoned = tracker.close();
    if abandoned > 0 {
        warn!(abandoned = abandoned, "Closed with requests still pending");
    }
    health_task.abort();
    let _ = metrics_task.await;
    bus.close().await?;

    info!("langbridge-standalone stopped");
    Ok(())
}
