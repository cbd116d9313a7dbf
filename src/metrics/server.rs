//! HTTP endpoint for scraping and probes.
//!
//! - `GET /metrics`: Prometheus text exposition
//! - `GET /health`: liveness, always 200 while the process runs
//! - `GET /ready`: 200 when the worker capability is ready, 503 otherwise

use std::future::Future;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;
use tracing::info;

use super::Registry;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Clone)]
struct ServerState {
    registry: Arc<Registry>,
    readiness: watch::Receiver<bool>,
}

/// Start the metrics server on the given port, stopping when `shutdown` resolves.
///
/// When `port` is 0, the OS assigns an ephemeral port. The actual bound
/// port is always logged so it can be discovered.
pub async fn serve(
    registry: Arc<Registry>,
    readiness: watch::Receiver<bool>,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(registry, readiness);
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let actual_port = listener.local_addr()?.port();
    info!(port = actual_port, "metrics endpoint listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Build the axum router (separated for testing).
pub fn router(registry: Arc<Registry>, readiness: watch::Receiver<bool>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(ServerState { registry, readiness })
}

async fn render_metrics(State(state): State<ServerState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.registry.render(),
    )
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn ready(State(state): State<ServerState>) -> StatusCode {
    if *state.readiness.borrow() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
