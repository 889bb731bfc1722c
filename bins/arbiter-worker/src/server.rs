// Health and metrics endpoints

use arbiter_engine::gate::GateStatus;
use arbiter_engine::{metrics, AvailabilityGate, QueueStats, SubmissionQueue};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<AvailabilityGate>,
    pub queue: Arc<SubmissionQueue>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub sandbox: GateStatus,
    pub queue: QueueStats,
}

/// 200 while the sandbox answers probes, 503 otherwise.
pub fn health_report(sandbox: GateStatus, queue: QueueStats) -> (StatusCode, HealthReport) {
    if sandbox.is_available() {
        (
            StatusCode::OK,
            HealthReport {
                status: "ok",
                sandbox,
                queue,
            },
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            HealthReport {
                status: "unavailable",
                sandbox,
                queue,
            },
        )
    }
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (code, report) = health_report(state.gate.snapshot().await, state.queue.stats().await);
    (code, Json(report))
}

async fn metrics_text() -> Response {
    match metrics::gather_text() {
        Ok(body) => body.into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

/// Serve until the shutdown flag flips.
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, routes(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}
