//! Status and metrics HTTP endpoint.
//!
//! - `GET /status`: `200 {"status": {..., "state": "RUNNING"}}` while the
//!   worker runs, `503` with `"state": "TERMINATED"` once draining starts
//! - `GET /metrics`: Prometheus text exposition, merged across processes

use crate::config::ServerConfig;
use crate::core::StatusSource;
use crate::error::{DockhandError, DockhandResult};
use crate::metrics::WorkerMetrics;
use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Clone)]
struct AppState {
    status: Arc<dyn StatusSource>,
    metrics: Arc<WorkerMetrics>,
}

/// Build the router.
pub fn router(status: Arc<dyn StatusSource>, metrics: Arc<WorkerMetrics>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(AppState { status, metrics })
}

async fn status_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.status.snapshot();
    let code = if snapshot.is_running() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(json!({ "status": snapshot }))).into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.scrape() {
        Ok(body) => (
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Bind the configured address.
pub async fn bind(config: &ServerConfig) -> DockhandResult<TcpListener> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| DockhandError::transport(format!("cannot bind status server on {}", addr), e))?;
    tracing::info!("Status server listening on {}", addr);
    Ok(listener)
}

/// Serve until `shutdown` flips to `true`.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> DockhandResult<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}
