// src/server/metrics_server.rs

use crate::core::herd::Herd;
use crate::core::metrics::{gather_metrics, INSTALLER_QUEUE_LENGTH, SUB_COUNT, UPDATES_DISABLED};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Handles HTTP requests to the /metrics endpoint.
///
/// Refreshes the gauges that reflect current Herd state before gathering
/// and encoding everything in the Prometheus text format.
async fn metrics_handler(herd: Arc<Herd>) -> impl IntoResponse {
    SUB_COUNT.set(herd.sub_count() as f64);
    UPDATES_DISABLED.set(if herd.updates_disabled_reason().is_some() { 1.0 } else { 0.0 });
    INSTALLER_QUEUE_LENGTH.set(herd.installer_queue().len() as f64);

    let body = gather_metrics();
    (StatusCode::OK, [("content-type", "text/plain; version=0.0.4")], body)
}

/// Runs a simple HTTP server exposing Prometheus metrics on /metrics.
pub async fn run_metrics_server(herd: Arc<Herd>, port: u16, mut shutdown_rx: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(move || metrics_handler(herd.clone())));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("prometheus metrics server listening on http://{addr}/metrics");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind metrics server on port {port}: {e}");
            return Err(e.into());
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("metrics server shutting down");
        })
        .await?;
    Ok(())
}
