// src/server/admin.rs

//! The administrative HTTP surface: disable/enable updates, change the
//! default image, and force a fast update or clear a safety shutoff on a
//! single sub. Every handler maps directly onto a `Herd` method; this
//! module's only job is request parsing and status-code translation.

use crate::core::errors::HerdError;
use crate::core::herd::Herd;
use crate::core::sub::rpc::{FramedSubRpcClient, PollReply, SubRpcClient};
use crate::core::sub::{compute_objects_to_send, compute_update_set};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{post, put};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

pub fn router(herd: Arc<Herd>) -> Router {
    Router::new()
        .route("/admin/updates/disable", post(disable_updates))
        .route("/admin/updates/enable", post(enable_updates))
        .route("/admin/default-image", put(set_default_image))
        .route("/admin/subs/{hostname}/fast-update", post(fast_update))
        .route("/admin/subs/{hostname}/clear-safety-shutoff", post(clear_safety_shutoff))
        .with_state(herd)
}

#[derive(Deserialize)]
struct DisableUpdatesRequest {
    by: String,
    reason: String,
}

async fn disable_updates(State(herd): State<Arc<Herd>>, Json(req): Json<DisableUpdatesRequest>) -> impl IntoResponse {
    match herd.disable_updates(&req.by, &req.reason) {
        Ok(()) => {
            info!(by = %req.by, reason = %req.reason, "updates disabled");
            StatusCode::OK.into_response()
        }
        Err(e) => herd_error_response(e),
    }
}

async fn enable_updates(State(herd): State<Arc<Herd>>) -> impl IntoResponse {
    herd.enable_updates();
    info!("updates enabled");
    StatusCode::OK
}

#[derive(Deserialize)]
struct SetDefaultImageRequest {
    name: String,
}

async fn set_default_image(
    State(herd): State<Arc<Herd>>,
    Json(req): Json<SetDefaultImageRequest>,
) -> impl IntoResponse {
    match herd.set_default_image(&req.name).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => herd_error_response(e),
    }
}

#[derive(Deserialize, Default)]
struct FastUpdateRequest {
    timeout_ms: Option<u64>,
}

async fn fast_update(
    State(herd): State<Arc<Herd>>,
    Path(hostname): Path<String>,
    body: Option<Json<FastUpdateRequest>>,
) -> impl IntoResponse {
    let Some(sub) = herd.get_sub(&hostname) else {
        return (StatusCode::NOT_FOUND, format!("unknown sub: {hostname}")).into_response();
    };
    let timeout = body
        .and_then(|Json(req)| req.timeout_ms)
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(15 * 60));

    let machine = sub.mdb();
    let Some(image_name) = herd.effective_image_name(&machine) else {
        return (StatusCode::BAD_REQUEST, "sub has no required or default image".to_string()).into_response();
    };
    let Some(image) = herd.image_manager.get_no_error(&image_name).await else {
        return (StatusCode::NOT_FOUND, format!("unknown image: {image_name}")).into_response();
    };

    let stream = match herd.reverse_dialer.dial(&machine.ip_address, crate::config::SUB_RPC_PORT).await {
        Ok(s) => s,
        Err(e) => return (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    };
    let client: Arc<dyn SubRpcClient> = Arc::new(FramedSubRpcClient::new(stream));

    let reply = match client.poll(sub.generation_count(), true).await {
        Ok(r) => r,
        Err(e) => return (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    };
    let (sub_fs, sub_objects) = match reply {
        PollReply::Unchanged => return StatusCode::OK.into_response(),
        PollReply::Snapshot { filesystem, object_hashes, .. } => (filesystem, object_hashes),
    };

    let update_set = compute_update_set(&image, &herd.computed_files, &hostname, &sub_fs);
    if update_set.is_empty() {
        return StatusCode::OK.into_response();
    }
    let sub_has: HashSet<_> = sub_objects.into_iter().collect();
    let objects_to_send = compute_objects_to_send(&update_set, &sub_has);

    match sub.fast_update(client, update_set, objects_to_send, timeout).await {
        Ok(_outcomes) => StatusCode::OK.into_response(),
        Err(e) => herd_error_response(e),
    }
}

async fn clear_safety_shutoff(State(herd): State<Arc<Herd>>, Path(hostname): Path<String>) -> impl IntoResponse {
    let Some(sub) = herd.get_sub(&hostname) else {
        return (StatusCode::NOT_FOUND, format!("unknown sub: {hostname}")).into_response();
    };
    match sub.clear_safety_shutoff() {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => herd_error_response(e),
    }
}

fn herd_error_response(e: HerdError) -> axum::response::Response {
    let status = match &e {
        HerdError::UnknownSub(_) | HerdError::UnknownImage(_) => StatusCode::NOT_FOUND,
        HerdError::AdminRejected(_) | HerdError::MdbViolation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string()).into_response()
}

pub async fn run_admin_server(
    herd: Arc<Herd>,
    host: String,
    port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = router(herd);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "admin HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("admin server shutting down");
        })
        .await
        .map_err(|e| {
            error!(error = %e, "admin server exited with error");
            anyhow::anyhow!(e)
        })
}
