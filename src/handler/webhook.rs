use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::app::AppState;
use crate::jobs::Job;

pub fn webhook_router() -> Router<AppState> {
    Router::new()
        .route("/webhooks/voice", post(voice_webhook))
        .route("/webhooks/pos", post(pos_webhook))
}

/// Ack synchronously, work later: the transport retries on non-200 and the
/// job queue owns delivery from here.
pub(crate) async fn voice_webhook(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Response {
    let call_id = payload["call_id"].as_str().unwrap_or_default().to_string();
    let tenant_id = payload["tenant_id"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    debug!(tenant_id, call_id, "voice webhook received");
    state
        .job_sender
        .send(Job::CallEnded {
            tenant_id,
            call_id,
            payload,
        })
        .ok();
    StatusCode::OK.into_response()
}

pub(crate) async fn pos_webhook(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Response {
    let tenant_id = payload["merchant_id"]
        .as_str()
        .or_else(|| payload["tenant_id"].as_str())
        .unwrap_or_default()
        .to_string();
    if tenant_id.is_empty() {
        warn!("pos webhook without a merchant id, ignoring");
        return StatusCode::OK.into_response();
    }
    debug!(tenant_id, "pos webhook received, queueing catalog sync");
    state.job_sender.send(Job::SyncCatalog { tenant_id }).ok();
    StatusCode::OK.into_response()
}
