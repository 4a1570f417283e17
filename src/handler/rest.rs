use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::app::AppState;
use crate::jobs::Job;

pub fn rest_router() -> Router<AppState> {
    Router::new()
        .route("/oauth/callback", get(oauth_callback))
        .route("/catalog/sync/{tenant_id}", post(trigger_catalog_sync))
}

#[derive(Debug, Deserialize)]
pub struct OauthCallbackParams {
    pub code: String,
    pub state: Option<String>,
}

pub(crate) async fn oauth_callback(
    State(state): State<AppState>,
    Query(params): Query<OauthCallbackParams>,
) -> Response {
    let Some(pos) = state.pos.as_ref() else {
        return (StatusCode::NOT_FOUND, "POS integration not configured").into_response();
    };
    match pos.exchange_code(&params.code).await {
        Ok(()) => {
            info!(state = ?params.state, "POS store connected");
            Html(
                "<html><body><h3>Store connected.</h3>\
                 <p>You can close this window.</p></body></html>",
            )
            .into_response()
        }
        Err(e) => {
            warn!("oauth code exchange failed: {:#}", e);
            (StatusCode::BAD_GATEWAY, "code exchange failed").into_response()
        }
    }
}

pub(crate) async fn trigger_catalog_sync(
    Path(tenant_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    state
        .job_sender
        .send(Job::SyncCatalog {
            tenant_id: tenant_id.clone(),
        })
        .ok();
    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "queued", "tenantId": tenant_id })),
    )
        .into_response()
}
