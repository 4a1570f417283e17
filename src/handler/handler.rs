use axum::{
    Json, Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    app::{AppState, SessionGuard},
    session::{ActiveSession, InboundFrame, SessionOptions},
    tools::ToolDispatcher,
};

const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_UNSUPPORTED_DATA: u16 = 1003;
const CLOSE_INTERNAL_ERROR: u16 = 1011;

pub fn session_router(prefix: &str) -> Router<AppState> {
    let prefix = prefix.trim_end_matches('/');
    Router::new().route(&format!("{}/{{call_id}}", prefix), get(ws_handler))
}

pub fn housekeeping_router() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/kill/{id}", get(kill_session))
}

#[derive(Debug, Deserialize)]
pub struct SessionParams {
    pub tenant_id: Option<String>,
    pub call_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(path_call_id): Path<String>,
    Query(params): Query<SessionParams>,
) -> Response {
    // call_id comes from the query string, falling back to the path segment.
    let call_id = params
        .call_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or(path_call_id);
    let tenant_id = params.tenant_id.clone().filter(|id| !id.is_empty());
    ws.on_upgrade(move |socket| session_socket(socket, state, call_id, tenant_id))
}

async fn reject(mut socket: WebSocket, code: u16, reason: &'static str) {
    socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await
        .ok();
}

async fn session_socket(
    socket: WebSocket,
    state: AppState,
    call_id: String,
    tenant_id: Option<String>,
) {
    let Some(tenant_id) = tenant_id else {
        state
            .total_rejected_sessions
            .fetch_add(1, Ordering::Relaxed);
        warn!(call_id, "connection without tenant_id");
        reject(socket, CLOSE_POLICY_VIOLATION, "tenant_id required").await;
        return;
    };

    let profile = match state.resolver.resolve(&tenant_id).await {
        Ok(Some(profile)) if profile.active() => Arc::new(profile),
        Ok(Some(_)) => {
            state
                .total_rejected_sessions
                .fetch_add(1, Ordering::Relaxed);
            warn!(tenant_id, call_id, "tenant is inactive");
            reject(socket, CLOSE_POLICY_VIOLATION, "tenant inactive").await;
            return;
        }
        Ok(None) => {
            state
                .total_rejected_sessions
                .fetch_add(1, Ordering::Relaxed);
            warn!(tenant_id, call_id, "unknown tenant");
            reject(socket, CLOSE_POLICY_VIOLATION, "unknown tenant").await;
            return;
        }
        Err(e) => {
            warn!(tenant_id, call_id, "tenant lookup failed: {:#}", e);
            reject(socket, CLOSE_INTERNAL_ERROR, "tenant lookup failed").await;
            return;
        }
    };

    let llm = (state.create_llm_client)(profile.system_prompt());
    let dispatcher = ToolDispatcher::new(
        tenant_id.clone(),
        call_id.clone(),
        profile.clone(),
        state.orders.clone(),
    );
    let (frame_sender, mut frame_receiver) = mpsc::unbounded_channel();
    let cancel_token = state.token.child_token();
    let options = SessionOptions {
        stream_timeout: state.config.stream_timeout(),
        greeting_prompt: state.config.greeting_prompt.clone(),
    };
    let session = ActiveSession::new(
        tenant_id,
        call_id,
        profile,
        llm,
        dispatcher,
        options,
        frame_sender,
        cancel_token.clone(),
    );

    let guard = SessionGuard::new(state.clone(), session.clone());
    info!(
        tenant_id = session.tenant_id,
        call_id = session.call_id,
        active_sessions = guard.active_sessions,
        "voice session opened"
    );
    session.start_greeting();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let session_ref = session.clone();
    let recv_loop = async move {
        while let Some(Ok(message)) = ws_receiver.next().await {
            match message {
                Message::Text(text) => match serde_json::from_str::<InboundFrame>(&text) {
                    Ok(frame) => session_ref.handle_frame(frame),
                    Err(e) => {
                        warn!(call_id = session_ref.call_id, "unparseable frame: {}", e);
                        return Some(CloseFrame {
                            code: CLOSE_UNSUPPORTED_DATA,
                            reason: "json frames only".into(),
                        });
                    }
                },
                Message::Close(_) => {
                    debug!(call_id = session_ref.call_id, "socket closed by transport");
                    return None;
                }
                _ => {}
            }
        }
        None
    };

    let sender_ref = &mut ws_sender;
    let send_loop = async move {
        while let Some(frame) = frame_receiver.recv().await {
            let payload = match serde_json::to_string(&frame) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("failed to serialize outbound frame: {}", e);
                    continue;
                }
            };
            if sender_ref.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    };

    let close_frame = select! {
        close = recv_loop => close,
        _ = send_loop => None,
        _ = cancel_token.cancelled() => None,
    };

    session.close();
    if let Some(frame) = close_frame {
        ws_sender.send(Message::Close(Some(frame))).await.ok();
    }
    ws_sender.flush().await.ok();
    ws_sender.close().await.ok();
    drop(guard);
    info!(
        tenant_id = session.tenant_id,
        call_id = session.call_id,
        "voice session closed"
    );
}

pub(crate) async fn list_sessions(State(state): State<AppState>) -> Response {
    let sessions = state
        .active_sessions
        .lock()
        .unwrap()
        .values()
        .map(|session| {
            json!({
                "callId": session.call_id,
                "tenantId": session.tenant_id,
                "generating": session.is_generating(),
                "turns": session.history_snapshot().len(),
            })
        })
        .collect::<Vec<_>>();
    Json(json!({ "active_sessions": sessions })).into_response()
}

pub(crate) async fn kill_session(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let session = state.active_sessions.lock().unwrap().get(&id).cloned();
    if let Some(session) = session {
        session.close();
        Json(json!({ "status": "killed", "id": id })).into_response()
    } else {
        Json(json!({ "status": "not_found", "id": id })).into_response()
    }
}
