//! Pod-addressed legacy handlers

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    Json,
};
use futures::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::message::{AgentResult, ExecMessage};
use crate::AppState;

/// Run a command in a pod and return its buffered stdout
pub async fn common_exec(
    State(state): State<AppState>,
    Json(msg): Json<ExecMessage>,
) -> Json<AgentResult> {
    let uid = Uuid::new_v4().to_string();
    info!("common exec in pod {}, cmd={:?}, uid={}", msg.pod_name, msg.cmd, uid);
    match state.legacy.run_common(msg, &uid).await {
        Ok(stdout) => Json(AgentResult::success(stdout)),
        Err(e) => {
            warn!("common exec failed, err={}, uid={}", e, uid);
            Json(AgentResult::error(e))
        }
    }
}

/// Interactive session speaking the `{messageType, data}` envelope
pub async fn ssh(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let uid = Uuid::new_v4().to_string();
    let service = state.legacy.clone();
    info!("ssh session requested, uid={}", uid);
    ws.max_message_size(state.config.legacy_max_message_size)
        .on_failed_upgrade(|e| warn!("ssh websocket upgrade failed, err={}", e))
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            service.serve_ssh(sink, stream, uid).await;
        })
}
