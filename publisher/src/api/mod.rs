use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use shared_types::{PublishRequest, RollbackRequest};
use tracing::error;

use crate::{error::PublishError, AppState};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/bots", get(list_bots))
        .route("/bots/{bot_id}/publish", post(publish_bot))
        .route("/bots/{bot_id}/status", get(bot_status))
        .route("/bots/{bot_id}/stop", post(stop_bot))
        .route("/bots/{bot_id}/rollback", post(rollback_bot))
        .route("/bots/{bot_id}/history", get(bot_history))
        .route("/bots/{bot_id}/runtime", delete(remove_runtime))
}

fn http_status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn error_response(status: StatusCode, err: &PublishError) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /bots: every bot the supervisor is tracking
pub async fn list_bots(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let bots: Vec<serde_json::Value> = state
        .orchestrator
        .supervisor()
        .active_bots()
        .await
        .into_iter()
        .map(|b| {
            serde_json::json!({
                "botId": b.bot_id,
                "status": b.state.code(),
                "state": b.state.to_string(),
                "port": b.port,
                "message": b.message,
            })
        })
        .collect();
    Json(bots)
}

/// POST /bots/:bot_id/publish
pub async fn publish_bot(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
    Json(req): Json<PublishRequest>,
) -> impl IntoResponse {
    let (config, project, metadata) = req.into_parts(&bot_id);
    let response = state
        .orchestrator
        .publish(config, project, metadata)
        .await;
    (http_status(response.status), Json(response))
}

/// GET /bots/:bot_id/status
pub async fn bot_status(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
) -> impl IntoResponse {
    let response = state.orchestrator.get_status(&bot_id).await;
    (http_status(response.status), Json(response))
}

/// POST /bots/:bot_id/stop
pub async fn stop_bot(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.stop_bot(&bot_id).await {
        Ok(()) => Json(serde_json::json!({ "status": "stopped" })).into_response(),
        Err(e) => {
            error!(bot_id = %bot_id, "stop bot: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e)
        }
    }
}

/// POST /bots/:bot_id/rollback
pub async fn rollback_bot(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
    Json(req): Json<RollbackRequest>,
) -> impl IntoResponse {
    let response = state.orchestrator.rollback(&bot_id, &req.version).await;
    (http_status(response.status), Json(response))
}

/// GET /bots/:bot_id/history
pub async fn bot_history(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.history(&bot_id).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => {
            error!(bot_id = %bot_id, "bot history: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e)
        }
    }
}

/// DELETE /bots/:bot_id/runtime
pub async fn remove_runtime(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.remove_runtime_data(&bot_id).await {
        Ok(response) => Json(response).into_response(),
        Err(e @ PublishError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, &e),
        Err(e) => {
            error!(bot_id = %bot_id, "remove runtime data: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e)
        }
    }
}
