use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    routing::{delete, get},
    Json, Router,
};
use std::sync::Arc;

use crate::logs::{LogRequest, LogSession};
use crate::web::sse::{event_stream, KEEPALIVE_INTERVAL};
use crate::web::{error::AppError, AppState};

pub fn log_routes() -> Router<Arc<AppState>> {
    Router::<Arc<AppState>>::new()
        .route("/", get(list_sessions).post(start_session))
        .route("/{id}", delete(cancel_session))
        .route("/{id}/stream", get(stream_session))
        .route("/host/{host_id}", delete(cancel_host_sessions))
}

async fn list_sessions(State(app_state): State<Arc<AppState>>) -> Json<Vec<LogSession>> {
    Json(app_state.engine.logs.list())
}

async fn start_session(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<LogRequest>,
) -> Result<(StatusCode, Json<LogSession>), AppError> {
    let session = app_state.engine.logs.start(payload).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn stream_session(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let engine = &app_state.engine;
    if engine.logs.get(&id).is_none() && !engine.hub.is_completed(&id) {
        return Err(AppError::NotFound(format!("log session {id} not found")));
    }
    Ok(event_stream(engine.hub.subscribe(&id), KEEPALIVE_INTERVAL))
}

async fn cancel_session(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    app_state.engine.logs.cancel(&id)?;
    Ok(Json(serde_json::json!({ "cancelled": id })))
}

async fn cancel_host_sessions(
    State(app_state): State<Arc<AppState>>,
    Path(host_id): Path<String>,
) -> Json<serde_json::Value> {
    let cancelled = app_state.engine.logs.cancel_by_host(&host_id);
    Json(serde_json::json!({ "host_id": host_id, "cancelled": cancelled }))
}
