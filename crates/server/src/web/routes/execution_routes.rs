use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tracing::info;

use crate::coordinator::{Execution, ExecutionAccepted, SubmitExecutionRequest};
use crate::web::sse::{event_stream, KEEPALIVE_INTERVAL};
use crate::web::{error::AppError, AppState};

pub fn execution_routes() -> Router<Arc<AppState>> {
    Router::<Arc<AppState>>::new()
        .route("/", post(submit_execution))
        .route("/{id}", get(get_execution))
        .route("/{id}/stream", get(stream_execution))
}

async fn submit_execution(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<SubmitExecutionRequest>,
) -> Result<(StatusCode, Json<ExecutionAccepted>), AppError> {
    if payload.host_ids.is_empty() {
        return Err(AppError::InvalidInput("host_ids must not be empty".to_string()));
    }
    let hosts = payload.host_ids.len();
    let id = app_state.engine.coordinator.submit(payload)?;
    info!(exec_id = %id, hosts, "Execution submitted.");
    Ok((StatusCode::ACCEPTED, Json(ExecutionAccepted { id })))
}

async fn get_execution(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Execution>, AppError> {
    app_state
        .engine
        .coordinator
        .get(&id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("execution {id} not found")))
}

async fn stream_execution(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let subscription = app_state
        .engine
        .coordinator
        .subscribe(&id)
        .ok_or_else(|| AppError::NotFound(format!("execution {id} not found")))?;
    Ok(event_stream(subscription, KEEPALIVE_INTERVAL))
}
