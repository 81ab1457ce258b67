use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use crate::scheduler::{JobInput, ScheduledJob};
use crate::web::{error::AppError, AppState};

pub fn job_routes() -> Router<Arc<AppState>> {
    Router::<Arc<AppState>>::new()
        .route("/", get(list_jobs).post(create_job))
        .route("/{id}", get(get_job).put(update_job).delete(delete_job))
        .route("/{id}/run", post(run_job))
}

async fn list_jobs(State(app_state): State<Arc<AppState>>) -> Json<Vec<ScheduledJob>> {
    Json(app_state.engine.scheduler.list().await)
}

async fn get_job(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ScheduledJob>, AppError> {
    app_state
        .engine
        .scheduler
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job {id} not found")))
}

async fn create_job(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<JobInput>,
) -> Result<(StatusCode, Json<ScheduledJob>), AppError> {
    let job = app_state.engine.scheduler.create(payload).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn update_job(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<JobInput>,
) -> Result<Json<ScheduledJob>, AppError> {
    Ok(Json(app_state.engine.scheduler.update(&id, payload).await?))
}

async fn delete_job(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    app_state.engine.scheduler.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn run_job(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    app_state.engine.scheduler.run_now(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "id": id, "status": "started" }))))
}
