use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use std::sync::Arc;

use crate::health::{HealthRecord, HealthSummary};
use crate::web::{error::AppError, AppState};

pub fn health_routes() -> Router<Arc<AppState>> {
    Router::<Arc<AppState>>::new()
        .route("/", get(list_health))
        .route("/summary", get(health_summary))
        .route("/{host_id}", get(host_health))
}

async fn list_health(State(app_state): State<Arc<AppState>>) -> Json<Vec<HealthRecord>> {
    Json(app_state.engine.health.list())
}

async fn health_summary(State(app_state): State<Arc<AppState>>) -> Json<HealthSummary> {
    let total = app_state.engine.hosts.list().len();
    Json(app_state.engine.health.summary(total))
}

async fn host_health(
    State(app_state): State<Arc<AppState>>,
    Path(host_id): Path<String>,
) -> Result<Json<HealthRecord>, AppError> {
    app_state
        .engine
        .health
        .get(&host_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no health record for host {host_id}")))
}
