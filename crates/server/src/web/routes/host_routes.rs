use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use std::sync::Arc;

use crate::hosts::{Host, HostInput};
use crate::web::{error::AppError, AppState};

pub fn host_routes() -> Router<Arc<AppState>> {
    Router::<Arc<AppState>>::new()
        .route("/", get(list_hosts).post(register_host))
        .route("/{id}", put(update_host).delete(delete_host))
}

async fn list_hosts(State(app_state): State<Arc<AppState>>) -> Json<Vec<Host>> {
    Json(app_state.engine.hosts.list())
}

async fn register_host(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<HostInput>,
) -> Result<(StatusCode, Json<Host>), AppError> {
    let host = app_state.engine.register_host(payload).await?;
    Ok((StatusCode::CREATED, Json(host)))
}

async fn update_host(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<HostInput>,
) -> Result<Json<Host>, AppError> {
    Ok(Json(app_state.engine.update_host(&id, payload).await?))
}

async fn delete_host(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    app_state.engine.delete_host(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
