use axum::{
    extract::State,
    http::Method,
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::Engine;
use crate::pool::PoolStats;
use crate::server::agent_state::AgentInfo;
use crate::web::routes::*;

pub mod error;
pub mod routes;
pub mod sse;

pub use error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

async fn list_agents(State(app_state): State<Arc<AppState>>) -> Json<Vec<AgentInfo>> {
    Json(app_state.engine.agents.list())
}

async fn pool_stats(State(app_state): State<Arc<AppState>>) -> Json<PoolStats> {
    Json(app_state.engine.pool.stats().await)
}

pub fn create_axum_router(engine: Arc<Engine>) -> Router {
    let app_state = Arc::new(AppState { engine });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .nest("/api/executions", execution_routes::execution_routes())
        .nest("/api/health", health_routes::health_routes())
        .nest("/api/logs", log_routes::log_routes())
        .nest("/api/hosts", host_routes::host_routes())
        .nest("/api/jobs", job_routes::job_routes())
        .route("/api/agents", get(list_agents))
        .route("/api/pool", get(pool_stats))
        .route("/ws/agent", get(crate::server::ws_agent_handler::agent_ws_handler))
        .with_state(app_state)
        .layer(cors)
}
