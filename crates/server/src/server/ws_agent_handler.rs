use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use fleetwarden_common::HostMetrics;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::web::{AppError, AppState};

#[derive(Deserialize, Debug)]
pub struct AgentQuery {
    id: String,
}

/// `GET /ws/agent?id=<host-id>`. Unknown hosts are refused before upgrade.
pub async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<AgentQuery>,
) -> Response {
    if !app_state.engine.hosts.contains(&query.id) {
        return AppError::NotFound(format!("host {} not found", query.id)).into_response();
    }
    let engine = app_state.engine.clone();
    ws.on_upgrade(move |socket| handle_agent_socket(socket, engine, query.id))
}

async fn handle_agent_socket(mut socket: WebSocket, engine: Arc<Engine>, host_id: String) {
    let (conn_id, replaced) = engine.agents.register(&host_id);
    let mut shutdown = engine.shutdown_signal();
    info!(host_id = %host_id, conn_id, "Agent connected.");

    loop {
        tokio::select! {
            _ = replaced.cancelled() => {
                debug!(host_id = %host_id, conn_id, "Agent connection superseded.");
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            _ = shutdown.changed() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => match HostMetrics::from_frame(text.as_str()) {
                    Ok(metrics) => {
                        engine.health.apply_agent_push(&host_id, metrics);
                        engine.agents.touch(&host_id, conn_id);
                    }
                    Err(e) => warn!(host_id = %host_id, error = %e, "Malformed metrics frame ignored."),
                },
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(host_id = %host_id, error = %e, "Agent socket read failed.");
                    break;
                }
            }
        }
    }

    if engine.agents.deregister(&host_id, conn_id) {
        engine.health.mark_agent_offline(&host_id);
        info!(host_id = %host_id, conn_id, "Agent disconnected.");
    }
}
