use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug)]
struct AgentConnection {
    conn_id: u64,
    connected_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub host_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Live agent WebSocket connections, at most one per host.
#[derive(Debug, Default)]
pub struct ConnectedAgents {
    agents: DashMap<String, AgentConnection>,
    next_id: AtomicU64,
}

impl ConnectedAgents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection for `host_id`, cancelling any connection it
    /// replaces. The returned token fires when this connection is replaced
    /// or the host is disconnected.
    pub fn register(&self, host_id: &str) -> (u64, CancellationToken) {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let now = Utc::now();
        let previous = self.agents.insert(
            host_id.to_string(),
            AgentConnection {
                conn_id,
                connected_at: now,
                last_seen: now,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            info!(host_id, replaced = previous.conn_id, "Agent reconnected; closing previous connection.");
            previous.cancel.cancel();
        }
        (conn_id, cancel)
    }

    pub fn touch(&self, host_id: &str, conn_id: u64) {
        if let Some(mut conn) = self.agents.get_mut(host_id) {
            if conn.conn_id == conn_id {
                conn.last_seen = Utc::now();
            }
        }
    }

    /// Removes the connection if it is still the current one for the host.
    pub fn deregister(&self, host_id: &str, conn_id: u64) -> bool {
        self.agents
            .remove_if(host_id, |_, conn| conn.conn_id == conn_id)
            .is_some()
    }

    /// Closes the host's connection, if any.
    pub fn disconnect(&self, host_id: &str) {
        if let Some((_, conn)) = self.agents.remove(host_id) {
            conn.cancel.cancel();
        }
    }

    pub fn is_connected(&self, host_id: &str) -> bool {
        self.agents.contains_key(host_id)
    }

    pub fn list(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self
            .agents
            .iter()
            .map(|entry| AgentInfo {
                host_id: entry.key().clone(),
                connected_at: entry.connected_at,
                last_seen: entry.last_seen,
            })
            .collect();
        agents.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        agents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_replaces_and_cancels_previous() {
        let agents = ConnectedAgents::new();
        let (first, first_cancel) = agents.register("h1");
        let (second, second_cancel) = agents.register("h1");
        assert!(first_cancel.is_cancelled());
        assert!(!second_cancel.is_cancelled());

        assert!(!agents.deregister("h1", first));
        assert!(agents.is_connected("h1"));
        assert!(agents.deregister("h1", second));
        assert!(!agents.is_connected("h1"));
    }

    #[test]
    fn disconnect_cancels() {
        let agents = ConnectedAgents::new();
        let (_, cancel) = agents.register("h1");
        agents.disconnect("h1");
        assert!(cancel.is_cancelled());
        assert!(agents.list().is_empty());
    }
}
