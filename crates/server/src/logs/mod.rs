//! Long-lived remote log followers bridged into the stream hub.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::hosts::HostRegistry;
use crate::stream::{StreamEvent, StreamHub, Subscription};
use crate::transport::{shell_quote, ConnectTarget, Connector, OutputLine, TransportError};
use crate::vault::Vault;

#[derive(Error, Debug)]
pub enum LogSessionError {
    #[error("invalid log request: {0}")]
    InvalidRequest(String),
    #[error("host not found: {0}")]
    HostNotFound(String),
    #[error("log session not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogKind {
    JournalSystem,
    JournalUser,
    Tail,
    Docker,
    Compose,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogRequest {
    pub host_id: String,
    pub kind: Option<LogKind>,
    /// Unit, file path, container name or compose file, depending on kind.
    #[serde(default)]
    pub target: Option<String>,
    /// Compose service.
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub lines: Option<u32>,
    #[serde(default)]
    pub sudo: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogSession {
    pub id: String,
    pub host_id: String,
    pub kind: LogKind,
    pub target: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub default_lines: u32,
    pub dial_timeout: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_lines: 100,
            dial_timeout: Duration::from_secs(5 * 60),
        }
    }
}

struct SessionEntry {
    session: LogSession,
    cancel: CancellationToken,
}

/// Remote command for a log request.
pub fn build_command(request: &LogRequest, default_lines: u32) -> Result<String, LogSessionError> {
    let kind = request
        .kind
        .ok_or_else(|| LogSessionError::InvalidRequest("missing kind".into()))?;
    let n = request.lines.unwrap_or(default_lines);
    let target = request.target.as_deref().filter(|t| !t.trim().is_empty());
    let require = |what: &str| {
        target.ok_or_else(|| LogSessionError::InvalidRequest(format!("{what} is required")))
    };

    let command = match kind {
        LogKind::JournalSystem | LogKind::JournalUser => {
            let scope = if kind == LogKind::JournalUser { " --user" } else { "" };
            let unit = target
                .map(|u| format!(" -u {}", shell_quote(u)))
                .unwrap_or_default();
            format!("journalctl{scope}{unit} -n {n} -f --no-pager")
        }
        LogKind::Tail => {
            let tail = format!("tail -n {n} -F {}", shell_quote(require("path")?));
            if request.sudo {
                format!("sudo -n {tail}")
            } else {
                tail
            }
        }
        LogKind::Docker => format!(
            "docker logs -f --tail {n} {} 2>&1",
            shell_quote(require("container")?)
        ),
        LogKind::Compose => {
            let service = request
                .service
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(|s| format!(" {}", shell_quote(s)))
                .unwrap_or_default();
            format!(
                "docker compose -f {} logs -f --tail {n}{service} 2>&1",
                shell_quote(require("compose file")?)
            )
        }
    };
    Ok(command)
}

/// Tracks running log sessions. Each session owns one dedicated transport.
pub struct LogSessionManager {
    hosts: Arc<HostRegistry>,
    connector: Arc<dyn Connector>,
    vault: Arc<Vault>,
    hub: Arc<StreamHub>,
    sessions: Arc<DashMap<String, SessionEntry>>,
    config: LogConfig,
}

impl LogSessionManager {
    pub fn new(
        hosts: Arc<HostRegistry>,
        connector: Arc<dyn Connector>,
        vault: Arc<Vault>,
        hub: Arc<StreamHub>,
        config: LogConfig,
    ) -> Self {
        Self {
            hosts,
            connector,
            vault,
            hub,
            sessions: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Starts following. Lines produced before the caller subscribes to the
    /// session id are not replayed; use
    /// [`start_with_subscription`](Self::start_with_subscription) to see them.
    pub async fn start(&self, request: LogRequest) -> Result<LogSession, LogSessionError> {
        self.spawn_session(request, false).await.map(|(session, _)| session)
    }

    /// Starts following with a subscription attached before the first line.
    pub async fn start_with_subscription(
        &self,
        request: LogRequest,
    ) -> Result<(LogSession, Subscription), LogSessionError> {
        let (session, sub) = self.spawn_session(request, true).await?;
        match sub {
            Some(sub) => Ok((session, sub)),
            None => Err(LogSessionError::NotFound(session.id)),
        }
    }

    async fn spawn_session(
        &self,
        request: LogRequest,
        subscribe: bool,
    ) -> Result<(LogSession, Option<Subscription>), LogSessionError> {
        let command = build_command(&request, self.config.default_lines)?;
        let host = self
            .hosts
            .get(&request.host_id)
            .ok_or_else(|| LogSessionError::HostNotFound(request.host_id.clone()))?;
        let target = ConnectTarget::for_host(&host, &self.vault);
        let transport = self.connector.connect(&target, self.config.dial_timeout).await?;

        let session = LogSession {
            id: Uuid::new_v4().to_string(),
            host_id: host.id.clone(),
            kind: request.kind.unwrap_or(LogKind::JournalSystem),
            target: request.target.clone(),
            started_at: Utc::now(),
        };
        let subscription = subscribe.then(|| self.hub.subscribe(&session.id));
        let cancel = CancellationToken::new();
        self.sessions.insert(
            session.id.clone(),
            SessionEntry {
                session: session.clone(),
                cancel: cancel.clone(),
            },
        );
        info!(session_id = %session.id, host_id = %host.id, command = %command, "Log session started.");

        let hub = self.hub.clone();
        let sessions = self.sessions.clone();
        let id = session.id.clone();
        let host_name = host.name.clone();
        let host_id = host.id.clone();
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel::<OutputLine>(256);
            let follow = async {
                let forward = async {
                    while let Some(line) = rx.recv().await {
                        hub.broadcast(&id, StreamEvent::output(&host_id, &host_name, line.line));
                    }
                };
                let (result, _) = tokio::join!(transport.exec_streaming(&command, tx), forward);
                result
            };

            let reason = tokio::select! {
                _ = cancel.cancelled() => "cancelled".to_string(),
                result = follow => match result {
                    Ok(code) => format!("eof (exit status {code})"),
                    Err(e) => {
                        warn!(session_id = %id, error = %e, "Log session transport failed.");
                        hub.broadcast(&id, StreamEvent::error(&host_id, &host_name, e.to_string()));
                        format!("error: {e}")
                    }
                },
            };
            transport.close().await;
            sessions.remove(&id);
            hub.broadcast(&id, StreamEvent::complete(reason.clone()));
            debug!(session_id = %id, reason = %reason, "Log session ended.");
        });

        Ok((session, subscription))
    }

    pub fn cancel(&self, id: &str) -> Result<(), LogSessionError> {
        let (_, entry) = self
            .sessions
            .remove(id)
            .ok_or_else(|| LogSessionError::NotFound(id.to_string()))?;
        entry.cancel.cancel();
        info!(session_id = %id, "Log session cancelled.");
        Ok(())
    }

    /// Cancels every session on the host. Returns how many were running.
    pub fn cancel_by_host(&self, host_id: &str) -> usize {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.session.host_id == host_id)
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter().filter(|id| self.cancel(id).is_ok()).count()
    }

    pub fn cancel_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.cancel(&id);
        }
    }

    pub fn get(&self, id: &str) -> Option<LogSession> {
        self.sessions.get(id).map(|entry| entry.session.clone())
    }

    pub fn list(&self) -> Vec<LogSession> {
        let mut sessions: Vec<LogSession> = self.sessions.iter().map(|e| e.session.clone()).collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }
}
