//! The engine root: every long-lived service of the control plane, wired
//! together once at boot and shared behind an `Arc`.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::coordinator::history::{HistorySink, NullHistory};
use crate::coordinator::{Coordinator, CoordinatorConfig};
use crate::db::duckdb_service::history_service::DuckDbHistorySink;
use crate::db::duckdb_service::{self, DuckDBService};
use crate::health::{HealthPoller, HealthStore, PollerConfig};
use crate::hosts::{Host, HostError, HostInput, HostRegistry};
use crate::logs::{LogConfig, LogSessionManager};
use crate::notifications::{LogDispatcher, NotificationDispatcher, WebhookDispatcher};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerError};
use crate::server::agent_state::ConnectedAgents;
use crate::server::config::ServerConfig;
use crate::stream::StreamHub;
use crate::tasks::{TaskEngine, TaskEngineConfig};
use crate::transport::Connector;
use crate::vault::{Vault, VaultError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("vault unavailable: {0}")]
    Vault(#[from] VaultError),
    #[error("failed to load hosts: {0}")]
    Hosts(#[from] HostError),
    #[error("failed to start scheduler: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("storage error: {0}")]
    Storage(#[from] duckdb_service::Error),
}

pub struct Engine {
    pub vault: Arc<Vault>,
    pub hosts: Arc<HostRegistry>,
    pub pool: Arc<ConnectionPool>,
    pub hub: Arc<StreamHub>,
    pub health: Arc<HealthStore>,
    pub poller: Arc<HealthPoller>,
    pub agents: Arc<ConnectedAgents>,
    pub coordinator: Arc<Coordinator>,
    pub logs: Arc<LogSessionManager>,
    pub scheduler: Arc<Scheduler>,
    shutdown_tx: watch::Sender<()>,
    // Never read from, so clones of it observe the shutdown even when they
    // are taken after it was sent.
    shutdown_rx: watch::Receiver<()>,
}

impl Engine {
    /// Opens the vault, loads the host table and wires every service.
    /// Nothing runs in the background until [`start`](Self::start).
    pub async fn build(
        config: &ServerConfig,
        connector: Arc<dyn Connector>,
        db: Option<DuckDBService>,
    ) -> Result<Arc<Self>, EngineError> {
        let vault = Arc::new(Vault::load_or_create(&config.vault_key_path)?);
        let db_pool = db.as_ref().map(DuckDBService::pool);

        let hosts = Arc::new(HostRegistry::new(vault.clone(), db_pool.clone()));
        let loaded = hosts.load().await?;
        info!(hosts = loaded, "Host registry loaded.");

        let pool = Arc::new(ConnectionPool::new(
            connector.clone(),
            vault.clone(),
            PoolConfig {
                max_age: Duration::from_secs(config.pool_max_age_secs),
                max_idle: Duration::from_secs(config.pool_max_idle_secs),
                reap_interval: Duration::from_secs(config.pool_reap_interval_secs),
                dial_timeout: Duration::from_secs(config.dial_timeout_secs),
            },
        ));
        let hub = Arc::new(StreamHub::new());
        let health = Arc::new(HealthStore::new(Duration::from_secs(config.agent_fresh_secs)));
        let poller = Arc::new(HealthPoller::new(
            hosts.clone(),
            connector.clone(),
            vault.clone(),
            health.clone(),
            PollerConfig {
                warmup: Duration::from_secs(config.health_warmup_secs),
                interval: Duration::from_secs(config.health_interval_secs),
                host_delay: Duration::from_secs(config.health_host_delay_secs),
                probe_timeout: Duration::from_secs(config.health_probe_timeout_secs),
                dial_timeout: Duration::from_secs(config.health_probe_timeout_secs),
            },
        ));

        let history: Arc<dyn HistorySink> = match &db_pool {
            Some(pool) => Arc::new(DuckDbHistorySink::new(pool.clone())),
            None => Arc::new(NullHistory),
        };
        let task_engine = TaskEngine::new(TaskEngineConfig {
            retry_delay: Duration::from_millis(config.task_retry_delay_ms),
            ..Default::default()
        });
        let coordinator = Arc::new(Coordinator::new(
            hosts.clone(),
            pool.clone(),
            task_engine,
            hub.clone(),
            history,
            CoordinatorConfig {
                output_cap: config.history_output_cap_bytes,
                ..CoordinatorConfig::default()
            },
        ));

        let logs = Arc::new(LogSessionManager::new(
            hosts.clone(),
            connector,
            vault.clone(),
            hub.clone(),
            LogConfig {
                default_lines: config.log_default_lines,
                dial_timeout: Duration::from_secs(config.dial_timeout_secs),
            },
        ));

        let notifier: Arc<dyn NotificationDispatcher> = match &config.notify_webhook_url {
            Some(url) if !url.is_empty() => Arc::new(WebhookDispatcher::new(
                url.clone(),
                config.notify_webhook_template.clone(),
            )),
            _ => Arc::new(LogDispatcher),
        };
        let scheduler = Arc::new(Scheduler::new(
            coordinator.clone(),
            hosts.clone(),
            notifier,
            db_pool,
            SchedulerConfig {
                default_timeout_mins: u32::try_from(config.job_default_timeout_mins).unwrap_or(u32::MAX),
                scripts_dir: config.scripts_dir.clone().into(),
                ..Default::default()
            },
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        Ok(Arc::new(Self {
            vault,
            hosts,
            pool,
            hub,
            health,
            poller,
            agents: Arc::new(ConnectedAgents::new()),
            coordinator,
            logs,
            scheduler,
            shutdown_tx,
            shutdown_rx,
        }))
    }

    /// Spawns the pool reaper and the health poller, and arms the scheduler.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        tokio::spawn(self.pool.clone().run_reaper(self.shutdown_signal()));
        tokio::spawn(self.poller.clone().run(self.shutdown_signal()));
        self.scheduler.start(self.shutdown_signal()).await?;
        info!("Engine started.");
        Ok(())
    }

    /// Stops every background loop, cancels log sessions and closes pooled
    /// connections. In-flight executions run to completion on their own.
    pub async fn shutdown(&self) {
        info!("Engine shutting down.");
        if self.shutdown_tx.send(()).is_err() {
            warn!("Shutdown signal had no listeners.");
        }
        self.logs.cancel_all();
        self.pool.close_all().await;
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<()> {
        self.shutdown_rx.clone()
    }

    /// Registers a host and probes it once in the background.
    pub async fn register_host(self: &Arc<Self>, input: HostInput) -> Result<Host, HostError> {
        let host = self.hosts.register(input).await?;
        let poller = self.poller.clone();
        let probed = host.clone();
        tokio::spawn(async move {
            poller.probe_now(&probed).await;
        });
        Ok(host)
    }

    /// Edits a host. Its pooled connection is dropped so the next acquire
    /// uses the new address and credentials.
    pub async fn update_host(&self, id: &str, input: HostInput) -> Result<Host, HostError> {
        let host = self.hosts.update(id, input).await?;
        self.pool.remove(id).await;
        Ok(host)
    }

    /// Deletes a host and everything hanging off it: pooled connection,
    /// health record, log sessions and agent connection.
    pub async fn delete_host(&self, id: &str) -> Result<Host, HostError> {
        let host = self.hosts.delete(id).await?;
        self.pool.remove(id).await;
        self.health.remove(id);
        let cancelled = self.logs.cancel_by_host(id);
        self.agents.disconnect(id);
        info!(host_id = %id, log_sessions = cancelled, "Host resources released.");
        Ok(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{HealthRecord, HealthSource};
    use crate::logs::{LogKind, LogRequest};
    use crate::transport::LocalConnector;

    fn config(dir: &tempfile::TempDir) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.vault_key_path = dir.path().join("vault.key");
        config
    }

    #[tokio::test]
    async fn build_creates_vault_key() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        Engine::build(&config, Arc::new(LocalConnector), None).await.unwrap();
        assert!(config.vault_key_path.exists());
    }

    #[tokio::test]
    async fn unreadable_vault_refuses_to_build() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        // A directory where the key file should be cannot be read as a key.
        config.vault_key_path = dir.path().to_path_buf();
        let result = Engine::build(&config, Arc::new(LocalConnector), None).await;
        assert!(matches!(result, Err(EngineError::Vault(_))));
    }

    #[tokio::test]
    async fn delete_host_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::build(&config(&dir), Arc::new(LocalConnector), None)
            .await
            .unwrap();
        let host = engine
            .hosts
            .register(HostInput::new("127.0.0.1", "ops").with_id("h1"))
            .await
            .unwrap();
        engine
            .health
            .record_probe(HealthRecord::offline(&host.id, HealthSource::Probe, None));
        let (_, _token) = engine.agents.register(&host.id);
        let log_file = dir.path().join("app.log");
        std::fs::write(&log_file, "x\n").unwrap();
        let session = engine
            .logs
            .start(LogRequest {
                host_id: host.id.clone(),
                kind: Some(LogKind::Tail),
                target: Some(log_file.to_string_lossy().to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        engine.delete_host(&host.id).await.unwrap();
        assert!(!engine.hosts.contains("h1"));
        assert!(engine.health.get("h1").is_none());
        assert!(engine.logs.get(&session.id).is_none());
        assert!(!engine.agents.is_connected("h1"));
    }

    #[tokio::test]
    async fn shutdown_signal_seen_by_late_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::build(&config(&dir), Arc::new(LocalConnector), None)
            .await
            .unwrap();
        engine.shutdown().await;
        let mut late = engine.shutdown_signal();
        tokio::time::timeout(Duration::from_secs(1), late.changed())
            .await
            .unwrap()
            .unwrap();
    }
}
