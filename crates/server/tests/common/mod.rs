#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use fleetwarden_server::db::duckdb_service::DuckDBService;
use fleetwarden_server::engine::Engine;
use fleetwarden_server::hosts::HostInput;
use fleetwarden_server::server::config::ServerConfig;
use fleetwarden_server::stream::{StreamEvent, Subscription};
use fleetwarden_server::transport::local::LocalTransport;
use fleetwarden_server::transport::{
    CommandOutput, ConnectTarget, Connector, LocalConnector, OutputLine, Transport, TransportError,
};

pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub dir: tempfile::TempDir,
}

pub fn test_config(dir: &tempfile::TempDir) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.data_dir = dir.path().to_string_lossy().to_string();
    config.vault_key_path = dir.path().join("vault.key");
    config.database_path = dir.path().join("fleetwarden.duckdb");
    config.task_retry_delay_ms = 10;
    config
}

/// An engine whose hosts are all the local machine.
pub async fn engine_with_hosts(ids: &[&str], db: Option<DuckDBService>) -> TestEngine {
    engine_with_connector(ids, Arc::new(LocalConnector), db).await
}

pub async fn engine_with_connector(
    ids: &[&str],
    connector: Arc<dyn Connector>,
    db: Option<DuckDBService>,
) -> TestEngine {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::build(&test_config(&dir), connector, db).await.unwrap();
    for id in ids {
        engine
            .hosts
            .register(HostInput::new("127.0.0.1", "ops").with_id(*id).with_name(format!("{id}-name")))
            .await
            .unwrap();
    }
    TestEngine { engine, dir }
}

pub async fn drain(mut sub: Subscription) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = sub.recv().await {
        events.push(event);
    }
    events
}

/// Local shells where `hostname` prints the host id, so every host in a
/// fan-out answers differently.
pub struct NamedHostConnector;

#[async_trait]
impl Connector for NamedHostConnector {
    async fn connect(
        &self,
        target: &ConnectTarget,
        _dial_timeout: Duration,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(NamedHost {
            inner: LocalTransport::new(),
            prelude: format!("hostname() {{ echo {}; }}; ", target.host_id),
        }))
    }
}

struct NamedHost {
    inner: LocalTransport,
    prelude: String,
}

#[async_trait]
impl Transport for NamedHost {
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput, TransportError> {
        self.inner.exec(&format!("{}{command}", self.prelude), stdin).await
    }

    async fn exec_streaming(
        &self,
        command: &str,
        lines: mpsc::Sender<OutputLine>,
    ) -> Result<i32, TransportError> {
        self.inner
            .exec_streaming(&format!("{}{command}", self.prelude), lines)
            .await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
