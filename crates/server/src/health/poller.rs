use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use super::probe::collect_metrics;
use super::{HealthRecord, HealthSource, HealthStore};
use crate::hosts::{Host, HostRegistry};
use crate::transport::{ConnectTarget, Connector};
use crate::vault::Vault;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub warmup: Duration,
    pub interval: Duration,
    /// Pause between consecutive hosts in one sweep.
    pub host_delay: Duration,
    /// Bound on dial plus probe for one host.
    pub probe_timeout: Duration,
    pub dial_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(30),
            interval: Duration::from_secs(5 * 60),
            host_delay: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(10),
        }
    }
}

/// Walks the host list on a timer, probing each host over its own
/// short-lived connection.
pub struct HealthPoller {
    hosts: Arc<HostRegistry>,
    connector: Arc<dyn Connector>,
    vault: Arc<Vault>,
    store: Arc<HealthStore>,
    config: PollerConfig,
}

impl HealthPoller {
    pub fn new(
        hosts: Arc<HostRegistry>,
        connector: Arc<dyn Connector>,
        vault: Arc<Vault>,
        store: Arc<HealthStore>,
        config: PollerConfig,
    ) -> Self {
        Self {
            hosts,
            connector,
            vault,
            store,
            config,
        }
    }

    /// Probes one host now. Hosts whose agent pushed recently are not
    /// probed; their current record is returned instead.
    #[instrument(skip_all, fields(host_id = %host.id))]
    pub async fn probe_now(&self, host: &Host) -> HealthRecord {
        if self.store.agent_is_fresh(&host.id) {
            if let Some(record) = self.store.get(&host.id) {
                return record;
            }
        }

        let started = Instant::now();
        let target = ConnectTarget::for_host(host, &self.vault);
        let probe = async {
            let transport = self.connector.connect(&target, self.config.dial_timeout).await?;
            let metrics = collect_metrics(transport.as_ref()).await;
            transport.close().await;
            metrics
        };

        let record = match tokio::time::timeout(self.config.probe_timeout, probe).await {
            Ok(Ok(metrics)) => HealthRecord {
                host_id: host.id.clone(),
                online: true,
                last_checked: chrono::Utc::now(),
                response_ms: started.elapsed().as_millis() as u64,
                source: HealthSource::Probe,
                error: None,
                metrics,
            },
            Ok(Err(e)) => {
                debug!(error = %e, "Probe failed.");
                HealthRecord::offline(&host.id, HealthSource::Probe, Some(e.to_string()))
            }
            Err(_) => {
                debug!("Probe timed out.");
                HealthRecord::offline(
                    &host.id,
                    HealthSource::Probe,
                    Some(format!("probe timed out after {}s", self.config.probe_timeout.as_secs())),
                )
            }
        };
        self.store.record_probe(record.clone());
        record
    }

    /// One sweep over every registered host, in order.
    pub async fn poll_all(&self) -> usize {
        let hosts = self.hosts.list();
        let mut online = 0;
        for (i, host) in hosts.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.host_delay).await;
            }
            if self.probe_now(host).await.online {
                online += 1;
            }
        }
        online
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<()>) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.warmup) => {}
            _ = shutdown.changed() => return,
        }
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let total = self.hosts.list().len();
                    tokio::select! {
                        online = self.poll_all() => {
                            info!(online, total, "Health sweep finished.");
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Health poller stopped.");
    }
}
