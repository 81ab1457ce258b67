use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::hosts::Host;
use crate::transport::{ConnectTarget, Connector, Transport, TransportError};
use crate::vault::Vault;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_age: Duration,
    pub max_idle: Duration,
    pub reap_interval: Duration,
    pub dial_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(5 * 60),
            max_idle: Duration::from_secs(2 * 60),
            reap_interval: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(5 * 60),
        }
    }
}

struct PoolEntry {
    transport: Arc<dyn Transport>,
    created_at: Instant,
    last_used: Instant,
    in_use: bool,
}

/// A transport borrowed from the pool. Hand it back with
/// [`ConnectionPool::release`] or [`ConnectionPool::evict`].
pub struct Lease {
    host_id: String,
    transport: Arc<dyn Transport>,
    pooled: bool,
}

impl Lease {
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// False for the dedicated transport handed out while the pooled one
    /// was busy; it is closed on release.
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub entries: usize,
    pub in_use: usize,
}

enum Pinned {
    Reuse(Arc<dyn Transport>),
    Busy,
    Empty,
}

/// Caches one live transport per host id.
pub struct ConnectionPool {
    entries: Mutex<HashMap<String, PoolEntry>>,
    connector: Arc<dyn Connector>,
    vault: Arc<Vault>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, vault: Arc<Vault>, config: PoolConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            connector,
            vault,
            config,
        }
    }

    pub async fn acquire(&self, host: &Host) -> Result<Lease, PoolError> {
        // Pin the cached entry under the lock; probe it with the lock released.
        let pinned = {
            let mut entries = self.entries.lock().await;
            match entries.get_mut(&host.id) {
                Some(entry) if !entry.in_use => {
                    entry.in_use = true;
                    entry.last_used = Instant::now();
                    Pinned::Reuse(entry.transport.clone())
                }
                Some(_) => Pinned::Busy,
                None => Pinned::Empty,
            }
        };

        match pinned {
            Pinned::Reuse(transport) => {
                if transport.is_alive().await {
                    debug!(host_id = %host.id, "Reusing pooled connection.");
                    return Ok(Lease {
                        host_id: host.id.clone(),
                        transport,
                        pooled: true,
                    });
                }
                warn!(host_id = %host.id, "Pooled connection failed liveness check; reconnecting.");
                self.drop_entry(&host.id, &transport).await;
                self.open_and_insert(host).await
            }
            Pinned::Busy => {
                debug!(host_id = %host.id, "Pooled connection busy; opening a dedicated one.");
                let transport = self.dial(host).await?;
                Ok(Lease {
                    host_id: host.id.clone(),
                    transport,
                    pooled: false,
                })
            }
            Pinned::Empty => self.open_and_insert(host).await,
        }
    }

    /// Returns a lease. Pooled transports become idle; dedicated ones, and
    /// pooled ones the reaper already dropped, are closed.
    pub async fn release(&self, lease: Lease) {
        if lease.pooled {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(&lease.host_id) {
                if Arc::ptr_eq(&entry.transport, &lease.transport) {
                    entry.in_use = false;
                    entry.last_used = Instant::now();
                    return;
                }
            }
        }
        lease.transport.close().await;
    }

    /// Returns a lease whose transport failed; it is never reused.
    pub async fn evict(&self, lease: Lease) {
        if lease.pooled {
            let mut entries = self.entries.lock().await;
            if entries
                .get(&lease.host_id)
                .is_some_and(|e| Arc::ptr_eq(&e.transport, &lease.transport))
            {
                entries.remove(&lease.host_id);
            }
        }
        info!(host_id = %lease.host_id, "Evicting failed connection.");
        lease.transport.close().await;
    }

    /// Closes and forgets the host's pooled transport, in use or not.
    pub async fn remove(&self, host_id: &str) {
        let removed = self.entries.lock().await.remove(host_id);
        if let Some(entry) = removed {
            info!(host_id = %host_id, "Removed pooled connection.");
            entry.transport.close().await;
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let entries = self.entries.lock().await;
        PoolStats {
            entries: entries.len(),
            in_use: entries.values().filter(|e| e.in_use).count(),
        }
    }

    /// Evicts entries past max-age, and idle entries past max-idle.
    /// Returns how many were evicted.
    pub async fn reap(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, Arc<dyn Transport>)> = {
            let mut entries = self.entries.lock().await;
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| {
                    now.duration_since(e.created_at) > self.config.max_age
                        || (!e.in_use && now.duration_since(e.last_used) > self.config.max_idle)
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|e| (id, e.transport)))
                .collect()
        };

        for (host_id, transport) in &expired {
            debug!(host_id = %host_id, "Reaping pooled connection.");
            transport.close().await;
        }
        expired.len()
    }

    /// Runs [`reap`](Self::reap) every reap interval until shutdown.
    pub async fn run_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.reap_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = self.reap().await;
                    if reaped > 0 {
                        info!(reaped, "Connection pool reaper evicted stale connections.");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Connection pool reaper shutting down.");
                    break;
                }
            }
        }
        self.close_all().await;
    }

    pub async fn close_all(&self) {
        let drained: Vec<PoolEntry> = self.entries.lock().await.drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.transport.close().await;
        }
    }

    async fn dial(&self, host: &Host) -> Result<Arc<dyn Transport>, PoolError> {
        let target = ConnectTarget::for_host(host, &self.vault);
        Ok(self
            .connector
            .connect(&target, self.config.dial_timeout)
            .await?)
    }

    async fn open_and_insert(&self, host: &Host) -> Result<Lease, PoolError> {
        let transport = self.dial(host).await?;
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&host.id) {
            // Another caller cached one while we were dialing.
            return Ok(Lease {
                host_id: host.id.clone(),
                transport,
                pooled: false,
            });
        }
        let now = Instant::now();
        entries.insert(
            host.id.clone(),
            PoolEntry {
                transport: transport.clone(),
                created_at: now,
                last_used: now,
                in_use: true,
            },
        );
        Ok(Lease {
            host_id: host.id.clone(),
            transport,
            pooled: true,
        })
    }

    async fn drop_entry(&self, host_id: &str, transport: &Arc<dyn Transport>) {
        {
            let mut entries = self.entries.lock().await;
            if entries
                .get(host_id)
                .is_some_and(|e| Arc::ptr_eq(&e.transport, transport))
            {
                entries.remove(host_id);
            }
        }
        transport.close().await;
    }
}
