use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::duckdb_service::{self, host_service, DuckDbPool};
use crate::vault::{Vault, VaultError};

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("host not found: {0}")]
    NotFound(String),
    #[error("host already exists: {0}")]
    Duplicate(String),
    #[error("invalid host: {0}")]
    Invalid(String),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error("storage error: {0}")]
    Storage(#[from] duckdb_service::Error),
}

/// A registered fleet machine. `secret` is always vault ciphertext (or empty)
/// and never leaves the process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub login: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub has_agent: bool,
    pub agent_port: Option<u16>,
    pub tags: BTreeSet<String>,
    pub mac: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registration and edit payload. `secret` is plaintext; on edit an absent
/// or empty secret keeps the stored one.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostInput {
    pub id: Option<String>,
    pub name: Option<String>,
    pub address: String,
    pub port: Option<u16>,
    pub login: String,
    pub secret: Option<String>,
    pub has_agent: bool,
    pub agent_port: Option<u16>,
    pub tags: BTreeSet<String>,
    pub mac: Option<String>,
}

impl HostInput {
    pub fn new(address: impl Into<String>, login: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            login: login.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    fn validate(&self) -> Result<(), HostError> {
        if self.address.trim().is_empty() {
            return Err(HostError::Invalid("address must not be empty".to_string()));
        }
        if self.port == Some(0) {
            return Err(HostError::Invalid("port must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Authoritative host table. Reads come from memory; writes go to the
/// `hosts` table first when a database is attached.
pub struct HostRegistry {
    hosts: DashMap<String, Host>,
    vault: Arc<Vault>,
    db_pool: Option<DuckDbPool>,
}

impl HostRegistry {
    pub fn new(vault: Arc<Vault>, db_pool: Option<DuckDbPool>) -> Self {
        Self {
            hosts: DashMap::new(),
            vault,
            db_pool,
        }
    }

    /// Repopulates from storage and re-encrypts any secret still stored in
    /// plaintext. Returns the number of hosts loaded.
    pub async fn load(&self) -> Result<usize, HostError> {
        let Some(pool) = self.db_pool.clone() else {
            return Ok(0);
        };
        let stored = host_service::get_all_hosts(pool.clone()).await?;
        let mut migrated = 0;
        for model in stored {
            let mut host = Host::from(model);
            if !host.secret.is_empty() && !self.vault.is_encrypted(&host.secret) {
                host.secret = self.vault.encrypt(&host.secret)?;
                host_service::upsert_host(pool.clone(), (&host).into()).await?;
                migrated += 1;
            }
            self.hosts.insert(host.id.clone(), host);
        }
        if migrated > 0 {
            warn!(count = migrated, "Re-encrypted host secrets that were stored in plaintext.");
        }
        info!(count = self.hosts.len(), "Host registry loaded.");
        Ok(self.hosts.len())
    }

    pub async fn register(&self, input: HostInput) -> Result<Host, HostError> {
        input.validate()?;
        let id = input
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.hosts.contains_key(&id) {
            return Err(HostError::Duplicate(id));
        }

        let now = Utc::now();
        let host = Host {
            name: input.name.clone().unwrap_or_else(|| input.address.clone()),
            address: input.address.trim().to_string(),
            port: input.port.unwrap_or(DEFAULT_SSH_PORT),
            login: input.login,
            secret: self.vault.encrypt(input.secret.as_deref().unwrap_or(""))?,
            has_agent: input.has_agent,
            agent_port: input.agent_port,
            tags: input.tags,
            mac: input.mac,
            created_at: now,
            updated_at: now,
            id,
        };
        self.persist(&host).await?;
        self.hosts.insert(host.id.clone(), host.clone());
        info!(host_id = %host.id, address = %host.address, "Host registered.");
        Ok(host)
    }

    pub async fn update(&self, id: &str, input: HostInput) -> Result<Host, HostError> {
        input.validate()?;
        let mut host = self
            .get(id)
            .ok_or_else(|| HostError::NotFound(id.to_string()))?;

        if let Some(name) = input.name {
            host.name = name;
        }
        host.address = input.address.trim().to_string();
        host.port = input.port.unwrap_or(host.port);
        host.login = input.login;
        if let Some(secret) = input.secret.filter(|s| !s.is_empty()) {
            host.secret = self.vault.encrypt(&secret)?;
        }
        host.has_agent = input.has_agent;
        host.agent_port = input.agent_port;
        host.tags = input.tags;
        host.mac = input.mac;
        host.updated_at = Utc::now();

        self.persist(&host).await?;
        self.hosts.insert(host.id.clone(), host.clone());
        info!(host_id = %host.id, "Host updated.");
        Ok(host)
    }

    pub async fn delete(&self, id: &str) -> Result<Host, HostError> {
        if !self.hosts.contains_key(id) {
            return Err(HostError::NotFound(id.to_string()));
        }
        if let Some(pool) = self.db_pool.clone() {
            host_service::delete_host(pool, id.to_string()).await?;
        }
        let (_, host) = self
            .hosts
            .remove(id)
            .ok_or_else(|| HostError::NotFound(id.to_string()))?;
        info!(host_id = %id, "Host deleted.");
        Ok(host)
    }

    pub fn get(&self, id: &str) -> Option<Host> {
        self.hosts.get(id).map(|h| h.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.hosts.contains_key(id)
    }

    /// All hosts, ordered by name then id.
    pub fn list(&self) -> Vec<Host> {
        let mut hosts: Vec<Host> = self.hosts.iter().map(|h| h.value().clone()).collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        hosts
    }

    async fn persist(&self, host: &Host) -> Result<(), HostError> {
        if let Some(pool) = self.db_pool.clone() {
            host_service::upsert_host(pool, host.into()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> HostRegistry {
        HostRegistry::new(Arc::new(Vault::new(&[1u8; 32]).unwrap()), None)
    }

    #[tokio::test]
    async fn register_encrypts_secret_and_defaults_port() {
        let registry = registry();
        let host = registry
            .register(HostInput::new("10.0.0.5", "root").with_id("h1").with_secret("pw"))
            .await
            .unwrap();
        assert_eq!(host.port, DEFAULT_SSH_PORT);
        assert_eq!(host.name, "10.0.0.5");
        assert_ne!(host.secret, "pw");
        assert_eq!(registry.vault.decrypt(&host.secret), "pw");

        let json = serde_json::to_value(&host).unwrap();
        assert!(json.get("secret").is_none());
    }

    #[tokio::test]
    async fn register_rejects_empty_address_and_duplicates() {
        let registry = registry();
        assert!(matches!(
            registry.register(HostInput::new("  ", "root")).await,
            Err(HostError::Invalid(_))
        ));
        registry.register(HostInput::new("a", "root").with_id("h1")).await.unwrap();
        assert!(matches!(
            registry.register(HostInput::new("b", "root").with_id("h1")).await,
            Err(HostError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn update_keeps_secret_when_absent() {
        let registry = registry();
        let host = registry
            .register(HostInput::new("a", "root").with_id("h1").with_secret("pw"))
            .await
            .unwrap();
        let updated = registry
            .update("h1", HostInput::new("b", "admin").with_name("web"))
            .await
            .unwrap();
        assert_eq!(updated.secret, host.secret);
        assert_eq!(updated.address, "b");
        assert_eq!(updated.name, "web");
    }

    #[tokio::test]
    async fn delete_removes_host() {
        let registry = registry();
        registry.register(HostInput::new("a", "root").with_id("h1")).await.unwrap();
        registry.delete("h1").await.unwrap();
        assert!(registry.get("h1").is_none());
        assert!(matches!(registry.delete("h1").await, Err(HostError::NotFound(_))));
    }
}
