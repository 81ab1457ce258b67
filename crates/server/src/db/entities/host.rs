use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::hosts::{Host, DEFAULT_SSH_PORT};

/// Row of the `hosts` table. Tags are stored as a JSON array.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: i32,
    pub login: String,
    pub secret: String,
    pub has_agent: bool,
    pub agent_port: Option<i32>,
    pub tags: String,
    pub mac: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Host> for Model {
    fn from(host: &Host) -> Self {
        Self {
            id: host.id.clone(),
            name: host.name.clone(),
            address: host.address.clone(),
            port: i32::from(host.port),
            login: host.login.clone(),
            secret: host.secret.clone(),
            has_agent: host.has_agent,
            agent_port: host.agent_port.map(i32::from),
            tags: serde_json::to_string(&host.tags).unwrap_or_else(|_| "[]".to_string()),
            mac: host.mac.clone(),
            created_at: host.created_at,
            updated_at: host.updated_at,
        }
    }
}

impl From<Model> for Host {
    fn from(model: Model) -> Self {
        let tags: BTreeSet<String> = serde_json::from_str(&model.tags).unwrap_or_default();
        Self {
            id: model.id,
            name: model.name,
            address: model.address,
            port: u16::try_from(model.port).unwrap_or(DEFAULT_SSH_PORT),
            login: model.login,
            secret: model.secret,
            has_agent: model.has_agent,
            agent_port: model.agent_port.and_then(|p| u16::try_from(p).ok()),
            tags,
            mac: model.mac,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}
