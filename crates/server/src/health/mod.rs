//! Fleet health: a snapshot per host, fed by SSH probes and agent pushes.

pub mod poller;
pub mod probe;
pub mod store;

use chrono::{DateTime, Utc};
use fleetwarden_common::HostMetrics;
use serde::{Deserialize, Serialize};

pub use poller::{HealthPoller, PollerConfig};
pub use store::HealthStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthSource {
    Probe,
    Agent,
}

/// Health of one host. Replaced as a whole on every update; metrics are
/// stale while `online` is false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub host_id: String,
    pub online: bool,
    pub last_checked: DateTime<Utc>,
    pub response_ms: u64,
    pub source: HealthSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metrics: HostMetrics,
}

impl HealthRecord {
    pub fn offline(host_id: &str, source: HealthSource, error: Option<String>) -> Self {
        Self {
            host_id: host_id.to_string(),
            online: false,
            last_checked: Utc::now(),
            response_ms: 0,
            source,
            error,
            metrics: HostMetrics::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total_hosts: usize,
    pub online_hosts: usize,
    pub offline_hosts: usize,
    pub avg_cpu_usage: Option<f64>,
    pub avg_mem_usage: Option<f64>,
    pub avg_disk_usage: Option<f64>,
    pub cpu_warning: bool,
    pub mem_warning: bool,
    pub disk_warning: bool,
}
