use chrono::Utc;
use dashmap::DashMap;
use fleetwarden_common::HostMetrics;
use std::time::Duration;
use tracing::debug;

use super::{HealthRecord, HealthSource, HealthSummary};

pub const DEFAULT_AGENT_FRESH: Duration = Duration::from_secs(30);

const CPU_WARN: f64 = 80.0;
const MEM_WARN: f64 = 85.0;
const DISK_WARN: f64 = 90.0;

/// Latest health record per host.
pub struct HealthStore {
    records: DashMap<String, HealthRecord>,
    agent_fresh: Duration,
}

impl Default for HealthStore {
    fn default() -> Self {
        Self::new(DEFAULT_AGENT_FRESH)
    }
}

impl HealthStore {
    pub fn new(agent_fresh: Duration) -> Self {
        Self {
            records: DashMap::new(),
            agent_fresh,
        }
    }

    /// True while the host's agent pushed recently enough to win over probes.
    pub fn agent_is_fresh(&self, host_id: &str) -> bool {
        self.records.get(host_id).is_some_and(|r| {
            r.source == HealthSource::Agent
                && r.online
                && (Utc::now() - r.last_checked).to_std().is_ok_and(|age| age < self.agent_fresh)
        })
    }

    /// Stores a probe result unless a fresh agent record exists. Returns
    /// whether the record was written.
    pub fn record_probe(&self, record: HealthRecord) -> bool {
        if self.agent_is_fresh(&record.host_id) {
            debug!(host_id = %record.host_id, "Agent record is fresh; discarding probe.");
            return false;
        }
        self.records.insert(record.host_id.clone(), record);
        true
    }

    pub fn apply_agent_push(&self, host_id: &str, metrics: HostMetrics) {
        self.records.insert(
            host_id.to_string(),
            HealthRecord {
                host_id: host_id.to_string(),
                online: true,
                last_checked: Utc::now(),
                response_ms: 0,
                source: HealthSource::Agent,
                error: None,
                metrics,
            },
        );
    }

    /// Marks an agent-fed host offline. Probe-fed records are left alone.
    pub fn mark_agent_offline(&self, host_id: &str) {
        if let Some(mut record) = self.records.get_mut(host_id) {
            if record.source == HealthSource::Agent {
                *record = HealthRecord {
                    metrics: record.metrics.clone(),
                    ..HealthRecord::offline(host_id, HealthSource::Agent, Some("agent disconnected".into()))
                };
            }
        }
    }

    pub fn get(&self, host_id: &str) -> Option<HealthRecord> {
        self.records.get(host_id).map(|r| r.value().clone())
    }

    pub fn list(&self) -> Vec<HealthRecord> {
        let mut records: Vec<HealthRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        records
    }

    pub fn remove(&self, host_id: &str) {
        self.records.remove(host_id);
    }

    /// Aggregates over `total_hosts` registered hosts; hosts without a
    /// record count as offline.
    pub fn summary(&self, total_hosts: usize) -> HealthSummary {
        let online: Vec<HealthRecord> = self
            .records
            .iter()
            .filter(|r| r.online)
            .map(|r| r.value().clone())
            .collect();
        let average = |pick: fn(&HostMetrics) -> Option<&String>| {
            let values: Vec<f64> = online
                .iter()
                .filter_map(|r| HostMetrics::percent(pick(&r.metrics)))
                .collect();
            (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
        };
        let avg_cpu_usage = average(|m| m.cpu_usage.as_ref());
        let avg_mem_usage = average(|m| m.mem_usage.as_ref());
        let avg_disk_usage = average(|m| m.disk_usage.as_ref());

        let online_hosts = online.len().min(total_hosts);
        HealthSummary {
            total_hosts,
            online_hosts,
            offline_hosts: total_hosts - online_hosts,
            avg_cpu_usage,
            avg_mem_usage,
            avg_disk_usage,
            cpu_warning: avg_cpu_usage.is_some_and(|v| v > CPU_WARN),
            mem_warning: avg_mem_usage.is_some_and(|v| v > MEM_WARN),
            disk_warning: avg_disk_usage.is_some_and(|v| v > DISK_WARN),
        }
    }
}
