use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::tasks::{RunStats, TaskOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Partial,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Partial => "partial",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Partial
        )
    }

    /// `failed` when every host failed, `partial` when some did.
    pub fn from_results(results: &[HostResult]) -> Self {
        let failed = results.iter().filter(|r| r.status == HostStatus::Failed).count();
        if failed == 0 {
            ExecutionStatus::Completed
        } else if failed == results.len() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Partial
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Success,
    Failed,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Success => "success",
            HostStatus::Failed => "failed",
        }
    }
}

/// Outcome of one manifest run on one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostResult {
    pub host_id: String,
    pub host_name: String,
    pub status: HostStatus,
    pub stats: RunStats,
    pub outcomes: Vec<TaskOutcome>,
    #[serde(default)]
    pub registered: HashMap<String, String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl HostResult {
    /// A host that never ran a task.
    pub fn failed(host_id: &str, host_name: &str, error: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            host_id: host_id.to_string(),
            host_name: host_name.to_string(),
            status: HostStatus::Failed,
            stats: RunStats::default(),
            outcomes: Vec::new(),
            registered: HashMap::new(),
            error: Some(error.into()),
            started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Snapshot of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub label: String,
    pub host_ids: Vec<String>,
    pub vars: HashMap<String, String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub results: Vec<HostResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitExecutionRequest {
    pub host_ids: Vec<String>,
    pub manifest: serde_json::Value,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    #[serde(default)]
    pub sudo: bool,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAccepted {
    pub id: String,
}
