use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row of the `execution_history` table; one per host per execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: i64,
    pub exec_id: String,
    pub host_id: String,
    pub host_name: String,
    pub label: String,
    pub status: String,
    pub ok_count: i64,
    pub changed_count: i64,
    pub failed_count: i64,
    pub skipped_count: i64,
    pub error: Option<String>,
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
