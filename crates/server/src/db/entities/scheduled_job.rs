use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::{JobRunStatus, ScheduledJob};

/// Row of the `scheduled_jobs` table. `args` and `host_ids` are JSON arrays.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub cron: String,
    pub script_path: String,
    pub args: String,
    pub host_ids: String,
    pub enabled: bool,
    pub timeout_mins: i32,
    pub retries: i32,
    pub retry_delay_mins: i32,
    pub notify_on_fail: bool,
    pub notify_on_success: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub last_error: Option<String>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: i64,
    pub success_count: i64,
    pub fail_count: i64,
}

impl From<&ScheduledJob> for Model {
    fn from(job: &ScheduledJob) -> Self {
        Self {
            id: job.id.clone(),
            name: job.name.clone(),
            cron: job.cron.clone(),
            script_path: job.script_path.clone(),
            args: serde_json::to_string(&job.args).unwrap_or_else(|_| "[]".to_string()),
            host_ids: serde_json::to_string(&job.host_ids).unwrap_or_else(|_| "[]".to_string()),
            enabled: job.enabled,
            timeout_mins: job.timeout_mins as i32,
            retries: job.retries as i32,
            retry_delay_mins: job.retry_delay_mins as i32,
            notify_on_fail: job.notify_on_fail,
            notify_on_success: job.notify_on_success,
            last_run: job.last_run,
            last_status: job.last_status.map(|s| s.as_str().to_string()),
            last_error: job.last_error.clone(),
            next_run: job.next_run,
            run_count: job.run_count as i64,
            success_count: job.success_count as i64,
            fail_count: job.fail_count as i64,
        }
    }
}

impl From<Model> for ScheduledJob {
    fn from(model: Model) -> Self {
        Self {
            id: model.id,
            name: model.name,
            cron: model.cron,
            script_path: model.script_path,
            args: serde_json::from_str(&model.args).unwrap_or_default(),
            host_ids: serde_json::from_str(&model.host_ids).unwrap_or_default(),
            enabled: model.enabled,
            timeout_mins: model.timeout_mins.max(0) as u32,
            retries: model.retries.max(0) as u32,
            retry_delay_mins: model.retry_delay_mins.max(0) as u32,
            notify_on_fail: model.notify_on_fail,
            notify_on_success: model.notify_on_success,
            last_run: model.last_run,
            last_status: model.last_status.as_deref().and_then(JobRunStatus::parse),
            last_error: model.last_error,
            next_run: model.next_run,
            run_count: model.run_count.max(0) as u64,
            success_count: model.success_count.max(0) as u64,
            fail_count: model.fail_count.max(0) as u64,
        }
    }
}
