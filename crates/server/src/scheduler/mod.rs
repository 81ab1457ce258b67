//! Cron-driven job runner. Each job uploads a local script to its hosts,
//! runs it through the coordinator and records the outcome.

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::coordinator::{Coordinator, Execution, HostResult, HostStatus, HostTimeout, RunRequest};
use crate::db::duckdb_service::{self, job_service, DuckDbPool};
use crate::db::entities::scheduled_job;
use crate::hosts::HostRegistry;
use crate::notifications::{Notification, NotificationDispatcher};
use crate::tasks::{Manifest, Task, TaskKind};
use crate::transport::shell_quote;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("invalid cron expression '{0}': {1}")]
    InvalidCron(String, String),
    #[error("invalid job: {0}")]
    Invalid(String),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Storage(#[from] duckdb_service::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobRunStatus {
    Success,
    Failed,
}

impl JobRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Success => "success",
            JobRunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(JobRunStatus::Success),
            "failed" => Some(JobRunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub name: String,
    /// Six fields: `sec min hour dom mon dow`.
    pub cron: String,
    pub script_path: String,
    pub args: Vec<String>,
    pub host_ids: Vec<String>,
    pub enabled: bool,
    /// 0 keeps the scheduler default.
    pub timeout_mins: u32,
    pub retries: u32,
    pub retry_delay_mins: u32,
    pub notify_on_fail: bool,
    pub notify_on_success: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<JobRunStatus>,
    pub last_error: Option<String>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub success_count: u64,
    pub fail_count: u64,
}

/// Create/edit payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobInput {
    pub name: String,
    pub cron: String,
    pub script_path: String,
    pub args: Vec<String>,
    pub host_ids: Vec<String>,
    pub enabled: bool,
    pub timeout_mins: u32,
    pub retries: u32,
    pub retry_delay_mins: u32,
    pub notify_on_fail: bool,
    pub notify_on_success: bool,
}

impl Default for JobInput {
    fn default() -> Self {
        Self {
            name: String::new(),
            cron: String::new(),
            script_path: String::new(),
            args: Vec::new(),
            host_ids: Vec::new(),
            enabled: true,
            timeout_mins: 0,
            retries: 0,
            retry_delay_mins: 1,
            notify_on_fail: false,
            notify_on_success: false,
        }
    }
}

impl JobInput {
    pub fn new(name: impl Into<String>, cron: impl Into<String>, script_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cron: cron.into(),
            script_path: script_path.into(),
            ..Default::default()
        }
    }

    pub fn on_hosts<I, S>(mut self, host_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.host_ids = host_ids.into_iter().map(Into::into).collect();
        self
    }

    fn validate(&self) -> Result<Schedule, SchedulerError> {
        if self.script_path.trim().is_empty() {
            return Err(SchedulerError::Invalid("script_path is required".into()));
        }
        if self.host_ids.is_empty() {
            return Err(SchedulerError::Invalid("at least one host is required".into()));
        }
        parse_cron(&self.cron)
    }
}

/// Parses a six-field cron expression.
pub fn parse_cron(expr: &str) -> Result<Schedule, SchedulerError> {
    let fields = expr.split_whitespace().count();
    if fields != 6 {
        return Err(SchedulerError::InvalidCron(
            expr.to_string(),
            format!("expected 6 fields, found {fields}"),
        ));
    }
    Schedule::from_str(expr).map_err(|e| SchedulerError::InvalidCron(expr.to_string(), e.to_string()))
}

/// Smallest fire time strictly after `after`.
pub fn next_after(schedule: &Schedule, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(after).next()
}

/// Next slot for an armed timer. Never at or before `previous`, so a wakeup
/// that lands slightly ahead of its slot cannot fire that slot twice.
pub fn next_slot(
    schedule: &Schedule,
    previous: &DateTime<Utc>,
    now: &DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    next_after(schedule, previous.max(now))
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub default_timeout_mins: u32,
    /// Length of one "minute" for job timeouts and retry delays.
    pub minute: Duration,
    pub remote_tmp_dir: String,
    /// Base for relative script paths.
    pub scripts_dir: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_timeout_mins: 30,
            minute: Duration::from_secs(60),
            remote_tmp_dir: "/tmp".to_string(),
            scripts_dir: PathBuf::from("scripts"),
        }
    }
}

pub struct Scheduler {
    jobs: Mutex<HashMap<String, ScheduledJob>>,
    timers: Mutex<HashMap<String, AbortHandle>>,
    coordinator: Arc<Coordinator>,
    hosts: Arc<HostRegistry>,
    notifier: Arc<dyn NotificationDispatcher>,
    db_pool: Option<DuckDbPool>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        coordinator: Arc<Coordinator>,
        hosts: Arc<HostRegistry>,
        notifier: Arc<dyn NotificationDispatcher>,
        db_pool: Option<DuckDbPool>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            coordinator,
            hosts,
            notifier,
            db_pool,
            config,
        }
    }

    /// Loads persisted jobs, arms every enabled one and disarms them all
    /// when `shutdown` fires.
    pub async fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<()>) -> Result<usize, SchedulerError> {
        if let Some(pool) = &self.db_pool {
            let models = job_service::get_all_jobs(pool.clone()).await?;
            let mut jobs = self.jobs.lock().await;
            for model in models {
                let job = ScheduledJob::from(model);
                jobs.insert(job.id.clone(), job);
            }
        }

        let enabled: Vec<ScheduledJob> = self
            .jobs
            .lock()
            .await
            .values()
            .filter(|j| j.enabled)
            .cloned()
            .collect();
        let mut armed = 0;
        for job in enabled {
            match parse_cron(&job.cron) {
                Ok(schedule) => {
                    self.arm(&job.id, schedule).await;
                    armed += 1;
                }
                Err(e) => warn!(job_id = %job.id, error = %e, "Persisted job has an invalid schedule; not armed."),
            }
        }
        info!(armed, "Scheduler started.");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _ = shutdown.changed().await;
            this.disarm_all().await;
            info!("Scheduler stopped.");
        });
        Ok(armed)
    }

    pub async fn create(self: &Arc<Self>, input: JobInput) -> Result<ScheduledJob, SchedulerError> {
        let schedule = input.validate()?;
        let name = if input.name.trim().is_empty() {
            input.script_path.clone()
        } else {
            input.name.clone()
        };
        let job = ScheduledJob {
            id: Uuid::new_v4().to_string(),
            name,
            cron: input.cron.trim().to_string(),
            script_path: input.script_path,
            args: input.args,
            host_ids: input.host_ids,
            enabled: input.enabled,
            timeout_mins: input.timeout_mins,
            retries: input.retries,
            retry_delay_mins: input.retry_delay_mins,
            notify_on_fail: input.notify_on_fail,
            notify_on_success: input.notify_on_success,
            last_run: None,
            last_status: None,
            last_error: None,
            next_run: input.enabled.then(|| next_after(&schedule, &Utc::now())).flatten(),
            run_count: 0,
            success_count: 0,
            fail_count: 0,
        };
        self.persist(&job).await?;
        self.jobs.lock().await.insert(job.id.clone(), job.clone());
        if job.enabled {
            self.arm(&job.id, schedule).await;
        }
        info!(job_id = %job.id, name = %job.name, cron = %job.cron, "Job created.");
        Ok(job)
    }

    /// Replaces the job's definition, keeping its run history.
    pub async fn update(self: &Arc<Self>, id: &str, input: JobInput) -> Result<ScheduledJob, SchedulerError> {
        let schedule = input.validate()?;
        let mut job = self
            .get(id)
            .await
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        if !input.name.trim().is_empty() {
            job.name = input.name;
        }
        job.cron = input.cron.trim().to_string();
        job.script_path = input.script_path;
        job.args = input.args;
        job.host_ids = input.host_ids;
        job.enabled = input.enabled;
        job.timeout_mins = input.timeout_mins;
        job.retries = input.retries;
        job.retry_delay_mins = input.retry_delay_mins;
        job.notify_on_fail = input.notify_on_fail;
        job.notify_on_success = input.notify_on_success;
        job.next_run = job.enabled.then(|| next_after(&schedule, &Utc::now())).flatten();

        self.persist(&job).await?;
        self.jobs.lock().await.insert(job.id.clone(), job.clone());
        self.disarm(&job.id).await;
        if job.enabled {
            self.arm(&job.id, schedule).await;
        }
        info!(job_id = %job.id, enabled = job.enabled, "Job updated.");
        Ok(job)
    }

    pub async fn delete(&self, id: &str) -> Result<ScheduledJob, SchedulerError> {
        let job = self
            .jobs
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        self.disarm(id).await;
        if let Some(pool) = &self.db_pool {
            match job_service::delete_job(pool.clone(), id.to_string()).await {
                Ok(()) | Err(duckdb_service::Error::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(job_id = %id, "Job deleted.");
        Ok(job)
    }

    pub async fn get(&self, id: &str) -> Option<ScheduledJob> {
        self.jobs.lock().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub async fn is_armed(&self, id: &str) -> bool {
        self.timers.lock().await.contains_key(id)
    }

    /// Fires the job in the background regardless of its schedule.
    pub async fn run_now(self: &Arc<Self>, id: &str) -> Result<(), SchedulerError> {
        if self.get(id).await.is_none() {
            return Err(SchedulerError::NotFound(id.to_string()));
        }
        let this = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.fire(&id).await {
                error!(job_id = %id, error = %e, "Manual job run failed.");
            }
        });
        Ok(())
    }

    /// Runs the job to its final outcome: every attempt, retries and the
    /// closing notification.
    #[instrument(skip(self))]
    pub async fn fire(&self, id: &str) -> Result<JobRunStatus, SchedulerError> {
        let job = self
            .get(id)
            .await
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;

        let host_ids: Vec<String> = job
            .host_ids
            .iter()
            .filter(|host_id| {
                let known = self.hosts.contains(host_id);
                if !known {
                    warn!(job_id = %job.id, host_id = %host_id, "Job host no longer exists; dropping.");
                }
                known
            })
            .cloned()
            .collect();

        let script = self.script_source(&job.script_path);
        let precheck = if host_ids.is_empty() {
            Some("no hosts to run on".to_string())
        } else if let Err(e) = tokio::fs::metadata(&script).await {
            Some(format!("cannot read script {}: {e}", script.display()))
        } else {
            None
        };
        if let Some(reason) = precheck {
            warn!(job_id = %job.id, reason = %reason, "Job cannot run.");
            self.record_attempt(&job.id, Utc::now(), JobRunStatus::Failed, Some(reason.clone()))
                .await;
            self.notify(&job, JobRunStatus::Failed, reason, job.host_ids.len(), job.host_ids.len())
                .await;
            return Ok(JobRunStatus::Failed);
        }

        let timeout_mins = if job.timeout_mins == 0 {
            self.config.default_timeout_mins
        } else {
            job.timeout_mins
        };
        let retry_delay = self.config.minute * job.retry_delay_mins.max(1);

        let mut attempt = 0;
        loop {
            let execution = self
                .coordinator
                .run(self.job_request(&job, &script, &host_ids, timeout_mins))
                .await;
            let failed: Vec<&HostResult> = execution
                .results
                .iter()
                .filter(|r| r.status == HostStatus::Failed)
                .collect();
            let status = if failed.is_empty() {
                JobRunStatus::Success
            } else {
                JobRunStatus::Failed
            };
            let error = (!failed.is_empty()).then(|| summarize_failures(&failed));
            self.record_attempt(&job.id, execution.started_at, status, error.clone())
                .await;
            info!(job_id = %job.id, attempt, status = status.as_str(), "Job attempt finished.");

            if status == JobRunStatus::Success || attempt >= job.retries {
                let message = describe(&execution, error);
                self.notify(&job, status, message, execution.results.len(), failed.len())
                    .await;
                return Ok(status);
            }
            attempt += 1;
            debug!(job_id = %job.id, delay = ?retry_delay, "Retrying job.");
            tokio::time::sleep(retry_delay).await;
        }
    }

    fn script_source(&self, script_path: &str) -> PathBuf {
        let path = Path::new(script_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.scripts_dir.join(path)
        }
    }

    fn job_request(
        &self,
        job: &ScheduledJob,
        script: &Path,
        host_ids: &[String],
        timeout_mins: u32,
    ) -> RunRequest {
        let remote = format!(
            "{}/fleetwarden-job-{}-{}.sh",
            self.config.remote_tmp_dir.trim_end_matches('/'),
            job.id,
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let mut cmd = shell_quote(&remote);
        for arg in &job.args {
            cmd.push(' ');
            cmd.push_str(&shell_quote(arg));
        }
        let manifest = Manifest::new(vec![
            Task::new(TaskKind::Upload)
                .named("upload script")
                .param("src", script.to_string_lossy())
                .param("dest", remote.clone())
                .param("mode", "0700"),
            Task::new(TaskKind::Run).named("run script").param("cmd", cmd),
            Task::new(TaskKind::Rm).named("remove script").param("path", remote),
        ]);

        let mut request = RunRequest::new(host_ids.to_vec(), manifest);
        request.label = format!("job:{}", job.name);
        request.host_timeout = Some(HostTimeout {
            limit: self.config.minute * timeout_mins,
            message: format!("timeout: job exceeded {timeout_mins} minute(s)"),
        });
        request
    }

    async fn record_attempt(
        &self,
        id: &str,
        ran_at: DateTime<Utc>,
        status: JobRunStatus,
        error: Option<String>,
    ) {
        let updated = {
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.get_mut(id) else {
                return;
            };
            job.last_run = Some(ran_at);
            job.last_status = Some(status);
            job.last_error = error;
            job.run_count += 1;
            match status {
                JobRunStatus::Success => job.success_count += 1,
                JobRunStatus::Failed => job.fail_count += 1,
            }
            job.next_run = match (job.enabled, parse_cron(&job.cron)) {
                (true, Ok(schedule)) => next_after(&schedule, &ran_at),
                _ => None,
            };
            job.clone()
        };
        if let Err(e) = self.persist(&updated).await {
            error!(job_id = %id, error = %e, "Failed to persist job run.");
        }
    }

    async fn notify(&self, job: &ScheduledJob, status: JobRunStatus, message: String, total: usize, failed: usize) {
        let wanted = match status {
            JobRunStatus::Failed => job.notify_on_fail,
            JobRunStatus::Success => job.notify_on_success,
        };
        if !wanted {
            return;
        }
        let notification = Notification {
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            status: status.as_str().to_string(),
            message,
            hosts_total: total,
            hosts_failed: failed,
        };
        if let Err(e) = self.notifier.dispatch(&notification).await {
            error!(job_id = %job.id, error = %e, "Failed to send job notification.");
        }
    }

    async fn persist(&self, job: &ScheduledJob) -> Result<(), SchedulerError> {
        if let Some(pool) = &self.db_pool {
            job_service::upsert_job(pool.clone(), scheduled_job::Model::from(job)).await?;
        }
        Ok(())
    }

    async fn arm(self: &Arc<Self>, id: &str, schedule: Schedule) {
        let this = Arc::clone(self);
        let job_id = id.to_string();
        let handle = tokio::spawn(async move {
            let mut previous = Utc::now();
            while let Some(next) = next_slot(&schedule, &previous, &Utc::now()) {
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                previous = next;
                debug!(job_id = %job_id, "Cron fired.");
                // Fires overlap when a run outlasts the interval.
                let runner = Arc::clone(&this);
                let id = job_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = runner.fire(&id).await {
                        error!(job_id = %id, error = %e, "Scheduled job run failed.");
                    }
                });
            }
        })
        .abort_handle();
        if let Some(previous) = self.timers.lock().await.insert(id.to_string(), handle) {
            previous.abort();
        }
    }

    async fn disarm(&self, id: &str) {
        if let Some(handle) = self.timers.lock().await.remove(id) {
            handle.abort();
        }
    }

    async fn disarm_all(&self) {
        for (_, handle) in self.timers.lock().await.drain() {
            handle.abort();
        }
    }
}

fn summarize_failures(failed: &[&HostResult]) -> String {
    failed
        .iter()
        .map(|r| {
            let reason = r
                .error
                .clone()
                .or_else(|| r.outcomes.iter().find_map(|o| o.error.clone()))
                .unwrap_or_else(|| "failed".to_string());
            format!("{}: {reason}", r.host_name)
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn describe(execution: &Execution, error: Option<String>) -> String {
    match error {
        Some(error) => format!("execution {} {}: {error}", execution.id, execution.status.as_str()),
        None => format!(
            "execution {} completed on {} host(s)",
            execution.id,
            execution.results.len()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::history::NullHistory;
    use crate::coordinator::CoordinatorConfig;
    use crate::db::duckdb_service::DuckDBService;
    use crate::hosts::HostInput;
    use crate::notifications::NotificationError;
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::stream::StreamHub;
    use crate::tasks::TaskEngine;
    use crate::transport::LocalConnector;
    use crate::vault::Vault;
    use async_trait::async_trait;

    #[derive(Default)]
    struct Captured(std::sync::Mutex<Vec<Notification>>);

    #[async_trait]
    impl NotificationDispatcher for Captured {
        async fn dispatch(&self, notification: &Notification) -> Result<(), NotificationError> {
            self.0.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    async fn scheduler(db_pool: Option<DuckDbPool>) -> (Arc<Scheduler>, Arc<Captured>) {
        let vault = Arc::new(Vault::new(&[9u8; 32]).unwrap());
        let hosts = Arc::new(HostRegistry::new(vault.clone(), None));
        hosts
            .register(HostInput::new("127.0.0.1", "ops").with_id("h1").with_name("one"))
            .await
            .unwrap();
        let pool = Arc::new(ConnectionPool::new(Arc::new(LocalConnector), vault, PoolConfig::default()));
        let coordinator = Arc::new(Coordinator::new(
            hosts.clone(),
            pool,
            TaskEngine::default(),
            Arc::new(StreamHub::new()),
            Arc::new(NullHistory),
            CoordinatorConfig::default(),
        ));
        let notes = Arc::new(Captured::default());
        let config = SchedulerConfig {
            minute: Duration::from_millis(100),
            ..Default::default()
        };
        let scheduler = Arc::new(Scheduler::new(coordinator, hosts, notes.clone(), db_pool, config));
        (scheduler, notes)
    }

    fn script(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("job.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn cron_requires_six_fields() {
        assert!(parse_cron("0 */5 * * * *").is_ok());
        assert!(parse_cron("*/5 * * * *").is_err());
        assert!(parse_cron("0 0 12 * * Mon 2030").is_err());
        assert!(parse_cron("not a cron at all x").is_err());
    }

    #[test]
    fn next_run_is_smallest_later_fire_time() {
        let schedule = parse_cron("0 30 * * * *").unwrap();
        let last = DateTime::parse_from_rfc3339("2024-05-01T10:30:00Z").unwrap().with_timezone(&Utc);
        let next = next_after(&schedule, &last).unwrap();
        assert_eq!(next.to_rfc3339(), "2024-05-01T11:30:00+00:00");
        let mid = DateTime::parse_from_rfc3339("2024-05-01T10:29:59Z").unwrap().with_timezone(&Utc);
        assert_eq!(next_after(&schedule, &mid).unwrap(), last);
    }

    #[test]
    fn early_wakeup_does_not_repeat_slot() {
        let schedule = parse_cron("0 30 * * * *").unwrap();
        let fired = DateTime::parse_from_rfc3339("2024-05-01T10:30:00Z").unwrap().with_timezone(&Utc);
        // Clock reads just before the slot that already fired.
        let early = fired - chrono::Duration::milliseconds(3);
        let next = next_slot(&schedule, &fired, &early).unwrap();
        assert_eq!(next.to_rfc3339(), "2024-05-01T11:30:00+00:00");
        // A late clock skips slots already in the past.
        let late = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(next_slot(&schedule, &fired, &late).unwrap().to_rfc3339(), "2024-05-01T12:30:00+00:00");
    }

    #[tokio::test]
    async fn create_validates_input() {
        let (scheduler, _) = scheduler(None).await;
        let missing_hosts = JobInput::new("j", "0 * * * * *", "/tmp/x.sh");
        assert!(matches!(scheduler.create(missing_hosts).await, Err(SchedulerError::Invalid(_))));
        let bad_cron = JobInput::new("j", "* * *", "/tmp/x.sh").on_hosts(["h1"]);
        assert!(matches!(scheduler.create(bad_cron).await, Err(SchedulerError::InvalidCron(..))));
    }

    #[tokio::test]
    async fn fire_runs_script_with_args_and_records_success() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let path = script(&dir, &format!("echo \"$1 $2\" > {}", marker.display()));
        let (scheduler, notes) = scheduler(None).await;
        let mut input = JobInput::new("greet", "0 0 0 1 1 *", path).on_hosts(["h1", "ghost"]);
        input.args = vec!["hello".into(), "big world".into()];
        input.notify_on_success = true;
        let job = scheduler.create(input).await.unwrap();

        assert_eq!(scheduler.fire(&job.id).await.unwrap(), JobRunStatus::Success);
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "hello big world\n");

        let job = scheduler.get(&job.id).await.unwrap();
        assert_eq!(job.run_count, 1);
        assert_eq!(job.success_count, 1);
        assert_eq!(job.last_status, Some(JobRunStatus::Success));
        assert!(job.next_run.unwrap() > job.last_run.unwrap());
        assert_eq!(notes.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_job_retries_then_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "echo nope >&2; exit 3");
        let (scheduler, notes) = scheduler(None).await;
        let mut input = JobInput::new("flaky", "0 0 0 1 1 *", path).on_hosts(["h1"]);
        input.retries = 2;
        input.notify_on_fail = true;
        let job = scheduler.create(input).await.unwrap();

        assert_eq!(scheduler.fire(&job.id).await.unwrap(), JobRunStatus::Failed);
        let job = scheduler.get(&job.id).await.unwrap();
        assert_eq!(job.run_count, 3);
        assert_eq!(job.fail_count, 3);
        assert!(job.last_error.unwrap().contains("exit status 3"));
        let notes = notes.0.lock().unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].status, "failed");
    }

    #[tokio::test]
    async fn timeout_fails_the_host() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "sleep 5");
        let (scheduler, _) = scheduler(None).await;
        let mut input = JobInput::new("slow", "0 0 0 1 1 *", path).on_hosts(["h1"]);
        input.timeout_mins = 3;
        let job = scheduler.create(input).await.unwrap();

        assert_eq!(scheduler.fire(&job.id).await.unwrap(), JobRunStatus::Failed);
        let job = scheduler.get(&job.id).await.unwrap();
        assert_eq!(job.last_error.as_deref(), Some("one: timeout: job exceeded 3 minute(s)"));
    }

    #[tokio::test]
    async fn relative_script_resolves_against_scripts_dir() {
        let (scheduler, _) = scheduler(None).await;
        assert_eq!(
            scheduler.script_source("backup.sh"),
            PathBuf::from("scripts").join("backup.sh")
        );
        assert_eq!(scheduler.script_source("/opt/job.sh"), PathBuf::from("/opt/job.sh"));
    }

    #[tokio::test]
    async fn missing_script_fails_without_running() {
        let (scheduler, _) = scheduler(None).await;
        let job = scheduler
            .create(JobInput::new("gone", "0 0 0 1 1 *", "/nonexistent/job.sh").on_hosts(["h1"]))
            .await
            .unwrap();
        assert_eq!(scheduler.fire(&job.id).await.unwrap(), JobRunStatus::Failed);
        let job = scheduler.get(&job.id).await.unwrap();
        assert!(job.last_error.unwrap().starts_with("cannot read script"));
    }

    #[tokio::test]
    async fn disable_and_delete_disarm() {
        let (scheduler, _) = scheduler(None).await;
        let input = JobInput::new("j", "0 0 * * * *", "/tmp/j.sh").on_hosts(["h1"]);
        let job = scheduler.create(input.clone()).await.unwrap();
        assert!(scheduler.is_armed(&job.id).await);

        let disabled = JobInput { enabled: false, ..input };
        let job = scheduler.update(&job.id, disabled).await.unwrap();
        assert!(!scheduler.is_armed(&job.id).await);
        assert!(job.next_run.is_none());

        scheduler.delete(&job.id).await.unwrap();
        assert!(scheduler.get(&job.id).await.is_none());
        assert!(matches!(scheduler.delete(&job.id).await, Err(SchedulerError::NotFound(_))));
    }

    #[tokio::test]
    async fn every_second_schedule_fires() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "true");
        let (scheduler, _) = scheduler(None).await;
        let job = scheduler
            .create(JobInput::new("tick", "* * * * * *", path).on_hosts(["h1"]))
            .await
            .unwrap();
        let mut fired = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if scheduler.get(&job.id).await.unwrap().run_count > 0 {
                fired = true;
                break;
            }
        }
        assert!(fired);
        scheduler.disarm_all().await;
    }

    #[tokio::test]
    async fn start_reloads_persisted_jobs() {
        let db = DuckDBService::in_memory().unwrap();
        let (first, _) = scheduler(Some(db.pool())).await;
        let job = first
            .create(JobInput::new("nightly", "0 0 3 * * *", "/tmp/n.sh").on_hosts(["h1"]))
            .await
            .unwrap();
        first.disarm_all().await;

        let (second, _) = scheduler(Some(db.pool())).await;
        let (_tx, rx) = watch::channel(());
        assert_eq!(second.start(rx).await.unwrap(), 1);
        let reloaded = second.get(&job.id).await.unwrap();
        assert_eq!(reloaded.name, "nightly");
        assert!(second.is_armed(&job.id).await);
        second.disarm_all().await;
    }
}
