use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::manifest::{Manifest, Task, TaskDuration};
use super::ops::{self, OpContext, OpError, OpResult, Params};
use super::outcome::{ManifestRun, TaskOutcome, TaskStatus};
use super::template::{evaluate_when, render};
use crate::transport::{shell_quote, OutputLine, Transport};

/// Receives live output while a manifest runs.
pub trait OutputSink: Send + Sync {
    fn line(&self, line: &OutputLine);

    fn task_finished(&self, _outcome: &TaskOutcome) {}
}

/// Discards everything.
pub struct NullSink;

impl OutputSink for NullSink {
    fn line(&self, _line: &OutputLine) {}
}

#[derive(Debug, Clone)]
pub struct TaskEngineConfig {
    /// Fixed delay between retries of a failed task.
    pub retry_delay: Duration,
    /// Bound for `wait-*` tasks without an explicit timeout.
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for TaskEngineConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(2),
            wait_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

struct TaskRun {
    outcome: TaskOutcome,
    registered: Option<(String, String)>,
    connection_lost: Option<String>,
}

/// Runs manifests against one host, task by task, in order.
#[derive(Debug, Clone, Default)]
pub struct TaskEngine {
    config: TaskEngineConfig,
}

impl TaskEngine {
    pub fn new(config: TaskEngineConfig) -> Self {
        Self { config }
    }

    /// Variables resolve from `manifest.vars`, then `overrides`, then values
    /// registered by earlier tasks. A failing task never stops the run; once
    /// the connection is lost every remaining task fails without running.
    pub async fn run(
        &self,
        transport: &dyn Transport,
        manifest: &Manifest,
        overrides: &HashMap<String, String>,
        sudo: bool,
        sink: &dyn OutputSink,
    ) -> ManifestRun {
        let mut vars = manifest.vars.clone();
        vars.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut run = ManifestRun::default();
        for task in &manifest.tasks {
            let outcome = match &run.connection_error {
                Some(err) => outcome(task, TaskStatus::Failed, Some(format!("connection lost: {err}")), String::new(), 0),
                None => {
                    let task_run = self.run_task(transport, task, &vars, sudo, sink).await;
                    if let Some((name, value)) = task_run.registered {
                        vars.insert(name.clone(), value.clone());
                        run.registered.insert(name, value);
                    }
                    if task_run.connection_lost.is_some() {
                        run.connection_error = task_run.connection_lost;
                    }
                    task_run.outcome
                }
            };
            debug!(task = %outcome.name, status = outcome.status.as_str(), "Task finished.");
            run.stats.record(outcome.status);
            sink.task_finished(&outcome);
            run.outcomes.push(outcome);
        }
        run
    }

    async fn run_task(
        &self,
        transport: &dyn Transport,
        task: &Task,
        vars: &HashMap<String, String>,
        sudo: bool,
        sink: &dyn OutputSink,
    ) -> TaskRun {
        let sudo = sudo || task.options.sudo;
        let finish = |status: TaskStatus, error: Option<String>, output: String, attempts: u32, lost: Option<String>| TaskRun {
            outcome: outcome(task, status, error, output, attempts),
            registered: None,
            connection_lost: lost,
        };

        if let Some(when) = &task.options.when {
            if !evaluate_when(when, vars) {
                return finish(TaskStatus::Skipped, None, format!("skipped: when '{when}' is false"), 0, None);
            }
        }

        if let Some(creates) = &task.options.creates {
            let path = render(creates, vars);
            let check = format!("test -e {}", shell_quote(&path));
            let check = if sudo { format!("sudo -n sh -c {}", shell_quote(&check)) } else { check };
            match transport.exec(&check, None).await {
                Ok(out) if out.success() => {
                    return finish(TaskStatus::Skipped, None, format!("skipped: {path} exists"), 0, None);
                }
                Ok(_) => {}
                Err(e) => {
                    let lost = e.is_connection_lost().then(|| e.to_string());
                    return finish(TaskStatus::Failed, Some(e.to_string()), String::new(), 0, lost);
                }
            }
        }

        let items: Vec<Option<String>> = match &task.options.loop_items {
            Some(items) => items.iter().map(|item| Some(render(item, vars))).collect(),
            None => vec![None],
        };

        let mut changed = false;
        let mut error = None;
        let mut outputs = Vec::new();
        let mut attempts = 0;
        let mut lost = None;
        for item in items {
            let mut scope = vars.clone();
            if let Some(item) = item {
                scope.insert("item".to_string(), item);
            }
            let params: Params = task
                .params
                .iter()
                .map(|(k, v)| (k.clone(), render(v, &scope)))
                .collect();
            let ctx = OpContext {
                transport,
                sudo,
                user_scope: task.options.user,
                sink,
                vars: &scope,
                poll_interval: self.config.poll_interval,
            };

            let (result, tries) = self.attempt(&ctx, task, &params).await;
            attempts += tries;
            match result {
                Ok(OpResult { changed: c, output }) => {
                    changed |= c;
                    if !output.is_empty() {
                        outputs.push(output);
                    }
                }
                Err(OpError::Failed(msg)) => error = Some(msg),
                Err(OpError::Transport(e)) => {
                    error = Some(e.to_string());
                    if e.is_connection_lost() {
                        lost = Some(e.to_string());
                        break;
                    }
                }
            }
        }

        let output = outputs.join("\n");
        let status = match (&error, task.options.ignore) {
            (None, _) if changed => TaskStatus::Changed,
            (None, _) => TaskStatus::Ok,
            (Some(_), true) => TaskStatus::Ok,
            (Some(_), false) => TaskStatus::Failed,
        };
        if let (Some(err), true) = (&error, task.options.ignore) {
            debug!(task = %task.label(), error = %err, "Ignoring task failure.");
        }

        let registered = task
            .options
            .register
            .as_ref()
            .map(|name| (name.clone(), output.clone()));
        TaskRun {
            outcome: outcome(task, status, error, output, attempts),
            registered,
            connection_lost: lost,
        }
    }

    /// Runs the operation with the task's retry and timeout policy.
    async fn attempt(&self, ctx: &OpContext<'_>, task: &Task, params: &Params) -> (Result<OpResult, OpError>, u32) {
        let limit = task
            .options
            .timeout
            .map(|t| t.as_duration())
            .or_else(|| task.kind.is_wait().then_some(self.config.wait_timeout));

        let mut tries = 0;
        loop {
            tries += 1;
            let op = ops::execute(ctx, task.kind, params);
            let result = match limit {
                Some(limit) => match tokio::time::timeout(limit, op).await {
                    Ok(result) => result,
                    Err(_) => Err(OpError::Failed(format!("timeout after {}", describe(limit)))),
                },
                None => op.await,
            };

            match &result {
                Ok(_) => return (result, tries),
                Err(OpError::Transport(e)) if e.is_connection_lost() => return (result, tries),
                Err(_) if tries <= task.options.retry => {
                    warn!(
                        task = %task.label(),
                        attempt = tries,
                        retries = task.options.retry,
                        "Task failed; retrying."
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(_) => return (result, tries),
            }
        }
    }
}

fn outcome(task: &Task, status: TaskStatus, error: Option<String>, output: String, attempts: u32) -> TaskOutcome {
    TaskOutcome {
        task_id: task.id.clone(),
        name: task.label(),
        kind: task.kind.to_string(),
        status,
        output,
        error,
        attempts,
    }
}

fn describe(limit: Duration) -> String {
    if limit < Duration::from_secs(1) {
        format!("{}ms", limit.as_millis())
    } else {
        TaskDuration::from(limit).to_string()
    }
}
