//! Ties hosts, pool, task engine, stream hub and history together for one
//! execution across many hosts.

pub mod bridge;
pub mod history;
pub mod models;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::hosts::{Host, HostRegistry};
use crate::pool::ConnectionPool;
use crate::stream::{StreamEvent, StreamHub, Subscription};
use crate::tasks::{Manifest, ManifestError, TaskEngine};
use bridge::StreamBridge;
use history::{HistoryRecord, HistorySink, DEFAULT_OUTPUT_CAP};
pub use models::{Execution, ExecutionAccepted, ExecutionStatus, HostResult, HostStatus, SubmitExecutionRequest};

const DEFAULT_LABEL: &str = "ad-hoc";
const DEFAULT_RETAINED_EXECUTIONS: usize = 256;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Upper bound on the output kept per host in the history record.
    pub output_cap: usize,
    /// Finished executions kept in memory for lookups; older ones are
    /// forgotten first. Pending and running ones are never dropped.
    pub retained_executions: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            output_cap: DEFAULT_OUTPUT_CAP,
            retained_executions: DEFAULT_RETAINED_EXECUTIONS,
        }
    }
}

/// Hard bound on a single host's run, connecting included. On expiry the
/// connection leased by that run is evicted and the host fails with
/// `message`. Other runs sharing the host keep their connections.
#[derive(Debug, Clone)]
pub struct HostTimeout {
    pub limit: Duration,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub exec_id: String,
    pub host_ids: Vec<String>,
    pub manifest: Manifest,
    pub vars: HashMap<String, String>,
    pub sudo: bool,
    pub label: String,
    pub host_timeout: Option<HostTimeout>,
}

impl RunRequest {
    pub fn new(host_ids: Vec<String>, manifest: Manifest) -> Self {
        Self {
            exec_id: Uuid::new_v4().to_string(),
            host_ids,
            manifest,
            vars: HashMap::new(),
            sudo: false,
            label: DEFAULT_LABEL.to_string(),
            host_timeout: None,
        }
    }
}

pub struct Coordinator {
    hosts: Arc<HostRegistry>,
    pool: Arc<ConnectionPool>,
    engine: TaskEngine,
    hub: Arc<StreamHub>,
    history: Arc<dyn HistorySink>,
    executions: DashMap<String, Execution>,
    finished: Mutex<VecDeque<String>>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        hosts: Arc<HostRegistry>,
        pool: Arc<ConnectionPool>,
        engine: TaskEngine,
        hub: Arc<StreamHub>,
        history: Arc<dyn HistorySink>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            hosts,
            pool,
            engine,
            hub,
            history,
            executions: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            config,
        }
    }

    /// Validates the manifest, registers a pending execution and runs it in
    /// the background. Returns the execution id immediately.
    pub fn submit(self: &Arc<Self>, request: SubmitExecutionRequest) -> Result<String, ManifestError> {
        let manifest = Manifest::from_value(request.manifest)?;
        let mut run = RunRequest::new(request.host_ids, manifest);
        run.vars = request.vars;
        run.sudo = request.sudo;
        if let Some(label) = request.label.filter(|l| !l.trim().is_empty()) {
            run.label = label;
        }
        let exec_id = run.exec_id.clone();
        self.executions.insert(
            exec_id.clone(),
            Execution {
                id: exec_id.clone(),
                label: run.label.clone(),
                host_ids: dedup(&run.host_ids),
                vars: run.vars.clone(),
                status: ExecutionStatus::Pending,
                started_at: Utc::now(),
                finished_at: None,
                results: Vec::new(),
            },
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(run).await;
        });
        Ok(exec_id)
    }

    pub fn get(&self, exec_id: &str) -> Option<Execution> {
        self.executions.get(exec_id).map(|e| e.value().clone())
    }

    /// Live subscription to an execution's events. A finished execution whose
    /// completion the hub no longer remembers gets its `complete` event
    /// replayed from the stored status. `None` for unknown ids.
    pub fn subscribe(&self, exec_id: &str) -> Option<Subscription> {
        if self.hub.is_completed(exec_id) {
            return Some(self.hub.subscribe(exec_id));
        }
        let execution = self.get(exec_id)?;
        if execution.status.is_terminal() {
            let event = StreamEvent::complete(execution.status.as_str());
            return Some(Subscription::finished(exec_id, event));
        }
        Some(self.hub.subscribe(exec_id))
    }

    /// Runs the manifest on every distinct host in parallel and publishes a
    /// single `complete` event once all of them finished.
    #[instrument(skip_all, fields(exec_id = %request.exec_id))]
    pub async fn run(&self, request: RunRequest) -> Execution {
        let host_ids = dedup(&request.host_ids);
        let started_at = self
            .executions
            .get(&request.exec_id)
            .map(|e| e.started_at)
            .unwrap_or_else(Utc::now);
        self.executions.insert(
            request.exec_id.clone(),
            Execution {
                id: request.exec_id.clone(),
                label: request.label.clone(),
                host_ids: host_ids.clone(),
                vars: request.vars.clone(),
                status: ExecutionStatus::Running,
                started_at,
                finished_at: None,
                results: Vec::new(),
            },
        );
        info!(hosts = host_ids.len(), tasks = request.manifest.tasks.len(), "Execution started.");

        let results = join_all(host_ids.iter().map(|id| self.run_host(&request, id))).await;

        let status = ExecutionStatus::from_results(&results);
        let execution = Execution {
            id: request.exec_id.clone(),
            label: request.label.clone(),
            host_ids,
            vars: request.vars.clone(),
            status,
            started_at,
            finished_at: Some(Utc::now()),
            results,
        };
        self.executions.insert(request.exec_id.clone(), execution.clone());
        self.retire(&request.exec_id);
        self.hub
            .broadcast(&request.exec_id, StreamEvent::complete(status.as_str()));
        info!(status = status.as_str(), "Execution finished.");
        execution
    }

    /// Queues a finished execution and forgets the oldest ones past the
    /// retention bound.
    fn retire(&self, exec_id: &str) {
        let Ok(mut finished) = self.finished.lock() else {
            return;
        };
        finished.push_back(exec_id.to_string());
        while finished.len() > self.config.retained_executions {
            if let Some(old) = finished.pop_front() {
                self.executions.remove(&old);
            }
        }
    }

    async fn run_host(&self, request: &RunRequest, host_id: &str) -> HostResult {
        let started_at = Utc::now();
        let Some(host) = self.hosts.get(host_id) else {
            warn!(host_id, "Host not found; skipping.");
            let bridge = StreamBridge::new(self.hub.clone(), &request.exec_id, host_id, host_id, self.config.output_cap);
            bridge.error("host not found");
            let result = HostResult::failed(host_id, host_id, "host not found", started_at);
            self.write_history(request, &result, bridge.into_output()).await;
            return result;
        };

        let bridge = StreamBridge::new(
            self.hub.clone(),
            &request.exec_id,
            &host.id,
            &host.name,
            self.config.output_cap,
        );
        let result = self.run_on(&host, request, &bridge, started_at).await;
        self.write_history(request, &result, bridge.into_output()).await;
        result
    }

    async fn run_on(
        &self,
        host: &Host,
        request: &RunRequest,
        bridge: &StreamBridge,
        started_at: chrono::DateTime<Utc>,
    ) -> HostResult {
        let deadline = request
            .host_timeout
            .as_ref()
            .map(|t| (Instant::now() + t.limit, t));
        let timed_out = |timeout: &HostTimeout| {
            warn!(host_id = %host.id, limit = ?timeout.limit, "Host run timed out.");
            bridge.error(&timeout.message);
            HostResult::failed(&host.id, &host.name, timeout.message.clone(), started_at)
        };

        let acquired = match deadline {
            Some((at, timeout)) => match tokio::time::timeout_at(at, self.pool.acquire(host)).await {
                Ok(acquired) => acquired,
                Err(_) => return timed_out(timeout),
            },
            None => self.pool.acquire(host).await,
        };
        let lease = match acquired {
            Ok(lease) => lease,
            Err(e) => {
                warn!(host_id = %host.id, error = %e, "Connection failed.");
                let message = e.to_string();
                bridge.error(&message);
                return HostResult::failed(&host.id, &host.name, message, started_at);
            }
        };

        let transport = Arc::clone(lease.transport());
        let engine_run = self.engine.run(
            transport.as_ref(),
            &request.manifest,
            &request.vars,
            request.sudo,
            bridge,
        );
        let run = match deadline {
            Some((at, timeout)) => {
                let finished = tokio::time::timeout_at(at, engine_run).await;
                match finished {
                    Ok(run) => run,
                    Err(_) => {
                        // Only this run's connection is suspect.
                        self.pool.evict(lease).await;
                        return timed_out(timeout);
                    }
                }
            }
            None => engine_run.await,
        };

        if let Some(err) = &run.connection_error {
            warn!(host_id = %host.id, error = %err, "Connection lost mid-run; evicting.");
            bridge.error(&format!("connection lost: {err}"));
            self.pool.evict(lease).await;
        } else {
            self.pool.release(lease).await;
        }

        let failed = run.stats.failed > 0 || run.connection_error.is_some();
        debug!(host_id = %host.id, ok = run.stats.ok, changed = run.stats.changed, failed = run.stats.failed, skipped = run.stats.skipped, "Host run finished.");
        HostResult {
            host_id: host.id.clone(),
            host_name: host.name.clone(),
            status: if failed { HostStatus::Failed } else { HostStatus::Success },
            stats: run.stats,
            outcomes: run.outcomes,
            registered: run.registered,
            error: run.connection_error.map(|e| format!("connection lost: {e}")),
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn write_history(&self, request: &RunRequest, result: &HostResult, output: String) {
        let record = HistoryRecord {
            exec_id: request.exec_id.clone(),
            host_id: result.host_id.clone(),
            host_name: result.host_name.clone(),
            label: request.label.clone(),
            status: result.status.as_str().to_string(),
            stats: result.stats,
            error: result.error.clone(),
            output,
            started_at: result.started_at,
            finished_at: result.finished_at,
        };
        if let Err(e) = self.history.record(record).await {
            warn!(exec_id = %request.exec_id, host_id = %result.host_id, error = %e, "Failed to write history.");
        }
    }
}

fn dedup(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter().filter(|id| seen.insert(id.as_str())).cloned().collect()
}
