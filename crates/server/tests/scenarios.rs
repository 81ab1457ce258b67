mod common;

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{drain, engine_with_connector, engine_with_hosts, NamedHostConnector};
use fleetwarden_server::coordinator::{ExecutionStatus, HostStatus, RunRequest};
use fleetwarden_server::db::duckdb_service::{history_service, DuckDBService};
use fleetwarden_server::notifications::{Notification, NotificationDispatcher, NotificationError};
use fleetwarden_server::scheduler::{JobInput, JobRunStatus, Scheduler, SchedulerConfig};
use fleetwarden_server::stream::StreamEventKind;
use fleetwarden_server::tasks::{Manifest, TaskStatus};

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[tokio::test]
async fn write_then_read_is_idempotent() {
    let t = engine_with_hosts(&["h1"], None).await;
    let target = t.dir.path().join("greeting");
    let copy = t.dir.path().join("copy");
    let manifest = Manifest::from_value(serde_json::json!({
        "vars": {"who": "fleet"},
        "tasks": [
            {"type": "write", "name": "greet", "params": {"dest": target.to_string_lossy(), "content": "hello {{who}}"}},
            {"type": "capture", "params": {"cmd": format!("cat {}", target.display())}, "options": {"register": "said"}},
            {"type": "write", "params": {"dest": copy.to_string_lossy(), "content": "{{ said }}!"}}
        ]
    }))
    .unwrap();

    let first = t
        .engine
        .coordinator
        .run(RunRequest::new(ids(&["h1"]), manifest.clone()))
        .await;
    let stats = first.results[0].stats;
    assert_eq!((stats.ok, stats.changed, stats.failed, stats.skipped), (1, 2, 0, 0));
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello fleet");
    assert_eq!(std::fs::read_to_string(&copy).unwrap(), "hello fleet!");
    assert_eq!(first.results[0].registered.get("said").map(String::as_str), Some("hello fleet"));

    let second = t.engine.coordinator.run(RunRequest::new(ids(&["h1"]), manifest)).await;
    let stats = second.results[0].stats;
    assert_eq!((stats.ok, stats.changed), (3, 0));
}

#[tokio::test]
async fn creates_gate_skips_second_run() {
    let t = engine_with_hosts(&["h1"], None).await;
    let marker = t.dir.path().join("installed");
    let log = t.dir.path().join("install.log");
    let manifest = Manifest::from_value(serde_json::json!([{
        "type": "run",
        "params": {"cmd": format!("echo run >> {} && touch {}", log.display(), marker.display())},
        "options": {"creates": marker.to_string_lossy()}
    }]))
    .unwrap();

    let first = t.engine.coordinator.run(RunRequest::new(ids(&["h1"]), manifest.clone())).await;
    assert_eq!(first.results[0].outcomes[0].status, TaskStatus::Changed);
    let second = t.engine.coordinator.run(RunRequest::new(ids(&["h1"]), manifest)).await;
    assert_eq!(second.results[0].outcomes[0].status, TaskStatus::Skipped);
    assert_eq!(second.results[0].stats.skipped, 1);
    assert_eq!(std::fs::read_to_string(&log).unwrap(), "run\n");
}

#[tokio::test]
async fn retry_then_ignore_counts_ok() {
    let t = engine_with_hosts(&["h1"], None).await;
    let counter = t.dir.path().join("tries");
    let manifest = Manifest::from_value(serde_json::json!([
        {"type": "run", "name": "flaky",
         "params": {"cmd": format!("echo x >> {} && exit 1", counter.display())},
         "options": {"retry": 2, "ignore": true}},
        {"type": "capture", "params": {"cmd": "echo after"}}
    ]))
    .unwrap();

    let execution = t.engine.coordinator.run(RunRequest::new(ids(&["h1"]), manifest)).await;
    let result = &execution.results[0];
    assert_eq!(result.status, HostStatus::Success);
    assert_eq!(result.stats.failed, 0);
    assert_eq!(result.stats.ok, 2);
    let flaky = &result.outcomes[0];
    assert_eq!(flaky.status, TaskStatus::Ok);
    assert_eq!(flaky.attempts, 3);
    assert!(flaky.error.as_deref().unwrap().starts_with("exit status 1"));
    assert_eq!(std::fs::read_to_string(&counter).unwrap().lines().count(), 3);
}

#[tokio::test]
async fn fan_out_runs_each_distinct_host_once() {
    let t = engine_with_hosts(&["h1", "h2", "h3"], None).await;
    let manifest = Manifest::from_value(serde_json::json!([
        {"type": "capture", "params": {"cmd": "echo one"}},
        {"type": "run", "params": {"cmd": "true", "changes": "false"}},
        {"type": "run", "params": {"cmd": "false"}}
    ]))
    .unwrap();

    let execution = t
        .engine
        .coordinator
        .run(RunRequest::new(ids(&["h1", "h2", "h3", "h2", "h1"]), manifest))
        .await;
    assert_eq!(execution.results.len(), 3);
    assert_eq!(execution.status, ExecutionStatus::Failed);
    for result in &execution.results {
        let s = result.stats;
        assert_eq!(s.ok + s.changed + s.failed + s.skipped, 3);
        assert_eq!(s.failed, 1);
    }
}

#[tokio::test]
async fn stream_delivers_every_line_and_one_complete() {
    let t = engine_with_hosts(&["h1", "h2"], None).await;
    let manifest = Manifest::from_value(serde_json::json!([
        {"type": "run", "params": {"cmd": "for i in $(seq 1 20); do echo line $i; done"}}
    ]))
    .unwrap();
    let request = RunRequest::new(ids(&["h1", "h2"]), manifest);

    let reader = tokio::spawn(drain(t.engine.hub.subscribe(&request.exec_id)));
    // Never read while the run is in flight.
    let idle = t.engine.hub.subscribe(&request.exec_id);

    let execution = t.engine.coordinator.run(request).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let events = reader.await.unwrap();
    let outputs = events.iter().filter(|e| e.kind == StreamEventKind::Output).count();
    assert_eq!(outputs, 40);
    let completes: Vec<_> = events.iter().filter(|e| e.is_complete()).collect();
    assert_eq!(completes.len(), 1);
    assert_eq!(completes[0].data, "completed");
    assert!(events.last().unwrap().is_complete());

    let idle_events = tokio::time::timeout(Duration::from_secs(5), drain(idle))
        .await
        .unwrap();
    assert_eq!(idle_events.iter().filter(|e| e.is_complete()).count(), 1);

    // Late subscribers still learn how it ended.
    let late = drain(t.engine.hub.subscribe(&execution.id)).await;
    assert_eq!(late.len(), 1);
    assert!(late[0].is_complete());
}

#[tokio::test]
async fn second_mkdir_with_creates_is_skipped() {
    let t = engine_with_hosts(&["h1"], None).await;
    let dir = t.dir.path().join("d");
    let dir = dir.to_string_lossy();
    let mkdir = serde_json::json!({"type": "mkdir", "params": {"path": dir}, "options": {"creates": dir}});
    let manifest = Manifest::from_value(serde_json::json!([mkdir.clone(), mkdir])).unwrap();

    let execution = t.engine.coordinator.run(RunRequest::new(ids(&["h1"]), manifest)).await;
    let s = execution.results[0].stats;
    assert_eq!((s.ok, s.changed, s.failed, s.skipped), (0, 1, 0, 1));
    assert_eq!(execution.results[0].outcomes[0].status, TaskStatus::Changed);
    assert_eq!(execution.results[0].outcomes[1].status, TaskStatus::Skipped);
    assert!(t.dir.path().join("d").is_dir());
}

#[tokio::test]
async fn each_host_registers_its_own_capture() {
    let t = engine_with_connector(&["h1", "h2", "h3"], Arc::new(NamedHostConnector), None).await;
    let manifest = Manifest::from_value(serde_json::json!([
        {"type": "capture", "params": {"cmd": "hostname"}, "options": {"register": "h"}}
    ]))
    .unwrap();

    let execution = t
        .engine
        .coordinator
        .run(RunRequest::new(ids(&["h1", "h2", "h3"]), manifest))
        .await;
    assert_eq!(execution.results.len(), 3);
    let mut seen = std::collections::HashSet::new();
    for result in &execution.results {
        assert_eq!(result.registered["h"], result.host_id);
        assert!(seen.insert(result.registered["h"].clone()));
    }
}

#[tokio::test]
async fn stream_keeps_line_order_per_host() {
    let t = engine_with_hosts(&["h1", "h2"], None).await;
    let manifest = Manifest::from_value(serde_json::json!([
        {"type": "run", "params": {"cmd": "printf 'a\\nb\\nc\\n'"}}
    ]))
    .unwrap();
    let request = RunRequest::new(ids(&["h1", "h2"]), manifest);
    let reader = tokio::spawn(drain(t.engine.hub.subscribe(&request.exec_id)));

    t.engine.coordinator.run(request).await;
    let events = reader.await.unwrap();
    for host in ["h1", "h2"] {
        let lines: Vec<&str> = events
            .iter()
            .filter(|e| e.kind == StreamEventKind::Output && e.machine_id == host)
            .map(|e| e.data.as_str())
            .collect();
        assert_eq!(lines, ["a", "b", "c"], "host {host}");
    }
    assert_eq!(events.iter().filter(|e| e.is_complete()).count(), 1);
    assert!(events.last().unwrap().is_complete());
}

#[tokio::test]
async fn history_is_written_per_host() {
    let db = DuckDBService::in_memory().unwrap();
    let pool = db.pool();
    let t = engine_with_hosts(&["h1", "h2"], Some(db)).await;
    let manifest = Manifest::from_value(serde_json::json!([
        {"type": "run", "params": {"cmd": "echo recorded"}}
    ]))
    .unwrap();
    let execution = t.engine.coordinator.run(RunRequest::new(ids(&["h1", "h2"]), manifest)).await;

    let rows = history_service::get_history_for_execution(pool, execution.id.clone())
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.status == "success" && r.output.contains("recorded")));
}

#[derive(Default)]
struct Captured(Mutex<Vec<Notification>>);

#[async_trait]
impl NotificationDispatcher for Captured {
    async fn dispatch(&self, notification: &Notification) -> Result<(), NotificationError> {
        self.0.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

#[tokio::test]
async fn scheduled_job_times_out_and_notifies() {
    let t = engine_with_hosts(&["h1"], None).await;
    let script = t.dir.path().join("slow.sh");
    std::fs::write(&script, "#!/bin/sh\nsleep 10\n").unwrap();

    let notes = Arc::new(Captured::default());
    let scheduler = Arc::new(Scheduler::new(
        t.engine.coordinator.clone(),
        t.engine.hosts.clone(),
        notes.clone(),
        None,
        SchedulerConfig {
            minute: Duration::from_millis(100),
            ..Default::default()
        },
    ));
    let mut input = JobInput::new("slow", "0 0 0 1 1 *", script.to_string_lossy()).on_hosts(["h1"]);
    input.timeout_mins = 2;
    input.notify_on_fail = true;
    let job = scheduler.create(input).await.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), scheduler.fire(&job.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, JobRunStatus::Failed);

    let job = scheduler.get(&job.id).await.unwrap();
    assert_eq!(job.fail_count, 1);
    assert_eq!(job.last_error.as_deref(), Some("h1-name: timeout: job exceeded 2 minute(s)"));
    assert!(job.next_run.unwrap() > job.last_run.unwrap());

    let notes = notes.0.lock().unwrap();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].message.contains("timeout: job exceeded 2 minute(s)"));
}
