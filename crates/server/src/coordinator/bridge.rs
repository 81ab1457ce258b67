use std::sync::{Arc, Mutex};

use super::history::truncate_output;
use crate::stream::{StreamEvent, StreamHub};
use crate::tasks::{OutputSink, TaskOutcome, TaskStatus};
use crate::transport::OutputLine;

/// Publishes one host's task output into the hub and keeps a capped copy
/// for the history record.
pub struct StreamBridge {
    hub: Arc<StreamHub>,
    stream_id: String,
    host_id: String,
    host_name: String,
    cap: usize,
    collected: Mutex<String>,
}

impl StreamBridge {
    pub fn new(hub: Arc<StreamHub>, stream_id: &str, host_id: &str, host_name: &str, cap: usize) -> Self {
        Self {
            hub,
            stream_id: stream_id.to_string(),
            host_id: host_id.to_string(),
            host_name: host_name.to_string(),
            cap,
            collected: Mutex::new(String::new()),
        }
    }

    pub fn error(&self, message: &str) {
        self.collect(message);
        self.hub.broadcast(
            &self.stream_id,
            StreamEvent::error(&self.host_id, &self.host_name, message),
        );
    }

    /// Output collected so far, capped.
    pub fn into_output(self) -> String {
        let collected = self
            .collected
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        truncate_output(collected, self.cap)
    }

    fn collect(&self, line: &str) {
        let mut collected = self.collected.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Keep one byte over the cap so truncation still marks the cut.
        if collected.len() <= self.cap {
            collected.push_str(line);
            collected.push('\n');
        }
    }
}

impl OutputSink for StreamBridge {
    fn line(&self, line: &OutputLine) {
        self.collect(&line.line);
        self.hub.broadcast(
            &self.stream_id,
            StreamEvent::output(&self.host_id, &self.host_name, line.line.clone()),
        );
    }

    fn task_finished(&self, outcome: &TaskOutcome) {
        let payload = serde_json::to_string(outcome).unwrap_or_else(|_| outcome.status.as_str().to_string());
        self.hub.broadcast(
            &self.stream_id,
            StreamEvent::status(&self.host_id, &self.host_name, payload),
        );
        if outcome.status == TaskStatus::Failed {
            if let Some(err) = &outcome.error {
                self.error(&format!("{}: {err}", outcome.name));
            }
        }
    }
}
