//! Live fan-out of execution and log-session output.

pub mod hub;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use hub::{StreamHub, Subscription, SUBSCRIBER_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEventKind {
    Output,
    Status,
    Error,
    Complete,
}

impl StreamEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEventKind::Output => "output",
            StreamEventKind::Status => "status",
            StreamEventKind::Error => "error",
            StreamEventKind::Complete => "complete",
        }
    }
}

/// One event on an execution or log-session stream. `machine_id` and
/// `machine` are empty on the final `complete` event of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: StreamEventKind,
    pub machine_id: String,
    pub machine: String,
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    pub fn new(
        kind: StreamEventKind,
        machine_id: impl Into<String>,
        machine: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            machine_id: machine_id.into(),
            machine: machine.into(),
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn output(machine_id: &str, machine: &str, data: impl Into<String>) -> Self {
        Self::new(StreamEventKind::Output, machine_id, machine, data)
    }

    pub fn status(machine_id: &str, machine: &str, data: impl Into<String>) -> Self {
        Self::new(StreamEventKind::Status, machine_id, machine, data)
    }

    pub fn error(machine_id: &str, machine: &str, data: impl Into<String>) -> Self {
        Self::new(StreamEventKind::Error, machine_id, machine, data)
    }

    pub fn complete(data: impl Into<String>) -> Self {
        Self::new(StreamEventKind::Complete, "", "", data)
    }

    pub fn is_complete(&self) -> bool {
        self.kind == StreamEventKind::Complete
    }
}
