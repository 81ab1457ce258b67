//! Outbound notifications for scheduled job outcomes.

pub mod senders;

use serde::Serialize;
use std::collections::HashMap;

pub use senders::{LogDispatcher, NotificationDispatcher, NotificationError, WebhookDispatcher};

/// One job outcome worth telling someone about.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub job_id: String,
    pub job_name: String,
    /// `success` or `failed`.
    pub status: String,
    pub message: String,
    pub hosts_total: usize,
    pub hosts_failed: usize,
}

impl Notification {
    pub fn subject(&self) -> String {
        format!("[FleetWarden] job '{}' {}", self.job_name, self.status)
    }

    /// Flat key/value view used for template rendering.
    pub fn context(&self) -> HashMap<String, String> {
        HashMap::from([
            ("job_id".to_string(), self.job_id.clone()),
            ("job_name".to_string(), self.job_name.clone()),
            ("status".to_string(), self.status.clone()),
            ("message".to_string(), self.message.clone()),
            ("subject".to_string(), self.subject()),
            ("text".to_string(), format!("{}: {}", self.subject(), self.message)),
            ("hosts_total".to_string(), self.hosts_total.to_string()),
            ("hosts_failed".to_string(), self.hosts_failed.to_string()),
        ])
    }
}
