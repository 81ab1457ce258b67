use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use super::Notification;

pub mod webhook;

pub use webhook::WebhookDispatcher;

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Failed to send notification: {0}")]
    SendFailed(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
    #[error("Templating error: {0}")]
    TemplatingError(String),
}

/// Delivers notifications to some external channel.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// Writes notifications to the log. Used when no channel is configured.
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn dispatch(&self, notification: &Notification) -> Result<(), NotificationError> {
        info!(
            job_id = %notification.job_id,
            status = %notification.status,
            hosts_failed = notification.hosts_failed,
            "{}: {}",
            notification.subject(),
            notification.message
        );
        Ok(())
    }
}
