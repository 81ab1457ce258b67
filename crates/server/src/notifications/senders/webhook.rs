use async_trait::async_trait;
use reqwest::{header, Client};
use std::time::Duration;
use tera::{Context, Tera};

use super::{NotificationDispatcher, NotificationError};
use crate::notifications::Notification;

const DEFAULT_BODY_TEMPLATE: &str = r#"{"text": {{ text | json_encode() }}, "job_id": {{ job_id | json_encode() }}, "status": {{ status | json_encode() }}, "hosts_total": {{ hosts_total }}, "hosts_failed": {{ hosts_failed }}}"#;

/// POSTs a Tera-rendered JSON body to a fixed URL.
pub struct WebhookDispatcher {
    client: Client,
    url: String,
    body_template: String,
}

impl WebhookDispatcher {
    pub fn new(url: impl Into<String>, body_template: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            url: url.into(),
            body_template: body_template.unwrap_or_else(|| DEFAULT_BODY_TEMPLATE.to_string()),
        }
    }

    pub fn render(&self, notification: &Notification) -> Result<String, NotificationError> {
        let mut tera_context = Context::new();
        for (key, value) in notification.context() {
            tera_context.insert(key, &value);
        }
        Tera::one_off(&self.body_template, &tera_context, false)
            .map_err(|e| NotificationError::TemplatingError(e.to_string()))
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookDispatcher {
    async fn dispatch(&self, notification: &Notification) -> Result<(), NotificationError> {
        let body = self.render(notification)?;
        let response = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(NotificationError::SendFailed(format!(
                "Webhook returned non-success status: {status}. Body: {error_body}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification() -> Notification {
        Notification {
            job_id: "j1".into(),
            job_name: "backup".into(),
            status: "failed".into(),
            message: "1 of 2 hosts failed".into(),
            hosts_total: 2,
            hosts_failed: 1,
        }
    }

    #[test]
    fn default_template_renders_json() {
        let dispatcher = WebhookDispatcher::new("http://127.0.0.1:9/hook", None);
        let body = dispatcher.render(&notification()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["hosts_failed"], 1);
        assert_eq!(value["text"], "[FleetWarden] job 'backup' failed: 1 of 2 hosts failed");
    }

    #[test]
    fn custom_template_is_used() {
        let dispatcher = WebhookDispatcher::new("http://127.0.0.1:9/hook", Some("{{ job_name }}={{ status }}".into()));
        assert_eq!(dispatcher.render(&notification()).unwrap(), "backup=failed");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_error() {
        let dispatcher = WebhookDispatcher::new("http://127.0.0.1:9/hook", None);
        assert!(dispatcher.dispatch(&notification()).await.is_err());
    }
}
