//! Webhook notifier.
//!
//! Posts the run summary to an HTTP endpoint. When the run produced a
//! report archive it is uploaded alongside the summary as a multipart form.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Notification, NotificationFailure, Notifier};

/// Configuration for the webhook notifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_timeout() -> u64 {
    30
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_seconds: default_timeout(),
        }
    }
}

/// HTTP webhook client
pub struct WebhookNotifier {
    url: String,
    timeout: Duration,
    /// HTTP client
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            url: config.url,
            timeout: Duration::from_secs(config.timeout_seconds),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Multipart form with the summary and, if readable, the report archive
    async fn form(&self, notification: &Notification) -> Result<Form, NotificationFailure> {
        let summary = serde_json::to_string(&notification.summary)
            .map_err(|e| NotificationFailure::new(self.name(), e.to_string()))?;
        let mut form = Form::new()
            .text("subject", notification.subject.clone())
            .text("summary", summary);

        if let Some(path) = &notification.attachment {
            let file_name = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();

            let bytes = tokio::fs::read(path).await.map_err(|e| {
                NotificationFailure::new(
                    self.name(),
                    format!("cannot read {}: {}", path.display(), e),
                )
            })?;

            let part = Part::bytes(bytes)
                .file_name(file_name)
                .mime_str("application/zip")
                .map_err(|e| NotificationFailure::new(self.name(), e.to_string()))?;
            form = form.part("report", part);
        }

        Ok(form)
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, notification: &Notification) -> Result<(), NotificationFailure> {
        let request = self.client.post(&self.url).timeout(self.timeout);

        let request = if notification.attachment.is_some() {
            request.multipart(self.form(notification).await?)
        } else {
            request.json(&serde_json::json!({
                "subject": notification.subject,
                "success": notification.success,
                "summary": notification.summary,
            }))
        };

        let response = request
            .send()
            .await
            .map_err(|e| NotificationFailure::new(self.name(), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationFailure::new(
                self.name(),
                format!("endpoint answered {}: {}", status, body.trim()),
            ));
        }

        info!(url = %self.url, "Posted run summary");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn notification(attachment: Option<PathBuf>) -> Notification {
        Notification {
            subject: "[rnadeseq] Failed: test".to_string(),
            text: String::new(),
            html: String::new(),
            summary: serde_json::json!({ "success": false }),
            attachment,
            success: false,
        }
    }

    #[test]
    fn test_config_defaults() {
        let config: WebhookConfig =
            serde_yaml::from_str("url: https://hooks.example.org/rnadeseq").unwrap();
        assert_eq!(config.timeout_seconds, 30);
        assert_eq!(
            WebhookNotifier::new(config).url(),
            "https://hooks.example.org/rnadeseq"
        );
    }

    #[tokio::test]
    async fn test_unreadable_attachment_is_a_failure() {
        let notifier = WebhookNotifier::new(WebhookConfig::new("http://127.0.0.1:9/"));
        let err = notifier
            .notify(&notification(Some(PathBuf::from("/does/not/exist/report.zip"))))
            .await
            .unwrap_err();

        assert_eq!(err.channel, "webhook");
        assert!(err.message.contains("report.zip"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_a_failure() {
        let notifier = WebhookNotifier::new(WebhookConfig {
            url: "http://127.0.0.1:9/".to_string(),
            timeout_seconds: 2,
        });
        assert!(notifier.notify(&notification(None)).await.is_err());
    }
}
