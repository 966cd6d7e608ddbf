//! Run notifications
//!
//! Delivery is best effort: callers log a failed notification and move on.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("notification endpoint returned status {0}")]
    Rejected(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub subject: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn success(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Success,
            subject: subject.into(),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn failure(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Failure,
            subject: subject.into(),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log. Used when no webhook is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        match notification.level {
            NotificationLevel::Success => {
                info!(subject = %notification.subject, "{}", notification.body)
            }
            NotificationLevel::Failure => {
                error!(subject = %notification.subject, "{}", notification.body)
            }
        }
        Ok(())
    }
}

/// POSTs each notification as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(notification).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        let notifier = LogNotifier;
        notifier
            .notify(&Notification::success("ETL complete", "3 records"))
            .await
            .unwrap();
        notifier
            .notify(&Notification::failure("ETL failed", "store offline"))
            .await
            .unwrap();
    }

    #[test]
    fn test_notification_json_shape() {
        let json = serde_json::to_value(Notification::failure("s", "b")).unwrap();
        assert_eq!(json["level"], "failure");
        assert_eq!(json["subject"], "s");
        assert!(json.get("timestamp").is_some());
    }

    #[tokio::test]
    async fn test_webhook_to_closed_port_is_transport_error() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:1/hook").unwrap();
        let err = notifier
            .notify(&Notification::success("s", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Transport(_)));
    }
}
