//! Webhook notifications for backup and retention outcomes.
//!
//! Delivery is best effort: failures are logged and never change the outcome
//! of the run that triggered them.

use crate::config::NotificationConfig;
use crate::manifest::BackupKind;
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub const SERVICE_NAME: &str = "mongodb-backup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Success,
    Failure,
    Info,
}

/// JSON body posted to the webhook.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_type: Option<BackupKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_backups: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freed_bytes: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub host: String,
}

impl NotificationEvent {
    fn new(kind: NotificationType, title: &str) -> Self {
        Self {
            kind,
            title: title.to_string(),
            backup_type: None,
            content_address: None,
            size_bytes: None,
            duration_seconds: None,
            error: None,
            deleted_backups: None,
            freed_bytes: None,
            timestamp: Utc::now(),
            service: SERVICE_NAME.to_string(),
            host: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
        }
    }

    pub fn backup_succeeded(kind: BackupKind, address: &str, size_bytes: u64, duration_seconds: f64) -> Self {
        Self {
            backup_type: Some(kind),
            content_address: Some(address.to_string()),
            size_bytes: Some(size_bytes),
            duration_seconds: Some(duration_seconds),
            ..Self::new(NotificationType::Success, "Backup Completed Successfully")
        }
    }

    pub fn backup_failed(kind: BackupKind, error: &BackupError) -> Self {
        Self {
            backup_type: Some(kind),
            error: Some(error.to_string()),
            ..Self::new(NotificationType::Failure, "Backup Failed")
        }
    }

    pub fn retention_completed(deleted_backups: usize, freed_bytes: u64) -> Self {
        Self {
            deleted_backups: Some(deleted_backups),
            freed_bytes: Some(freed_bytes),
            ..Self::new(NotificationType::Info, "Retention Cleanup Completed")
        }
    }
}

/// Where notification events are delivered.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, event: &NotificationEvent) -> Result<()>;
}

pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| BackupError::NotificationDeliveryFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BackupError::NotificationDeliveryFailed(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Sends events to the configured sink, if any.
#[derive(Clone, Default)]
pub struct Notifier {
    sink: Option<Arc<dyn NotificationSink>>,
}

impl Notifier {
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn with_sink(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn from_config(config: &NotificationConfig) -> Result<Self> {
        match (config.enabled, &config.webhook_url) {
            (true, Some(url)) => Ok(Self::with_sink(Arc::new(WebhookSink::new(
                url.clone(),
                Duration::from_secs(config.timeout_secs),
            )?))),
            _ => Ok(Self::disabled()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Deliver `event`; errors are logged and swallowed.
    pub async fn send(&self, event: NotificationEvent) {
        let Some(sink) = &self.sink else {
            tracing::debug!(title = %event.title, "Notifications disabled");
            return;
        };
        match sink.deliver(&event).await {
            Ok(()) => tracing::debug!(title = %event.title, "Notification sent"),
            Err(e) => tracing::warn!(title = %event.title, error = %e, "Failed to send notification"),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records events instead of delivering them.
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<NotificationEvent>>,
        pub fail: bool,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
            self.events.lock().unwrap().push(event.clone());
            if self.fail {
                return Err(BackupError::NotificationDeliveryFailed("sink down".to_string()));
            }
            Ok(())
        }
    }
}
