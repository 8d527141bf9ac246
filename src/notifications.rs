use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Receiver of fetch failure alerts.
///
/// Delivery is best-effort: callers log and drop returned errors.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify_fetch_failure(&self, target_key: &str, error_type: &str) -> Result<()>;
}

/// Notification service for sending alerts
pub struct NotificationService {
    client: Client,
    webhook: Option<WebhookNotifier>,
}

impl NotificationService {
    /// `webhook_url` of `None` (or empty) disables alerting
    pub fn new(client: Client, webhook_url: Option<&str>) -> Self {
        let webhook = webhook_url
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(|url| WebhookNotifier::new(url.to_string()));

        Self { client, webhook }
    }

    pub fn is_enabled(&self) -> bool {
        self.webhook.is_some()
    }
}

#[async_trait]
impl AlertSink for NotificationService {
    async fn notify_fetch_failure(&self, target_key: &str, error_type: &str) -> Result<()> {
        let Some(ref webhook) = self.webhook else {
            debug!(key = target_key, error_type, "Alerting disabled, dropping alert");
            return Ok(());
        };

        let payload = AlertPayload {
            id: target_key.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            error_type: error_type.to_string(),
        };

        webhook.send(&self.client, &payload).await
    }
}

/// Generic JSON webhook
struct WebhookNotifier {
    webhook_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AlertPayload {
    /// `<appId>-<country>`
    id: String,
    timestamp: String,
    error_type: String,
}

impl WebhookNotifier {
    fn new(webhook_url: String) -> Self {
        Self { webhook_url }
    }

    async fn send(&self, client: &Client, payload: &AlertPayload) -> Result<()> {
        debug!(id = %payload.id, "Sending alert webhook");

        let response = client
            .post(&self.webhook_url)
            .timeout(WEBHOOK_TIMEOUT)
            .json(payload)
            .send()
            .await
            .context("Failed to send alert webhook")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Alert webhook failed");
            anyhow::bail!("Alert webhook returned error: {} - {}", status, body);
        }

        info!(id = %payload.id, error_type = %payload.error_type, "Alert webhook sent");
        Ok(())
    }
}
