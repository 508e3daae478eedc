//! Operational alerting channel.

use std::fmt;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::Result;

/// Severity attached to an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Success,
    #[default]
    Error,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A structured alert: event name, free text, severity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub event_name: String,
    pub message: String,
    pub severity: AlertSeverity,
}

impl Alert {
    pub fn error(event_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            message: message.into(),
            severity: AlertSeverity::Error,
        }
    }
}

/// Destination for operational alerts.
///
/// Callers go through [`AlertChannel::push`], which never fails.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn channel_type(&self) -> &'static str;

    /// Deliver one alert.
    async fn send(&self, alert: &Alert) -> Result<()>;

    /// Best-effort delivery: failures are logged and swallowed.
    async fn push(&self, alert: Alert) {
        if let Err(e) = self.send(&alert).await {
            warn!(
                channel = self.channel_type(),
                event = %alert.event_name,
                error = %e,
                "Failed to deliver alert"
            );
        }
    }
}

/// Used when no alerting endpoint is configured.
#[derive(Debug, Default)]
pub struct NoopAlertChannel;

#[async_trait]
impl AlertChannel for NoopAlertChannel {
    fn channel_type(&self) -> &'static str {
        "noop"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        debug!(event = %alert.event_name, "Alerting disabled; dropping alert");
        Ok(())
    }
}

/// Webhook alert configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAlertConfig {
    /// Webhook URL.
    pub url: String,
    /// HTTP method: `GET` sends the alert as query parameters, anything else
    /// posts it as JSON.
    #[serde(default = "default_method")]
    pub method: String,
    /// Sender name included with every alert.
    #[serde(default = "default_username")]
    pub username: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_username() -> String {
    "job-runner".to_string()
}

fn default_timeout() -> u64 {
    10
}

impl WebhookAlertConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            username: default_username(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Alerts delivered to an incoming webhook.
pub struct WebhookAlertChannel {
    config: WebhookAlertConfig,
    client: Client,
}

impl WebhookAlertChannel {
    pub fn new(config: WebhookAlertConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { config, client }
    }

    fn fields(&self, alert: &Alert) -> [(&'static str, String); 4] {
        [
            ("event_name", alert.event_name.clone()),
            ("message", alert.message.clone()),
            ("status", alert.severity.to_string()),
            ("username", self.config.username.clone()),
        ]
    }
}

#[async_trait]
impl AlertChannel for WebhookAlertChannel {
    fn channel_type(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let fields = self.fields(alert);
        let request = if self.config.method.eq_ignore_ascii_case("GET") {
            self.client.get(&self.config.url).query(&fields)
        } else {
            let body: serde_json::Map<String, serde_json::Value> = fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), json!(v)))
                .collect();
            self.client.post(&self.config.url).json(&body)
        };

        let response = request
            .send()
            .await
            .map_err(|e| crate::Error::Other(format!("Alert webhook request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(crate::Error::Other(format!(
                "Alert webhook failed: {} - {}",
                status, body
            )));
        }

        debug!(event = %alert.event_name, "Alert sent");
        Ok(())
    }
}
