//! Alert notifiers.
//!
//! The engine raises an [`Alert`] when reconciliation finds too much drift,
//! when a reconciliation run fails, and when the dead-letter backlog grows.
//! Delivery goes through the [`Notifier`] trait:
//!
//! - [`LogNotifier`]: structured `tracing` output (the default)
//! - [`WebhookNotifier`]: JSON POST to `alerts.webhook_url`, retried on 5xx
//!
//! Alert delivery never fails the operation that raised it; see [`raise`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::AlertsConfig;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("alert delivery failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ReconciliationDrift,
    ReconciliationFailed,
    /// A run spent its budget before covering every load
    ReconciliationTimedOut,
    DeadLetterBacklog,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::ReconciliationDrift => "reconciliation_drift",
            AlertKind::ReconciliationFailed => "reconciliation_failed",
            AlertKind::ReconciliationTimedOut => "reconciliation_timed_out",
            AlertKind::DeadLetterBacklog => "dead_letter_backlog",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    /// Structured context (counts, run id, thresholds)
    pub details: Value,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, message: impl Into<String>, details: Value) -> Self {
        Self {
            kind,
            message: message.into(),
            details,
            raised_at: Utc::now(),
        }
    }
}

/// Delivers alerts to operators.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Deliver an alert, logging instead of failing when delivery breaks.
pub async fn raise(notifier: &dyn Notifier, alert: Alert) {
    if let Err(e) = notifier.notify(&alert).await {
        error!(
            notifier = %notifier.name(),
            kind = %alert.kind.as_str(),
            error = %e,
            "Failed to deliver alert"
        );
    }
}

/// Pick the notifier the configuration asks for.
pub fn from_config(config: &AlertsConfig) -> Result<Arc<dyn Notifier>, NotifyError> {
    match &config.webhook_url {
        Some(url) => Ok(Arc::new(
            WebhookNotifier::new(url)?
                .with_timeout(Duration::from_millis(config.timeout_ms))
                .with_retries(config.retries),
        )),
        None => Ok(Arc::new(LogNotifier::new())),
    }
}

/// Logs alerts at warn level.
#[derive(Debug, Clone)]
pub struct LogNotifier {
    prefix: String,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self {
            prefix: "alert".to_string(),
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        warn!(
            prefix = %self.prefix,
            kind = %alert.kind.as_str(),
            details = %alert.details,
            "[{}] {}",
            self.prefix,
            alert.message
        );
        Ok(())
    }
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RETRIES: u32 = 2;

/// POSTs alerts as JSON to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,

    /// Reused for connection pooling
    client: Client,

    timeout: Duration,

    /// Extra attempts after a 5xx or transport error
    retries: u32,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        Ok(Self {
            url: url.into(),
            client: Client::builder().build()?,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    fn build_payload(alert: &Alert) -> Value {
        json!({
            "kind": alert.kind,
            "message": alert.message,
            "details": alert.details,
            "raisedAt": alert.raised_at,
        })
    }

    async fn send_request(&self, payload: &Value) -> Result<(), NotifyError> {
        let mut last_error = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                debug!(attempt, max_retries = self.retries, "Retrying alert delivery");
            }

            match self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .json(payload)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(());
                    }

                    if status.is_client_error() {
                        warn!(status = %status, url = %self.url, "Alert endpoint returned client error");
                        return Err(NotifyError::Failed(format!("endpoint returned {status}")));
                    }

                    warn!(
                        status = %status,
                        url = %self.url,
                        attempt,
                        "Alert endpoint returned server error"
                    );
                    last_error = Some(NotifyError::Failed(format!("server error: {status}")));
                }
                Err(e) => {
                    warn!(error = %e, url = %self.url, attempt, "Alert request failed");
                    last_error = Some(NotifyError::Http(e));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| NotifyError::Failed("no attempt made".into())))
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        self.send_request(&Self::build_payload(alert)).await?;
        info!(url = %self.url, kind = %alert.kind.as_str(), "Alert delivered");
        Ok(())
    }
}

/// Keeps alerts in memory. Used by tests and local tooling.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    fn name(&self) -> &str {
        "memory"
    }

    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        self.alerts.lock().await.push(alert.clone());
        Ok(())
    }
}
