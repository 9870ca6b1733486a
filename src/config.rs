//! Configuration module for loadsync.
//!
//! Loads configuration from TOML files with environment variable substitution.
//! The configuration is validated once at process start and then passed into
//! each component's constructor; nothing reads configuration lazily.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 3000
//! webhook_secret = "${TMS_WEBHOOK_SECRET}"
//! cron_secret = "${CRON_SECRET}"
//!
//! [upstream]
//! base_url = "https://tms.example.com/api"
//! client_id = "${TMS_CLIENT_ID}"
//! client_secret = "${TMS_CLIENT_SECRET}"
//!
//! [reconcile]
//! alert_threshold = 20
//! ```

use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SyncConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub dlq: DlqConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,
}

/// Server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared secret for webhook signatures; checks are skipped when unset
    #[serde(default)]
    pub webhook_secret: Option<String>,

    /// Bearer token for scheduler triggers; triggers are rejected when unset
    #[serde(default)]
    pub cron_secret: Option<String>,

    /// Bearer token for admin operations; admin calls are rejected when unset
    #[serde(default)]
    pub admin_token: Option<String>,

    /// Seconds in-flight requests get to finish after a shutdown signal
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            webhook_secret: None,
            cron_secret: None,
            admin_token: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    "loadsync".to_string()
}

/// Upstream TMS API configuration
#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Pause between pages during reconciliation
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Minimum spacing between any two upstream requests
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            page_size: default_page_size(),
            page_delay_ms: default_page_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            min_request_interval_ms: default_min_request_interval_ms(),
        }
    }
}

fn default_page_size() -> u32 {
    100
}

fn default_page_delay_ms() -> u64 {
    500
}

fn default_request_timeout_ms() -> u64 {
    15000
}

fn default_min_request_interval_ms() -> u64 {
    200
}

/// Reconciliation job configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,

    /// Discrepancy count above which the alerting collaborator is notified
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: u64,

    /// Wall-clock budget for one run
    #[serde(default = "default_budget_secs")]
    pub budget_secs: u64,

    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            alert_threshold: default_alert_threshold(),
            budget_secs: default_budget_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
        }
    }
}

impl ReconcileConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.budget_secs)
    }
}

fn default_reconcile_interval_secs() -> u64 {
    4 * 60 * 60
}

fn default_alert_threshold() -> u64 {
    20
}

fn default_budget_secs() -> u64 {
    300
}

fn default_lock_ttl_secs() -> u64 {
    900
}

/// Retry driver configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_retry_interval_secs")]
    pub interval_secs: u64,

    /// Maximum DLQ items retried at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// DLQ size above which the alerting collaborator is notified
    #[serde(default = "default_backlog_alert_threshold")]
    pub backlog_alert_threshold: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_retry_interval_secs(),
            concurrency: default_concurrency(),
            backlog_alert_threshold: default_backlog_alert_threshold(),
        }
    }
}

fn default_retry_interval_secs() -> u64 {
    60
}

fn default_concurrency() -> usize {
    4
}

fn default_backlog_alert_threshold() -> usize {
    25
}

/// Idempotency store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_ttl_secs")]
    pub ttl_secs: u64,

    /// How long an unfinished claim blocks concurrent deliveries
    #[serde(default = "default_in_flight_ttl_secs")]
    pub in_flight_ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_dedup_ttl_secs(),
            in_flight_ttl_secs: default_in_flight_ttl_secs(),
        }
    }
}

fn default_dedup_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_in_flight_ttl_secs() -> u64 {
    300
}

/// Dead letter queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DlqConfig {
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
        }
    }
}

fn default_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

/// Alerting configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AlertsConfig {
    /// Alerts are POSTed here when set; otherwise they are logged
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    10000
}

fn default_retries() -> u32 {
    2
}

impl SyncConfig {
    /// Load configuration from the default path or LOADSYNC_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("LOADSYNC_CONFIG").unwrap_or_else(|_| "config/loadsync.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let config = if path.exists() {
            info!(path = %path.display(), "Loading configuration");
            let content = fs::read_to_string(path)?;
            Self::from_toml(&content)?
        } else {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            Self::default()
        };

        config.validate()?;

        info!(
            port = config.server.port,
            upstream = %config.upstream.base_url,
            signatures = config.server.webhook_secret.is_some(),
            alerts_webhook = config.alerts.webhook_url.is_some(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse TOML text after substituting `${VAR}` placeholders.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);
        debug!("Parsing TOML configuration");
        Ok(toml::from_str(&content)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let upstream = &self.upstream;

        if upstream.base_url.is_empty() {
            return Err(ConfigError::MissingField("upstream.base_url".to_string()));
        }
        validate_url("upstream.base_url", &upstream.base_url)?;

        for (field, value) in [
            ("upstream.client_id", &upstream.client_id),
            ("upstream.client_secret", &upstream.client_secret),
        ] {
            if value.is_empty() {
                return Err(ConfigError::MissingField(field.to_string()));
            }
            if value.contains("${") {
                return Err(ConfigError::ValidationError(format!(
                    "{} contains an unsubstituted environment variable",
                    field
                )));
            }
        }

        if upstream.page_size == 0 {
            return Err(ConfigError::ValidationError(
                "upstream.page_size must be greater than zero".to_string(),
            ));
        }

        if self.retry.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "retry.concurrency must be greater than zero".to_string(),
            ));
        }

        if let Some(url) = &self.alerts.webhook_url {
            validate_url("alerts.webhook_url", url)?;
        }

        for (field, secret) in [
            ("server.webhook_secret", &self.server.webhook_secret),
            ("server.cron_secret", &self.server.cron_secret),
            ("server.admin_token", &self.server.admin_token),
        ] {
            match secret {
                Some(value) if value.contains("${") => {
                    return Err(ConfigError::ValidationError(format!(
                        "{} contains an unsubstituted environment variable",
                        field
                    )));
                }
                None => debug!(field = field, "Secret not configured"),
                _ => {}
            }
        }

        if self.server.cron_secret.is_none() {
            warn!("server.cron_secret not set, scheduled trigger endpoints will reject every request");
        }

        Ok(())
    }
}

fn validate_url(field: &str, url: &str) -> Result<(), ConfigError> {
    if url.contains("${") {
        return Err(ConfigError::ValidationError(format!(
            "{} contains an unsubstituted environment variable",
            field
        )));
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ConfigError::ValidationError(format!(
            "{} must start with http:// or https://",
            field
        )));
    }

    Ok(())
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern is valid")
    })
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    env_var_pattern()
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [upstream]
        base_url = "https://tms.example.com/api"
        client_id = "id"
        client_secret = "secret"
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("LOADSYNC_TEST_VAR", "substituted_value");
        let input = "url = \"${LOADSYNC_TEST_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"substituted_value\"");
        env::remove_var("LOADSYNC_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "url = \"${LOADSYNC_NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"${LOADSYNC_NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = SyncConfig::from_toml(MINIMAL).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.shutdown_grace_secs, 30);
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert_eq!(config.upstream.page_size, 100);
        assert_eq!(config.reconcile.alert_threshold, 20);
        assert_eq!(config.reconcile.budget(), Duration::from_secs(300));
        assert_eq!(config.dlq.retention_secs, 604800);
    }

    #[test]
    fn test_parse_full_sections() {
        let toml = r#"
            [server]
            port = 4000
            webhook_secret = "whsec"
            cron_secret = "cron"

            [upstream]
            base_url = "http://localhost:9000"
            client_id = "id"
            client_secret = "secret"
            page_size = 50

            [retry]
            concurrency = 8

            [alerts]
            webhook_url = "https://hooks.example.com/alerts"
            retries = 3
        "#;

        let config = SyncConfig::from_toml(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.webhook_secret.as_deref(), Some("whsec"));
        assert_eq!(config.upstream.page_size, 50);
        assert_eq!(config.retry.concurrency, 8);
        assert_eq!(config.alerts.retries, 3);
    }

    #[test]
    fn test_default_config_fails_fast() {
        let result = SyncConfig::default().validate();
        assert!(matches!(result, Err(ConfigError::MissingField(field)) if field == "upstream.base_url"));
    }

    #[test]
    fn test_validation_missing_credentials() {
        let toml = r#"
            [upstream]
            base_url = "https://tms.example.com"
            client_id = "id"
        "#;

        let config = SyncConfig::from_toml(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_validation_unsubstituted_secret() {
        let toml = r#"
            [upstream]
            base_url = "https://tms.example.com"
            client_id = "id"
            client_secret = "${LOADSYNC_UNSET_SECRET}"
        "#;

        let config = SyncConfig::from_toml(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_invalid_alert_url() {
        let toml = format!("{MINIMAL}\n[alerts]\nwebhook_url = \"not-a-url\"\n");
        let config = SyncConfig::from_toml(&toml).unwrap();
        assert!(config.validate().is_err());
    }
}
