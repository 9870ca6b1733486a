//! Upstream Client - paginated read access to the TMS.
//!
//! [`UpstreamClient`] authenticates with client credentials, caches the
//! access token until shortly before expiry, spaces requests to respect the
//! TMS's rate limits and pages through loads. Every request carries a finite
//! timeout; a `401` triggers exactly one token refresh and one retry.
//!
//! # Example
//!
//! ```rust,ignore
//! use loadsync::upstream::{Upstream, UpstreamClient};
//!
//! let client = UpstreamClient::new(&config.upstream)?;
//! let page = client.fetch_page(1, 100).await?;
//! for load in page.loads {
//!     println!("{}", load.reference_number);
//! }
//! ```

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::UpstreamConfig;

/// Refresh the token this long before the TMS says it expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Errors returned by the upstream client.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited by upstream (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode upstream response: {0}")]
    Decode(String),
}

/// A load as the TMS represents it.
///
/// The same shape is used for `load.created` webhook payloads, so the
/// creation path and the reconciliation path build records from one type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamLoad {
    #[serde(alias = "referenceNumber")]
    pub reference_number: String,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default, alias = "containerNumber")]
    pub container_number: Option<String>,

    #[serde(default, alias = "equipmentType")]
    pub equipment_type: Option<String>,

    #[serde(default, alias = "sealNumber")]
    pub seal_number: Option<String>,

    #[serde(default)]
    pub origin: Option<String>,

    #[serde(default)]
    pub destination: Option<String>,

    #[serde(default, alias = "pickupDate")]
    pub pickup_date: Option<String>,

    #[serde(default, alias = "deliveryDate")]
    pub delivery_date: Option<String>,

    #[serde(default, alias = "currentLocation")]
    pub current_location: Option<String>,

    #[serde(default, alias = "tenderStatus")]
    pub tender_status: Option<String>,
}

impl UpstreamLoad {
    pub fn new(reference_number: impl Into<String>) -> Self {
        Self {
            reference_number: reference_number.into(),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_container(mut self, container_number: impl Into<String>) -> Self {
        self.container_number = Some(container_number.into());
        self
    }

    /// True when the load carries a non-empty container/equipment identifier.
    pub fn has_equipment(&self) -> bool {
        self.container_number
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }
}

/// One page of loads.
#[derive(Debug, Clone, Default)]
pub struct UpstreamPage {
    pub loads: Vec<UpstreamLoad>,
    pub more_available: bool,
}

/// Read access to the TMS, abstracted for the reconciliation job.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Fetch one page (1-based) of loads.
    async fn fetch_page(&self, page: u32, page_size: u32) -> Result<UpstreamPage, UpstreamError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
struct PageResponse {
    #[serde(default)]
    loads: Vec<UpstreamLoad>,
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    #[serde(default, rename = "moreAvailable")]
    more_available: bool,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

/// HTTP implementation of [`Upstream`].
#[derive(Debug)]
pub struct UpstreamClient {
    client: Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    min_request_interval: Duration,
    token: Mutex<Option<AccessToken>>,
    last_request: Mutex<Option<Instant>>,
}

impl UpstreamClient {
    /// Build a client from validated configuration.
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            min_request_interval: Duration::from_millis(config.min_request_interval_ms),
            token: Mutex::new(None),
            last_request: Mutex::new(None),
        })
    }

    /// Return a cached token, refreshing it when missing or near expiry.
    async fn access_token(&self) -> Result<String, UpstreamError> {
        let mut guard = self.token.lock().await;

        if let Some(token) = guard.as_ref() {
            if Instant::now() + TOKEN_EXPIRY_MARGIN < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let token = self.request_token().await?;
        let value = token.value.clone();
        *guard = Some(token);
        Ok(value)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn request_token(&self) -> Result<AccessToken, UpstreamError> {
        self.pace().await;

        let url = format!("{}/oauth/token", self.base_url);
        debug!(url = %url, "Requesting upstream access token");

        let response = self
            .client
            .post(&url)
            .json(&json!({
                "grant_type": "client_credentials",
                "client_id": self.client_id,
                "client_secret": self.client_secret,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Upstream token request rejected");
            return Err(UpstreamError::Auth(format!("token endpoint returned {status}: {body}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;

        info!(expires_in = token.expires_in, "Obtained upstream access token");

        Ok(AccessToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }

    /// Space consecutive requests by the configured minimum interval.
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_request_interval {
                tokio::time::sleep(self.min_request_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn send_page_request(
        &self,
        token: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Response, UpstreamError> {
        self.pace().await;

        let url = format!("{}/loads", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(&[("page", page), ("pageSize", page_size)])
            .send()
            .await?;

        Ok(response)
    }

    async fn parse_page(response: Response) -> Result<UpstreamPage, UpstreamError> {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(UpstreamError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let page: PageResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;

        Ok(UpstreamPage {
            loads: page.loads,
            more_available: page.pagination.more_available,
        })
    }
}

#[async_trait]
impl Upstream for UpstreamClient {
    async fn fetch_page(&self, page: u32, page_size: u32) -> Result<UpstreamPage, UpstreamError> {
        let token = self.access_token().await?;
        let mut response = self.send_page_request(&token, page, page_size).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(page = page, "Upstream rejected access token, refreshing once");
            self.invalidate_token().await;
            let token = self.access_token().await?;
            response = self.send_page_request(&token, page, page_size).await?;
        }

        let result = Self::parse_page(response).await?;

        debug!(
            page = page,
            loads = result.loads.len(),
            more_available = result.more_available,
            "Fetched upstream page"
        );

        Ok(result)
    }
}
