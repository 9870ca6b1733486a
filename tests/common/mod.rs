//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower::ServiceExt;

use loadsync::context::Stores;
use loadsync::notify::MemoryNotifier;
use loadsync::shipment::{ReconciliationRun, ShipmentEvent, ShipmentRecord};
use loadsync::store::{MemoryStore, ShipmentStore, StoreError, WebhookLogEntry, WebhookStats};
use loadsync::upstream::{Upstream, UpstreamError, UpstreamLoad, UpstreamPage};
use loadsync::{SyncConfig, SyncContext};

pub const ADMIN_TOKEN: &str = "admin-token";
pub const CRON_SECRET: &str = "cron-secret";

pub fn config() -> SyncConfig {
    config_with("")
}

/// Base configuration plus extra TOML sections.
pub fn config_with(extra: &str) -> SyncConfig {
    let toml = format!(
        r#"
        [server]
        admin_token = "{ADMIN_TOKEN}"
        cron_secret = "{CRON_SECRET}"

        [upstream]
        base_url = "http://tms.invalid"
        client_id = "id"
        client_secret = "secret"
        page_delay_ms = 0
        {extra}
        "#
    );
    SyncConfig::from_toml(&toml).unwrap()
}

/// Upstream serving a fixed list of loads, page by page.
#[derive(Default)]
pub struct PagedUpstream {
    loads: Mutex<Vec<UpstreamLoad>>,
}

impl PagedUpstream {
    pub fn new(loads: Vec<UpstreamLoad>) -> Self {
        Self {
            loads: Mutex::new(loads),
        }
    }

    pub async fn set_status(&self, reference: &str, status: &str) {
        let mut loads = self.loads.lock().await;
        if let Some(load) = loads.iter_mut().find(|l| l.reference_number == reference) {
            load.status = Some(status.to_string());
        }
    }
}

#[async_trait]
impl Upstream for PagedUpstream {
    async fn fetch_page(&self, page: u32, page_size: u32) -> Result<UpstreamPage, UpstreamError> {
        let loads = self.loads.lock().await;
        let start = ((page.saturating_sub(1)) * page_size) as usize;
        let end = (start + page_size as usize).min(loads.len());
        let slice = loads.get(start..end).unwrap_or_default().to_vec();
        Ok(UpstreamPage {
            loads: slice,
            more_available: end < loads.len(),
        })
    }
}

/// `count` loads with equipment, references `LOAD-0001..`.
pub fn loads(count: usize, status: &str) -> Vec<UpstreamLoad> {
    (1..=count)
        .map(|i| {
            UpstreamLoad::new(format!("LOAD-{i:04}"))
                .with_status(status)
                .with_container(format!("MSCU{i:07}"))
        })
        .collect()
}

/// Shipment store whose reads can be switched to fail, and whose next
/// record write can be made to fail once.
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    failing: AtomicBool,
    fail_next_write: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            fail_next_write: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    fn write_fault(&self) -> Result<(), StoreError> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("write timed out".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ShipmentStore for FlakyStore {
    async fn find_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<ShipmentRecord>, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("database offline".to_string()));
        }
        self.inner.find_by_reference(reference).await
    }

    async fn insert_shipment_with_event(
        &self,
        record: &ShipmentRecord,
        event: &ShipmentEvent,
    ) -> Result<bool, StoreError> {
        self.write_fault()?;
        self.inner.insert_shipment_with_event(record, event).await
    }

    async fn update_shipment_with_event(
        &self,
        record: &ShipmentRecord,
        event: &ShipmentEvent,
    ) -> Result<bool, StoreError> {
        self.write_fault()?;
        self.inner.update_shipment_with_event(record, event).await
    }

    async fn list_events(&self, reference: &str) -> Result<Vec<ShipmentEvent>, StoreError> {
        self.inner.list_events(reference).await
    }

    async fn append_webhook_log(&self, entry: &WebhookLogEntry) -> Result<(), StoreError> {
        self.inner.append_webhook_log(entry).await
    }

    async fn record_webhook_outcome(
        &self,
        at: DateTime<Utc>,
        failed: bool,
    ) -> Result<(), StoreError> {
        self.inner.record_webhook_outcome(at, failed).await
    }

    async fn webhook_stats(&self, since: DateTime<Utc>) -> Result<WebhookStats, StoreError> {
        self.inner.webhook_stats(since).await
    }

    async fn save_reconciliation_run(&self, run: &ReconciliationRun) -> Result<(), StoreError> {
        self.inner.save_reconciliation_run(run).await
    }

    async fn latest_reconciliation_run(&self) -> Result<Option<ReconciliationRun>, StoreError> {
        self.inner.latest_reconciliation_run().await
    }

    async fn acquire_lock(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.inner.acquire_lock(name, holder, ttl).await
    }

    async fn release_lock(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        self.inner.release_lock(name, holder).await
    }
}

pub struct TestApp {
    pub app: axum::Router,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<MemoryNotifier>,
}

pub fn app(config: SyncConfig, upstream: Arc<dyn Upstream>) -> TestApp {
    let (ctx, store, notifier) = SyncContext::in_memory(config, upstream);
    TestApp {
        app: loadsync::server::build_app(Arc::new(ctx)),
        store,
        notifier,
    }
}

/// App whose shipment reads go through a [`FlakyStore`].
pub fn flaky_app(config: SyncConfig) -> (TestApp, Arc<FlakyStore>) {
    let store = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(store.clone()));
    let notifier = Arc::new(MemoryNotifier::new());
    let stores = Stores {
        shipments: flaky.clone(),
        idempotency: store.clone(),
        dead_letters: store.clone(),
    };
    let ctx = SyncContext::assemble(
        config,
        stores,
        Arc::new(PagedUpstream::default()),
        notifier.clone(),
    );
    let app = TestApp {
        app: loadsync::server::build_app(Arc::new(ctx)),
        store,
        notifier,
    };
    (app, flaky)
}

pub async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

pub fn webhook(body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/webhooks/tms")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn authorized(method: Method, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

pub fn created_body(reference: &str) -> String {
    format!(
        r#"{{ "event_type": "load.created", "occurred_at": "2025-03-07T10:00:00Z",
              "data": {{ "reference_number": "{reference}", "status": "Tendered",
                         "container_number": "MSCU7654321" }} }}"#
    )
}

pub fn status_body(reference: &str, status: &str, occurred_at: &str) -> String {
    format!(
        r#"{{ "event_type": "load.status_updated", "occurred_at": "{occurred_at}",
              "data": {{ "reference_number": "{reference}", "status": "{status}" }} }}"#
    )
}
