//! Storage seams.
//!
//! The engine talks to three stores through traits so the same pipeline runs
//! against Redis in production and against [`memory::MemoryStore`] in tests:
//!
//! - [`ShipmentStore`]: the local record store (shipments, audit events,
//!   webhook log, reconciliation runs, job locks)
//! - [`IdempotencyStore`]: atomic check-and-set of processed event keys
//! - [`DeadLetterStore`]: durable dead-letter items with retention

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::dlq::DeadLetterItem;
use crate::shipment::{ReconciliationRun, ShipmentEvent, ShipmentRecord};

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Errors that can occur when talking to a store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis connection error: {0}")]
    ConnectionError(String),

    #[error("Redis command error: {0}")]
    RedisError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Raw webhook audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookLogEntry {
    pub id: String,
    pub provider: String,
    pub event_type: String,
    pub reference_number: Option<String>,
    pub received_at: DateTime<Utc>,
    pub raw: String,
}

/// Webhook volume over a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookStats {
    pub total: u64,
    pub failed: u64,
}

impl WebhookStats {
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        }
    }
}

/// The local record store.
#[async_trait]
pub trait ShipmentStore: Send + Sync {
    async fn find_by_reference(&self, reference: &str)
        -> Result<Option<ShipmentRecord>, StoreError>;

    /// Insert a new record and its first audit event in one atomic write.
    /// Returns `false`, writing nothing, if a record already exists for the
    /// reference number.
    async fn insert_shipment_with_event(
        &self,
        record: &ShipmentRecord,
        event: &ShipmentEvent,
    ) -> Result<bool, StoreError>;

    /// Compare-and-swap update plus audit event in one atomic write: succeeds
    /// only while the stored version still equals `record.version`, and bumps
    /// it. Returns `false`, writing nothing, on conflict.
    async fn update_shipment_with_event(
        &self,
        record: &ShipmentRecord,
        event: &ShipmentEvent,
    ) -> Result<bool, StoreError>;

    async fn list_events(&self, reference: &str) -> Result<Vec<ShipmentEvent>, StoreError>;

    async fn append_webhook_log(&self, entry: &WebhookLogEntry) -> Result<(), StoreError>;

    async fn record_webhook_outcome(
        &self,
        at: DateTime<Utc>,
        failed: bool,
    ) -> Result<(), StoreError>;

    async fn webhook_stats(&self, since: DateTime<Utc>) -> Result<WebhookStats, StoreError>;

    async fn save_reconciliation_run(&self, run: &ReconciliationRun) -> Result<(), StoreError>;

    async fn latest_reconciliation_run(&self) -> Result<Option<ReconciliationRun>, StoreError>;

    /// Take a named lock if nobody holds it. Returns `false` when held.
    async fn acquire_lock(&self, name: &str, holder: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Release a lock, but only if `holder` still owns it.
    async fn release_lock(&self, name: &str, holder: &str) -> Result<(), StoreError>;
}

/// Processed-event keys with a time-to-live.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically claim `key`. Returns `false` if it already exists.
    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Mark `key` as applied for `ttl`.
    async fn commit(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Drop a claim so a later delivery can try again.
    async fn release(&self, key: &str) -> Result<(), StoreError>;
}

/// Durable dead-letter items keyed by id.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Insert or replace an item, expiring it after `retention`.
    async fn put(&self, item: &DeadLetterItem, retention: Duration) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<DeadLetterItem>, StoreError>;

    async fn list(&self) -> Result<Vec<DeadLetterItem>, StoreError>;

    async fn remove(&self, id: &str) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_rate() {
        assert_eq!(WebhookStats::default().failure_rate(), 0.0);
        let stats = WebhookStats { total: 8, failed: 2 };
        assert!((stats.failure_rate() - 0.25).abs() < f64::EPSILON);
    }
}
