//! Redis-backed store.
//!
//! Key layout (all under the configured prefix, `loadsync` by default):
//!
//! ```text
//! {prefix}:shipment:{reference}     hash  data=<json> version=<n>
//! {prefix}:events:{reference}       list  ShipmentEvent json, append-only
//! {prefix}:webhooks:log             list  raw webhook log, newest first, capped
//! {prefix}:webhooks:{YYYYMMDDHH}    hash  total / failed counters, 48h TTL
//! {prefix}:reconcile:runs           list  ReconciliationRun json, newest first, capped
//! {prefix}:lock:{name}              string holder, NX + EX
//! {prefix}:idem:{key}               string pending|done, NX + EX
//! {prefix}:dlq:item:{id}            string DeadLetterItem json, EX = retention
//! {prefix}:dlq:index                set   item ids
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use deadpool_redis::redis::{cmd, pipe, RedisError, Script};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use std::time::Duration;
use tracing::{debug, error};

use super::{
    DeadLetterStore, IdempotencyStore, ShipmentStore, StoreError, WebhookLogEntry, WebhookStats,
};
use crate::dlq::DeadLetterItem;
use crate::shipment::{ReconciliationRun, ShipmentEvent, ShipmentRecord};

/// Entries kept in the raw webhook log
const WEBHOOK_LOG_MAX_LEN: isize = 10000;

/// Reconciliation runs kept for observability
const RECONCILE_RUNS_MAX_LEN: isize = 100;

/// Hourly webhook counters outlive the 24h health window
const WEBHOOK_BUCKET_TTL_SECS: u64 = 48 * 60 * 60;

// KEYS: shipment hash, events list. ARGV: record json, version, event json.
const INSERT_SHIPMENT_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'data', ARGV[1], 'version', ARGV[2])
redis.call('RPUSH', KEYS[2], ARGV[3])
return 1
";

// KEYS: shipment hash, events list. ARGV: expected version, record json, next version, event json.
const UPDATE_SHIPMENT_SCRIPT: &str = r"
local current = redis.call('HGET', KEYS[1], 'version')
if (not current) or current ~= ARGV[1] then
    return 0
end
redis.call('HSET', KEYS[1], 'data', ARGV[2], 'version', ARGV[3])
redis.call('RPUSH', KEYS[2], ARGV[4])
return 1
";

const RELEASE_LOCK_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

fn redis_error(e: RedisError) -> StoreError {
    error!(error = %e, "Redis command failed");
    StoreError::RedisError(e.to_string())
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Redis implementation of every storage trait.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    prefix: String,
}

impl RedisStore {
    pub fn new(pool: Pool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    /// Create a connection pool for `url`. No connection is made until first use.
    pub fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::ConnectionError(e.to_string()))?;
        Ok(Self::new(pool, prefix))
    }

    /// Round-trip a PING.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: String = cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(())
    }

    async fn conn(&self) -> Result<Connection, StoreError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection");
            StoreError::ConnectionError(e.to_string())
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn webhook_bucket(&self, at: DateTime<Utc>) -> String {
        self.key(&format!("webhooks:{}", at.format("%Y%m%d%H")))
    }
}

#[async_trait]
impl ShipmentStore for RedisStore {
    async fn find_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<ShipmentRecord>, StoreError> {
        let mut conn = self.conn().await?;
        let data: Option<String> = cmd("HGET")
            .arg(self.key(&format!("shipment:{reference}")))
            .arg("data")
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        data.map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn insert_shipment_with_event(
        &self,
        record: &ShipmentRecord,
        event: &ShipmentEvent,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(record)?;
        let event_json = serde_json::to_string(event)?;

        let inserted: i32 = Script::new(INSERT_SHIPMENT_SCRIPT)
            .key(self.key(&format!("shipment:{}", record.reference_number)))
            .key(self.key(&format!("events:{}", record.reference_number)))
            .arg(json)
            .arg(record.version)
            .arg(event_json)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;

        Ok(inserted == 1)
    }

    async fn update_shipment_with_event(
        &self,
        record: &ShipmentRecord,
        event: &ShipmentEvent,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let next = ShipmentRecord {
            version: record.version + 1,
            ..record.clone()
        };
        let json = serde_json::to_string(&next)?;
        let event_json = serde_json::to_string(event)?;

        let updated: i32 = Script::new(UPDATE_SHIPMENT_SCRIPT)
            .key(self.key(&format!("shipment:{}", record.reference_number)))
            .key(self.key(&format!("events:{}", record.reference_number)))
            .arg(record.version)
            .arg(json)
            .arg(next.version)
            .arg(event_json)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;

        if updated == 0 {
            debug!(
                reference = %record.reference_number,
                expected_version = record.version,
                "Shipment update lost compare-and-swap"
            );
        }

        Ok(updated == 1)
    }

    async fn list_events(&self, reference: &str) -> Result<Vec<ShipmentEvent>, StoreError> {
        let mut conn = self.conn().await?;
        let entries: Vec<String> = cmd("LRANGE")
            .arg(self.key(&format!("events:{reference}")))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        entries
            .iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    async fn append_webhook_log(&self, entry: &WebhookLogEntry) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(entry)?;
        let key = self.key("webhooks:log");

        let _: () = pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(&key)
            .arg(json)
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(WEBHOOK_LOG_MAX_LEN - 1)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(())
    }

    async fn record_webhook_outcome(
        &self,
        at: DateTime<Utc>,
        failed: bool,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let key = self.webhook_bucket(at);

        let mut p = pipe();
        p.atomic().cmd("HINCRBY").arg(&key).arg("total").arg(1).ignore();
        if failed {
            p.cmd("HINCRBY").arg(&key).arg("failed").arg(1).ignore();
        }
        p.cmd("EXPIRE").arg(&key).arg(WEBHOOK_BUCKET_TTL_SECS).ignore();

        let _: () = p.query_async(&mut conn).await.map_err(redis_error)?;
        Ok(())
    }

    async fn webhook_stats(&self, since: DateTime<Utc>) -> Result<WebhookStats, StoreError> {
        let now = Utc::now();
        let mut hour = since
            .duration_trunc(ChronoDuration::hours(1))
            .unwrap_or(since);

        let mut keys = Vec::new();
        while hour <= now && keys.len() < 48 {
            keys.push(self.webhook_bucket(hour));
            hour += ChronoDuration::hours(1);
        }

        if keys.is_empty() {
            return Ok(WebhookStats::default());
        }

        let mut conn = self.conn().await?;
        let mut p = pipe();
        for key in &keys {
            p.cmd("HMGET").arg(key).arg("total").arg("failed");
        }
        let rows: Vec<(Option<u64>, Option<u64>)> =
            p.query_async(&mut conn).await.map_err(redis_error)?;

        Ok(rows
            .into_iter()
            .fold(WebhookStats::default(), |mut stats, (total, failed)| {
                stats.total += total.unwrap_or(0);
                stats.failed += failed.unwrap_or(0);
                stats
            }))
    }

    async fn save_reconciliation_run(&self, run: &ReconciliationRun) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(run)?;
        let key = self.key("reconcile:runs");

        let _: () = pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(&key)
            .arg(json)
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(RECONCILE_RUNS_MAX_LEN - 1)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(())
    }

    async fn latest_reconciliation_run(&self) -> Result<Option<ReconciliationRun>, StoreError> {
        let mut conn = self.conn().await?;
        let json: Option<String> = cmd("LINDEX")
            .arg(self.key("reconcile:runs"))
            .arg(0)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        json.map(|j| serde_json::from_str(&j))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn acquire_lock(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = cmd("SET")
            .arg(self.key(&format!("lock:{name}")))
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(reply.is_some())
    }

    async fn release_lock(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: i32 = Script::new(RELEASE_LOCK_SCRIPT)
            .key(self.key(&format!("lock:{name}")))
            .arg(holder)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for RedisStore {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = cmd("SET")
            .arg(self.key(&format!("idem:{key}")))
            .arg("pending")
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(reply.is_some())
    }

    async fn commit(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = cmd("SET")
            .arg(self.key(&format!("idem:{key}")))
            .arg("done")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: i64 = cmd("DEL")
            .arg(self.key(&format!("idem:{key}")))
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for RedisStore {
    async fn put(&self, item: &DeadLetterItem, retention: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(item)?;

        let _: () = pipe()
            .atomic()
            .cmd("SET")
            .arg(self.key(&format!("dlq:item:{}", item.id)))
            .arg(json)
            .arg("EX")
            .arg(ttl_secs(retention))
            .ignore()
            .cmd("SADD")
            .arg(self.key("dlq:index"))
            .arg(&item.id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<DeadLetterItem>, StoreError> {
        let mut conn = self.conn().await?;
        let json: Option<String> = cmd("GET")
            .arg(self.key(&format!("dlq:item:{id}")))
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        json.map(|j| serde_json::from_str(&j))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn list(&self) -> Result<Vec<DeadLetterItem>, StoreError> {
        let mut conn = self.conn().await?;
        let index = self.key("dlq:index");

        let ids: Vec<String> = cmd("SMEMBERS")
            .arg(&index)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids
            .iter()
            .map(|id| self.key(&format!("dlq:item:{id}")))
            .collect();
        let values: Vec<Option<String>> = cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        let mut items = Vec::with_capacity(values.len());
        let mut expired = Vec::new();
        for (id, value) in ids.into_iter().zip(values) {
            match value {
                Some(json) => items.push(serde_json::from_str(&json)?),
                None => expired.push(id),
            }
        }

        // Retention elapsed for these; drop them from the index.
        if !expired.is_empty() {
            debug!(count = expired.len(), "Pruning expired DLQ index entries");
            let _: i64 = cmd("SREM")
                .arg(&index)
                .arg(&expired)
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;
        }

        Ok(items)
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let (deleted, _): (i64, i64) = pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.key(&format!("dlq:item:{id}")))
            .cmd("SREM")
            .arg(self.key("dlq:index"))
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store() -> RedisStore {
        RedisStore::connect("redis://localhost:6379", "test").unwrap()
    }

    #[tokio::test]
    async fn test_key_layout() {
        let store = store();
        assert_eq!(store.key("dlq:index"), "test:dlq:index");

        let at = Utc.with_ymd_and_hms(2025, 3, 7, 14, 59, 0).unwrap();
        assert_eq!(store.webhook_bucket(at), "test:webhooks:2025030714");
    }

    #[test]
    fn test_ttl_is_at_least_one_second() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(90)), 90);
    }
}
