//! In-memory store implementations.
//!
//! [`MemoryStore`] implements every storage trait on plain maps behind tokio
//! locks. It honours the same contracts as the Redis store (atomic claims,
//! compare-and-swap updates, TTLs) and backs the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{
    DeadLetterStore, IdempotencyStore, ShipmentStore, StoreError, WebhookLogEntry, WebhookStats,
};
use crate::dlq::DeadLetterItem;
use crate::shipment::{ReconciliationRun, ShipmentEvent, ShipmentRecord};

#[derive(Default)]
struct State {
    shipments: HashMap<String, ShipmentRecord>,
    events: HashMap<String, Vec<ShipmentEvent>>,
    webhook_log: Vec<WebhookLogEntry>,
    webhook_outcomes: Vec<(DateTime<Utc>, bool)>,
    runs: Vec<ReconciliationRun>,
    locks: HashMap<String, (String, DateTime<Utc>)>,
    idempotency: HashMap<String, DateTime<Utc>>,
    dead_letters: HashMap<String, (DeadLetterItem, DateTime<Utc>)>,
}

/// Process-local store used by tests and single-node development.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of shipment records held.
    pub async fn shipment_count(&self) -> usize {
        self.state.lock().await.shipments.len()
    }

    /// Raw webhook log, oldest first.
    pub async fn webhook_log(&self) -> Vec<WebhookLogEntry> {
        self.state.lock().await.webhook_log.clone()
    }
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn push_event(state: &mut State, event: &ShipmentEvent) {
    state
        .events
        .entry(event.reference_number.clone())
        .or_default()
        .push(event.clone());
}

#[async_trait]
impl ShipmentStore for MemoryStore {
    async fn find_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<ShipmentRecord>, StoreError> {
        Ok(self.state.lock().await.shipments.get(reference).cloned())
    }

    async fn insert_shipment_with_event(
        &self,
        record: &ShipmentRecord,
        event: &ShipmentEvent,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.shipments.contains_key(&record.reference_number) {
            return Ok(false);
        }
        state
            .shipments
            .insert(record.reference_number.clone(), record.clone());
        push_event(&mut state, event);
        Ok(true)
    }

    async fn update_shipment_with_event(
        &self,
        record: &ShipmentRecord,
        event: &ShipmentEvent,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.shipments.get_mut(&record.reference_number) {
            Some(stored) if stored.version == record.version => {
                *stored = ShipmentRecord {
                    version: record.version + 1,
                    ..record.clone()
                };
            }
            _ => return Ok(false),
        }
        push_event(&mut state, event);
        Ok(true)
    }

    async fn list_events(&self, reference: &str) -> Result<Vec<ShipmentEvent>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .events
            .get(reference)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_webhook_log(&self, entry: &WebhookLogEntry) -> Result<(), StoreError> {
        self.state.lock().await.webhook_log.push(entry.clone());
        Ok(())
    }

    async fn record_webhook_outcome(
        &self,
        at: DateTime<Utc>,
        failed: bool,
    ) -> Result<(), StoreError> {
        self.state.lock().await.webhook_outcomes.push((at, failed));
        Ok(())
    }

    async fn webhook_stats(&self, since: DateTime<Utc>) -> Result<WebhookStats, StoreError> {
        let state = self.state.lock().await;
        let mut stats = WebhookStats::default();
        for (at, failed) in &state.webhook_outcomes {
            if *at >= since {
                stats.total += 1;
                if *failed {
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn save_reconciliation_run(&self, run: &ReconciliationRun) -> Result<(), StoreError> {
        self.state.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn latest_reconciliation_run(&self) -> Result<Option<ReconciliationRun>, StoreError> {
        Ok(self.state.lock().await.runs.last().cloned())
    }

    async fn acquire_lock(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        if let Some((_, expires_at)) = state.locks.get(name) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        state
            .locks
            .insert(name.to_string(), (holder.to_string(), expiry(ttl)));
        Ok(true)
    }

    async fn release_lock(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.locks.get(name).is_some_and(|(owner, _)| owner == holder) {
            state.locks.remove(name);
        }
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for MemoryStore {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(expires_at) = state.idempotency.get(key) {
            if *expires_at > Utc::now() {
                return Ok(false);
            }
        }
        state.idempotency.insert(key.to_string(), expiry(ttl));
        Ok(true)
    }

    async fn commit(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .idempotency
            .insert(key.to_string(), expiry(ttl));
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        self.state.lock().await.idempotency.remove(key);
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for MemoryStore {
    async fn put(&self, item: &DeadLetterItem, retention: Duration) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .dead_letters
            .insert(item.id.clone(), (item.clone(), expiry(retention)));
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<DeadLetterItem>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .dead_letters
            .get(id)
            .filter(|(_, expires_at)| *expires_at > Utc::now())
            .map(|(item, _)| item.clone()))
    }

    async fn list(&self) -> Result<Vec<DeadLetterItem>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        state.dead_letters.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(state
            .dead_letters
            .values()
            .map(|(item, _)| item.clone())
            .collect())
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.dead_letters.remove(id).is_some())
    }
}
