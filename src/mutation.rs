//! Versioned writes to shipment records.
//!
//! Webhook handlers, the retry driver and the reconciliation job all mutate
//! records through [`mutate_shipment`] and [`create_shipment`]. Updates are
//! read-modify-write with a compare-and-swap on `version`, retried a few
//! times on conflict. The audit [`ShipmentEvent`] is written in the same
//! atomic store operation as the record change, and only when the record
//! actually changed.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::shipment::{EventSource, ShipmentEvent, ShipmentRecord};
use crate::store::{ShipmentStore, StoreError};

/// Compare-and-swap attempts before giving up on a contended record.
pub const MAX_CAS_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum MutationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("record {reference} kept changing underneath us ({attempts} attempts)")]
    Conflict { reference: String, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    Applied {
        record: ShipmentRecord,
        event: ShipmentEvent,
    },
    Unchanged {
        record: ShipmentRecord,
    },
    /// No record for the reference number
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created {
        record: ShipmentRecord,
        event: ShipmentEvent,
    },
    AlreadyExists,
}

/// Apply `change` to the record for `reference`.
///
/// `change` edits the record in place and returns an audit description when
/// it changed something, `None` otherwise. It may run more than once if a
/// concurrent writer wins the race.
pub async fn mutate_shipment<F>(
    store: &dyn ShipmentStore,
    reference: &str,
    source: EventSource,
    now: DateTime<Utc>,
    mut change: F,
) -> Result<MutationOutcome, MutationError>
where
    F: FnMut(&mut ShipmentRecord) -> Option<String> + Send,
{
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let Some(current) = store.find_by_reference(reference).await? else {
            return Ok(MutationOutcome::Missing);
        };

        let mut next = current.clone();
        let Some(description) = change(&mut next) else {
            return Ok(MutationOutcome::Unchanged { record: current });
        };
        next.updated_at = now;
        let event = ShipmentEvent::new(&next, description, source, now);

        if store.update_shipment_with_event(&next, &event).await? {
            next.version += 1;
            return Ok(MutationOutcome::Applied {
                record: next,
                event,
            });
        }

        debug!(reference, attempt, "Version conflict, re-reading record");
    }

    Err(MutationError::Conflict {
        reference: reference.to_string(),
        attempts: MAX_CAS_ATTEMPTS,
    })
}

/// Insert a new record unless one already exists for its reference number.
pub async fn create_shipment(
    store: &dyn ShipmentStore,
    record: ShipmentRecord,
    description: impl Into<String>,
    source: EventSource,
    now: DateTime<Utc>,
) -> Result<CreateOutcome, MutationError> {
    let event = ShipmentEvent::new(&record, description, source, now);
    if !store.insert_shipment_with_event(&record, &event).await? {
        return Ok(CreateOutcome::AlreadyExists);
    }

    Ok(CreateOutcome::Created { record, event })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shipment::build_record_from_upstream;
    use crate::status::ShipmentStatus;
    use crate::store::MemoryStore;
    use crate::upstream::UpstreamLoad;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        let record = build_record_from_upstream(&UpstreamLoad::new("REF-1"), Utc::now());
        create_shipment(&store, record, "created", EventSource::Webhook, Utc::now())
            .await
            .unwrap();
        store
    }

    fn deliver(record: &mut ShipmentRecord) -> Option<String> {
        if record.status == ShipmentStatus::Delivered {
            return None;
        }
        record.status = ShipmentStatus::Delivered;
        Some("delivered".to_string())
    }

    #[tokio::test]
    async fn test_create_is_unique() {
        let store = seeded().await;
        let again = build_record_from_upstream(&UpstreamLoad::new("REF-1"), Utc::now());

        let outcome = create_shipment(&store, again, "created", EventSource::Webhook, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, CreateOutcome::AlreadyExists);
        assert_eq!(store.list_events("REF-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mutation_appends_one_event_per_change() {
        let store = seeded().await;

        let first = mutate_shipment(&store, "REF-1", EventSource::Webhook, Utc::now(), deliver)
            .await
            .unwrap();
        assert!(matches!(first, MutationOutcome::Applied { ref record, .. } if record.version == 1));

        let second = mutate_shipment(&store, "REF-1", EventSource::Webhook, Utc::now(), deliver)
            .await
            .unwrap();
        assert!(matches!(second, MutationOutcome::Unchanged { .. }));

        assert_eq!(store.list_events("REF-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_record() {
        let store = MemoryStore::new();
        let outcome = mutate_shipment(&store, "NOPE", EventSource::Webhook, Utc::now(), deliver)
            .await
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Missing);
    }

    /// Store whose updates always lose the race.
    struct AlwaysConflicting {
        inner: MemoryStore,
        updates: AtomicU32,
    }

    #[async_trait]
    impl ShipmentStore for AlwaysConflicting {
        async fn find_by_reference(&self, r: &str) -> Result<Option<ShipmentRecord>, StoreError> {
            self.inner.find_by_reference(r).await
        }
        async fn insert_shipment_with_event(
            &self,
            r: &ShipmentRecord,
            e: &ShipmentEvent,
        ) -> Result<bool, StoreError> {
            self.inner.insert_shipment_with_event(r, e).await
        }
        async fn update_shipment_with_event(
            &self,
            _: &ShipmentRecord,
            _: &ShipmentEvent,
        ) -> Result<bool, StoreError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
        async fn list_events(&self, r: &str) -> Result<Vec<ShipmentEvent>, StoreError> {
            self.inner.list_events(r).await
        }
        async fn append_webhook_log(
            &self,
            e: &crate::store::WebhookLogEntry,
        ) -> Result<(), StoreError> {
            self.inner.append_webhook_log(e).await
        }
        async fn record_webhook_outcome(&self, at: DateTime<Utc>, f: bool) -> Result<(), StoreError> {
            self.inner.record_webhook_outcome(at, f).await
        }
        async fn webhook_stats(
            &self,
            since: DateTime<Utc>,
        ) -> Result<crate::store::WebhookStats, StoreError> {
            self.inner.webhook_stats(since).await
        }
        async fn save_reconciliation_run(
            &self,
            run: &crate::shipment::ReconciliationRun,
        ) -> Result<(), StoreError> {
            self.inner.save_reconciliation_run(run).await
        }
        async fn latest_reconciliation_run(
            &self,
        ) -> Result<Option<crate::shipment::ReconciliationRun>, StoreError> {
            self.inner.latest_reconciliation_run().await
        }
        async fn acquire_lock(
            &self,
            n: &str,
            h: &str,
            t: std::time::Duration,
        ) -> Result<bool, StoreError> {
            self.inner.acquire_lock(n, h, t).await
        }
        async fn release_lock(&self, n: &str, h: &str) -> Result<(), StoreError> {
            self.inner.release_lock(n, h).await
        }
    }

    #[tokio::test]
    async fn test_conflict_after_bounded_attempts() {
        let store = AlwaysConflicting {
            inner: seeded().await,
            updates: AtomicU32::new(0),
        };

        let result =
            mutate_shipment(&store, "REF-1", EventSource::Retry, Utc::now(), deliver).await;

        assert!(matches!(result, Err(MutationError::Conflict { attempts: 3, .. })));
        assert_eq!(store.updates.load(Ordering::SeqCst), MAX_CAS_ATTEMPTS);
        assert_eq!(store.inner.list_events("REF-1").await.unwrap().len(), 1);
    }
}
