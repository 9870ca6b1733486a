//! Sync health report for the admin surface.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::dlq::{DeadLetterQueue, DlqError, DlqSummary};
use crate::shipment::ReconciliationRun;
use crate::store::{ShipmentStore, StoreError};

#[derive(Debug, Error)]
pub enum HealthError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dlq(#[from] DlqError),
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookHealth {
    pub received_24h: u64,
    pub failed_24h: u64,
    pub failure_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub webhooks: WebhookHealth,
    pub dead_letter: DlqSummary,
    pub last_reconciliation: Option<ReconciliationRun>,
}

/// Webhook volume over the last 24 hours, DLQ size and the latest run.
pub async fn collect(
    store: &dyn ShipmentStore,
    dlq: &DeadLetterQueue,
    now: DateTime<Utc>,
) -> Result<HealthReport, HealthError> {
    let stats = store.webhook_stats(now - Duration::hours(24)).await?;

    Ok(HealthReport {
        generated_at: now,
        webhooks: WebhookHealth {
            received_24h: stats.total,
            failed_24h: stats.failed,
            failure_rate: stats.failure_rate(),
        },
        dead_letter: dlq.summary(now).await?,
        last_reconciliation: store.latest_reconciliation_run().await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::NewFailure;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_collect() {
        let store = Arc::new(MemoryStore::new());
        let dlq = DeadLetterQueue::new(store.clone(), std::time::Duration::from_secs(3600));
        let now = Utc::now();

        store.record_webhook_outcome(now - Duration::hours(30), true).await.unwrap();
        store.record_webhook_outcome(now - Duration::hours(1), false).await.unwrap();
        store.record_webhook_outcome(now, true).await.unwrap();
        dlq.push_failure(NewFailure::new("load.created", "{}", "boom"), now)
            .await
            .unwrap();

        let report = collect(store.as_ref(), &dlq, now).await.unwrap();
        assert_eq!(report.webhooks.received_24h, 2);
        assert_eq!(report.webhooks.failed_24h, 1);
        assert_eq!(report.dead_letter.size, 1);
        assert!(report.last_reconciliation.is_none());
    }
}
