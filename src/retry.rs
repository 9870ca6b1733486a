//! DLQ retry driver.
//!
//! Each sweep re-processes the dead-letter items whose `next_retry_at` has
//! passed, a bounded number at a time, through the same router the webhook
//! path uses. Successes leave the queue and commit their idempotency key;
//! failures are rescheduled per the backoff table until retries run out.
//! Operators can force a single item with [`RetryDriver::retry_one`],
//! including items that already exhausted their retries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::dlq::{DeadLetterItem, DeadLetterQueue, DlqError};
use crate::event::{TmsEvent, WebhookEnvelope};
use crate::idempotency::Deduplicator;
use crate::notify::{raise, Alert, AlertKind, Notifier};
use crate::router::Router;
use crate::shipment::EventSource;

#[derive(Debug, Error)]
pub enum RetryError {
    #[error(transparent)]
    Dlq(#[from] DlqError),
}

/// Result of retrying one item.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// Applied and removed from the queue
    Resolved,
    /// Still failing; the updated item
    Failed(DeadLetterItem),
}

/// Totals for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items that ran out of retries during this sweep
    pub exhausted: usize,
    /// Items whose retry could not be recorded
    pub errors: usize,
    /// Queue size after the sweep
    pub remaining: usize,
}

#[derive(Clone)]
pub struct RetryDriver {
    dlq: DeadLetterQueue,
    router: Arc<Router>,
    dedup: Deduplicator,
    notifier: Arc<dyn Notifier>,
    concurrency: usize,
    backlog_alert_threshold: usize,
}

impl RetryDriver {
    pub fn new(
        dlq: DeadLetterQueue,
        router: Arc<Router>,
        dedup: Deduplicator,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            dlq,
            router,
            dedup,
            notifier,
            concurrency: 4,
            backlog_alert_threshold: 25,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_backlog_alert_threshold(mut self, threshold: usize) -> Self {
        self.backlog_alert_threshold = threshold;
        self
    }

    /// Retry every item due at `now`.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<RetrySummary, RetryError> {
        let due = self.dlq.due(now).await?;
        let mut summary = RetrySummary {
            attempted: due.len(),
            ..RetrySummary::default()
        };

        if !due.is_empty() {
            info!(due = due.len(), concurrency = self.concurrency, "Retrying dead letter items");
        }

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for item in due {
            let driver = self.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let id = item.id.clone();
                (id, driver.attempt(item, now).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(RetryOutcome::Resolved))) => summary.succeeded += 1,
                Ok((_, Ok(RetryOutcome::Failed(item)))) => {
                    summary.failed += 1;
                    if item.is_exhausted(self.dlq.max_retries()) {
                        summary.exhausted += 1;
                    }
                }
                Ok((id, Err(e))) => {
                    error!(dlq_id = %id, error = %e, "Failed to record retry");
                    summary.errors += 1;
                }
                Err(e) => {
                    error!(error = %e, "Retry task panicked");
                    summary.errors += 1;
                }
            }
        }

        let backlog = self.dlq.summary(now).await?;
        summary.remaining = backlog.size;

        if backlog.size > self.backlog_alert_threshold {
            raise(
                self.notifier.as_ref(),
                Alert::new(
                    AlertKind::DeadLetterBacklog,
                    format!(
                        "Dead letter queue holds {} items (threshold {})",
                        backlog.size, self.backlog_alert_threshold
                    ),
                    json!({
                        "size": backlog.size,
                        "exhausted": backlog.exhausted,
                        "due": backlog.due,
                        "threshold": self.backlog_alert_threshold,
                    }),
                ),
            )
            .await;
        }

        if summary.attempted > 0 {
            info!(
                attempted = summary.attempted,
                succeeded = summary.succeeded,
                failed = summary.failed,
                exhausted = summary.exhausted,
                remaining = summary.remaining,
                "Retry sweep finished"
            );
        }

        Ok(summary)
    }

    /// Retry one item now, regardless of its schedule.
    pub async fn retry_one(&self, id: &str, now: DateTime<Utc>) -> Result<RetryOutcome, RetryError> {
        let item = self
            .dlq
            .get(id)
            .await?
            .ok_or_else(|| DlqError::NotFound(id.to_string()))?;

        info!(dlq_id = %id, attempts = item.attempts, "Manual retry requested");
        self.attempt(item, now).await
    }

    async fn attempt(
        &self,
        item: DeadLetterItem,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome, RetryError> {
        let event = match WebhookEnvelope::parse(item.raw_payload.as_bytes())
            .and_then(|envelope| TmsEvent::decode(&envelope))
        {
            Ok(event) => event,
            Err(e) if e.is_unaddressed() => {
                warn!(dlq_id = %item.id, error = %e, "Dead letter names no record, dropping");
                self.dlq.resolve(&item.id).await?;
                if let Some(key) = &item.idempotency_key {
                    self.dedup.commit(key).await;
                }
                return Ok(RetryOutcome::Resolved);
            }
            Err(e) => {
                let item = self.dlq.record_permanent_failure(item, e.to_string(), now).await?;
                return Ok(RetryOutcome::Failed(item));
            }
        };

        match self.router.dispatch(&event, EventSource::Retry).await {
            Ok(_) => {
                self.dlq.resolve(&item.id).await?;
                if let Some(key) = &item.idempotency_key {
                    self.dedup.commit(key).await;
                }
                Ok(RetryOutcome::Resolved)
            }
            Err(e) if e.is_permanent() => {
                let item = self.dlq.record_permanent_failure(item, e.to_string(), now).await?;
                Ok(RetryOutcome::Failed(item))
            }
            Err(e) => {
                warn!(dlq_id = %item.id, error = %e, "Dead letter retry failed");
                let item = self.dlq.record_retry_failure(item, e.to_string(), now).await?;
                Ok(RetryOutcome::Failed(item))
            }
        }
    }
}
