//! Dead Letter Queue for failed event processing.
//!
//! When an event handler fails, the raw payload is parked here with retry
//! metadata. The [`crate::retry::RetryDriver`] picks up items whose
//! `next_retry_at` has elapsed; once `attempts` reaches [`MAX_RETRIES`] the
//! item goes inert and waits for an operator.
//!
//! # Backoff
//!
//! ```text
//! attempts | next retry after
//! ---------|-----------------
//!    1     | 1 minute
//!    2     | 5 minutes
//!    3     | 15 minutes
//!    4     | 1 hour
//!    5     | (cleared, max retries reached)
//! ```
//!
//! The table carries a fifth slot (4 hours) that only applies if
//! `max_retries` is raised above five.
//!
//! # Example
//!
//! ```rust,ignore
//! use loadsync::dlq::DeadLetterQueue;
//!
//! let dlq = DeadLetterQueue::new(store, retention);
//! dlq.push_failure(NewFailure::new("load.status_updated", raw, "store unavailable"), now).await?;
//!
//! // Later, find what is ready to retry
//! let due = dlq.due(Utc::now()).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{DeadLetterStore, StoreError};

/// Maximum number of processing attempts before an item goes inert.
pub const MAX_RETRIES: u32 = 5;

/// Delay before the next retry, indexed by `attempts - 1`.
pub const BACKOFF_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(4 * 60 * 60),
];

/// Look up the delay that follows the given attempt count.
pub fn backoff_for_attempt(attempts: u32) -> Option<Duration> {
    let index = attempts.checked_sub(1)? as usize;
    BACKOFF_SCHEDULE.get(index).copied()
}

/// A failed event stored in the Dead Letter Queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterItem {
    pub id: String,

    /// Canonical event type of the original delivery
    pub event_type: String,

    /// The webhook body exactly as received
    pub raw_payload: String,

    /// Committed once a retry succeeds
    #[serde(default)]
    pub idempotency_key: Option<String>,

    /// Error message from the last failed attempt
    pub error: String,

    pub attempts: u32,

    pub first_failed_at: DateTime<Utc>,

    pub last_attempt_at: DateTime<Utc>,

    /// `None` once retries are exhausted or the failure is permanent
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Set for failures that can never succeed on retry
    #[serde(default)]
    pub permanent: bool,
}

impl DeadLetterItem {
    /// Ready for an automatic retry at `now`.
    pub fn is_due(&self, now: DateTime<Utc>, max_retries: u32) -> bool {
        self.attempts < max_retries && self.next_retry_at.is_some_and(|at| at <= now)
    }

    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.attempts >= max_retries
    }
}

/// A first-time failure about to enter the queue.
#[derive(Debug, Clone)]
pub struct NewFailure {
    pub event_type: String,
    pub raw_payload: String,
    pub idempotency_key: Option<String>,
    pub error: String,
    pub permanent: bool,
}

impl NewFailure {
    pub fn new(
        event_type: impl Into<String>,
        raw_payload: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            raw_payload: raw_payload.into(),
            idempotency_key: None,
            error: error.into(),
            permanent: false,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Mark the failure as one retries cannot fix.
    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }
}

/// DLQ size figures for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqSummary {
    pub size: usize,
    pub exhausted: usize,
    pub due: usize,
}

/// Errors that can occur when working with the Dead Letter Queue.
#[derive(Debug, Error)]
pub enum DlqError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("dead letter item not found: {0}")]
    NotFound(String),
}

/// Dead Letter Queue operations over a [`DeadLetterStore`].
#[derive(Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn DeadLetterStore>,
    retention: Duration,
    max_retries: u32,
}

impl DeadLetterQueue {
    /// Create a new Dead Letter Queue instance.
    pub fn new(store: Arc<dyn DeadLetterStore>, retention: Duration) -> Self {
        Self {
            store,
            retention,
            max_retries: MAX_RETRIES,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Park a first-time failure. The item starts with `attempts = 1`.
    pub async fn push_failure(
        &self,
        failure: NewFailure,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterItem, DlqError> {
        let mut item = DeadLetterItem {
            id: Uuid::new_v4().to_string(),
            event_type: failure.event_type,
            raw_payload: failure.raw_payload,
            idempotency_key: failure.idempotency_key,
            error: failure.error,
            attempts: 1,
            first_failed_at: now,
            last_attempt_at: now,
            next_retry_at: None,
            permanent: failure.permanent,
        };

        if item.permanent {
            item.attempts = self.max_retries;
        }
        self.schedule(&mut item);
        self.persist(&item, now).await?;

        info!(
            dlq_id = %item.id,
            event_type = %item.event_type,
            permanent = item.permanent,
            next_retry_at = ?item.next_retry_at,
            "Event moved to Dead Letter Queue"
        );

        Ok(item)
    }

    /// Record another failed attempt and compute the next retry time.
    ///
    /// `attempts` never exceeds the maximum; a manual retry of an exhausted
    /// item only refreshes the error and attempt time.
    pub async fn record_retry_failure(
        &self,
        mut item: DeadLetterItem,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterItem, DlqError> {
        item.attempts = (item.attempts + 1).min(self.max_retries);
        item.last_attempt_at = now;
        item.error = error.into();
        self.schedule(&mut item);
        self.persist(&item, now).await?;

        if item.next_retry_at.is_none() {
            warn!(
                dlq_id = %item.id,
                event_type = %item.event_type,
                attempts = item.attempts,
                "Dead letter item exhausted its retries"
            );
        } else {
            debug!(
                dlq_id = %item.id,
                attempts = item.attempts,
                next_retry_at = ?item.next_retry_at,
                "Scheduled dead letter retry"
            );
        }

        Ok(item)
    }

    /// Record a failed attempt that no retry can fix and take the item out of rotation.
    pub async fn record_permanent_failure(
        &self,
        mut item: DeadLetterItem,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterItem, DlqError> {
        item.permanent = true;
        item.attempts = self.max_retries;
        item.last_attempt_at = now;
        item.error = error.into();
        item.next_retry_at = None;
        self.persist(&item, now).await?;

        warn!(
            dlq_id = %item.id,
            event_type = %item.event_type,
            error = %item.error,
            "Dead letter item failed permanently"
        );

        Ok(item)
    }

    /// Remove an item after a successful retry.
    pub async fn resolve(&self, id: &str) -> Result<bool, DlqError> {
        let removed = self.store.remove(id).await?;
        if removed {
            info!(dlq_id = %id, "Dead letter item resolved");
        }
        Ok(removed)
    }

    /// Remove an item on operator request.
    pub async fn delete(&self, id: &str) -> Result<(), DlqError> {
        if self.store.remove(id).await? {
            info!(dlq_id = %id, "Removed event from DLQ");
            Ok(())
        } else {
            debug!(dlq_id = %id, "Event not found in DLQ");
            Err(DlqError::NotFound(id.to_string()))
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<DeadLetterItem>, DlqError> {
        Ok(self.store.get(id).await?)
    }

    /// All items, oldest failure first.
    pub async fn list(&self) -> Result<Vec<DeadLetterItem>, DlqError> {
        let mut items = self.store.list().await?;
        items.sort_by(|a, b| {
            a.first_failed_at
                .cmp(&b.first_failed_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(items)
    }

    /// Items ready for an automatic retry at `now`.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<DeadLetterItem>, DlqError> {
        let items = self.list().await?;
        Ok(items
            .into_iter()
            .filter(|item| item.is_due(now, self.max_retries))
            .collect())
    }

    pub async fn summary(&self, now: DateTime<Utc>) -> Result<DlqSummary, DlqError> {
        let items = self.store.list().await?;
        Ok(DlqSummary {
            size: items.len(),
            exhausted: items
                .iter()
                .filter(|item| item.is_exhausted(self.max_retries))
                .count(),
            due: items
                .iter()
                .filter(|item| item.is_due(now, self.max_retries))
                .count(),
        })
    }

    fn schedule(&self, item: &mut DeadLetterItem) {
        item.next_retry_at = if item.is_exhausted(self.max_retries) {
            None
        } else {
            backoff_for_attempt(item.attempts)
                .and_then(|delay| chrono::Duration::from_std(delay).ok())
                .map(|delay| item.last_attempt_at + delay)
        };
    }

    /// Store the item for whatever remains of its retention window.
    async fn persist(&self, item: &DeadLetterItem, now: DateTime<Utc>) -> Result<(), DlqError> {
        let expires_at = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| item.first_failed_at.checked_add_signed(retention));

        let remaining = match expires_at {
            Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO),
            None => self.retention,
        }
        .max(Duration::from_secs(1));

        self.store.put(item, remaining).await?;
        Ok(())
    }
}
