//! Webhook Receiver.
//!
//! Turns one webhook delivery into at most one application of its event:
//!
//! ```text
//! body ──► signature? ──► envelope ──► idempotency claim ──► log ──► decode ──► router
//!              │ bad          │ bad          │ duplicate                 │ bad     │ error
//!              ▼              ▼              ▼                           ▼         ▼
//!             401        200 success:false  200 duplicate            DLQ (inert)  DLQ + release
//! ```
//!
//! Anything past the signature check answers 200 so the TMS never retries
//! into a handler that already failed; recovery belongs to the DLQ. Only a
//! mis-typed payload is parked inert. A known event that names no record is
//! acknowledged and its key committed, since no retry can supply the
//! reference. The raw body is appended to the webhook log in the background
//! and never blocks the response.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dlq::{DeadLetterQueue, NewFailure};
use crate::event::{TmsEvent, WebhookEnvelope};
use crate::idempotency::{key_for_envelope, Claim, Deduplicator};
use crate::router::Router;
use crate::shipment::EventSource;
use crate::signature::verify_signature;
use crate::store::{ShipmentStore, WebhookLogEntry};

/// Response body returned to the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued: Option<bool>,
    pub event: String,
}

impl IngestResponse {
    fn processed(event: impl Into<String>) -> Self {
        Self {
            success: true,
            duplicate: None,
            queued: None,
            event: event.into(),
        }
    }

    fn duplicate(event: impl Into<String>) -> Self {
        Self {
            duplicate: Some(true),
            ..Self::processed(event)
        }
    }

    fn queued(event: impl Into<String>) -> Self {
        Self {
            queued: Some(true),
            ..Self::processed(event)
        }
    }

    fn rejected(event: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::processed(event)
        }
    }
}

/// The only outcome that is not a 200.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestRejection {
    InvalidSignature,
}

pub struct WebhookReceiver {
    webhook_secret: Option<String>,
    store: Arc<dyn ShipmentStore>,
    dedup: Deduplicator,
    router: Arc<Router>,
    dlq: DeadLetterQueue,
}

impl WebhookReceiver {
    pub fn new(
        webhook_secret: Option<String>,
        store: Arc<dyn ShipmentStore>,
        dedup: Deduplicator,
        router: Arc<Router>,
        dlq: DeadLetterQueue,
    ) -> Self {
        Self {
            webhook_secret: webhook_secret.filter(|s| !s.is_empty()),
            store,
            dedup,
            router,
            dlq,
        }
    }

    /// Process one delivery.
    ///
    /// The signature is checked only when both a secret is configured and
    /// the sender supplied a header.
    pub async fn receive(
        &self,
        provider: &str,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<IngestResponse, IngestRejection> {
        if let (Some(secret), Some(header)) = (&self.webhook_secret, signature) {
            if let Err(e) = verify_signature(body, header, secret) {
                warn!(provider, error = %e, "Rejected webhook with bad signature");
                return Err(IngestRejection::InvalidSignature);
            }
        }

        let envelope = match WebhookEnvelope::parse(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(provider, error = %e, "Malformed webhook body");
                self.record_outcome(true);
                return Ok(IngestResponse::rejected("unknown"));
            }
        };

        let event_type = envelope.canonical_type();
        let key = key_for_envelope(&envelope, body);
        let claim = self.dedup.claim(&key).await;
        if claim == Claim::Duplicate {
            info!(
                provider,
                event_type = %event_type,
                reference = envelope.reference_number.as_deref().unwrap_or_default(),
                "Duplicate webhook acknowledged"
            );
            self.record_outcome(false);
            return Ok(IngestResponse::duplicate(event_type));
        }
        let claimed = claim == Claim::Acquired;
        self.append_log(provider, &envelope, body);

        let event = match TmsEvent::decode(&envelope) {
            Ok(event) => event,
            Err(e) if e.is_unaddressed() => {
                warn!(provider, event_type = %event_type, error = %e, "Webhook names no record, acknowledged");
                if claimed {
                    self.dedup.commit(&key).await;
                }
                self.record_outcome(false);
                return Ok(IngestResponse::processed(event_type));
            }
            Err(e) => {
                warn!(provider, event_type = %event_type, error = %e, "Webhook payload failed validation");
                if claimed {
                    self.dedup.release(&key).await;
                }
                let failure = NewFailure::new(&event_type, lossy(body), e.to_string())
                    .with_idempotency_key(&key)
                    .permanent();
                return Ok(self.park(failure, event_type).await);
            }
        };

        match self.router.dispatch(&event, EventSource::Webhook).await {
            Ok(_) => {
                if claimed {
                    self.dedup.commit(&key).await;
                }
                self.record_outcome(false);
                Ok(IngestResponse::processed(event_type))
            }
            Err(e) => {
                if claimed {
                    self.dedup.release(&key).await;
                }
                let mut failure = NewFailure::new(&event_type, lossy(body), e.to_string())
                    .with_idempotency_key(&key);
                if e.is_permanent() {
                    failure = failure.permanent();
                }
                Ok(self.park(failure, event_type).await)
            }
        }
    }

    async fn park(&self, failure: NewFailure, event_type: String) -> IngestResponse {
        self.record_outcome(true);
        match self.dlq.push_failure(failure, Utc::now()).await {
            Ok(_) => IngestResponse::queued(event_type),
            Err(e) => {
                error!(event_type = %event_type, error = %e, "Failed to park event in DLQ");
                IngestResponse::rejected(event_type)
            }
        }
    }

    fn append_log(&self, provider: &str, envelope: &WebhookEnvelope, body: &[u8]) {
        let entry = WebhookLogEntry {
            id: Uuid::new_v4().to_string(),
            provider: provider.to_string(),
            event_type: envelope.event_type.clone(),
            reference_number: envelope.reference_number.clone(),
            received_at: Utc::now(),
            raw: lossy(body),
        };
        let store = self.store.clone();

        tokio::spawn(async move {
            if let Err(e) = store.append_webhook_log(&entry).await {
                warn!(error = %e, "Failed to append webhook log");
            }
        });
    }

    fn record_outcome(&self, failed: bool) {
        let store = self.store.clone();
        let at = Utc::now();

        tokio::spawn(async move {
            if let Err(e) = store.record_webhook_outcome(at, failed).await {
                warn!(error = %e, "Failed to record webhook outcome");
            }
        });
    }
}

fn lossy(body: &[u8]) -> String {
    String::from_utf8_lossy(body).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DedupConfig;
    use crate::signature::signature_header;
    use crate::store::{IdempotencyStore, MemoryStore, StoreError};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Idempotency backend that is always unreachable.
    struct OfflineKeys;

    #[async_trait]
    impl IdempotencyStore for OfflineKeys {
        async fn claim(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn commit(&self, _key: &str, _ttl: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn release(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    fn receiver(store: Arc<MemoryStore>, secret: Option<&str>) -> WebhookReceiver {
        WebhookReceiver::new(
            secret.map(str::to_string),
            store.clone(),
            Deduplicator::new(store.clone(), &DedupConfig::default()),
            Arc::new(Router::standard(store.clone())),
            DeadLetterQueue::new(store, Duration::from_secs(3600)),
        )
    }

    const CREATED: &[u8] =
        br#"{ "event_type": "load.created", "reference_number": "REF-1", "occurred_at": "2025-03-07T10:00:00Z" }"#;

    #[tokio::test]
    async fn test_created_then_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let receiver = receiver(store.clone(), None);

        let first = receiver.receive("tms", CREATED, None).await.unwrap();
        assert_eq!(first, IngestResponse::processed("load.created"));

        let second = receiver.receive("tms", CREATED, None).await.unwrap();
        assert_eq!(second.duplicate, Some(true));
        assert_eq!(store.shipment_count().await, 1);
    }

    #[tokio::test]
    async fn test_signature_checked_when_configured() {
        let store = Arc::new(MemoryStore::new());
        let receiver = receiver(store.clone(), Some("s3cret"));

        let bad = receiver.receive("tms", CREATED, Some("sha1=nope")).await;
        assert_eq!(bad, Err(IngestRejection::InvalidSignature));
        assert_eq!(store.shipment_count().await, 0);

        let header = signature_header(CREATED, "s3cret");
        assert!(receiver.receive("tms", CREATED, Some(&header)).await.unwrap().success);

        // No header: accepted without a check.
        let unsigned = br#"{ "event_type": "load.created", "reference_number": "REF-2" }"#;
        assert!(receiver.receive("tms", unsigned, None).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_malformed_body_is_acknowledged() {
        let store = Arc::new(MemoryStore::new());
        let response = receiver(store, None).receive("tms", b"{not json", None).await.unwrap();

        assert!(!response.success);
        assert_eq!(response.event, "unknown");
    }

    #[tokio::test]
    async fn test_mistyped_payload_is_parked_inert() {
        let store = Arc::new(MemoryStore::new());
        let receiver = receiver(store.clone(), None);
        let body = br#"{ "event_type": "load.status_updated", "reference_number": "REF-1", "data": { "status": ["Delivered"] } }"#;

        let response = receiver.receive("tms", body, None).await.unwrap();
        assert_eq!(response.queued, Some(true));

        let items = receiver.dlq.list().await.unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].permanent);
        assert!(items[0].next_retry_at.is_none());
    }

    #[tokio::test]
    async fn test_event_without_reference_is_acknowledged() {
        let store = Arc::new(MemoryStore::new());
        let receiver = receiver(store.clone(), None);
        let body = br#"{ "event_type": "load.tender_status_changed", "data": { "tender_status": "Rejected" } }"#;

        let response = receiver.receive("tms", body, None).await.unwrap();
        assert_eq!(response, IngestResponse::processed("load.tender_status_changed"));
        assert!(receiver.dlq.list().await.unwrap().is_empty());

        // The key was committed, so a redelivery is a duplicate.
        let again = receiver.receive("tms", body, None).await.unwrap();
        assert_eq!(again.duplicate, Some(true));
    }

    #[tokio::test]
    async fn test_partial_payloads_are_acknowledged() {
        let store = Arc::new(MemoryStore::new());
        let receiver = receiver(store.clone(), None);
        receiver.receive("tms", CREATED, None).await.unwrap();

        let bodies: [&[u8]; 3] = [
            br#"{ "event_type": "load.status_updated", "reference_number": "REF-1", "data": { "currentLocation": "Memphis, TN" } }"#,
            br#"{ "event_type": "load.tender_status_changed", "reference_number": "REF-1", "data": {} }"#,
            br#"{ "event_type": "load.document_added", "reference_number": "REF-1", "data": { "name": "pod.pdf" } }"#,
        ];
        for body in bodies {
            let response = receiver.receive("tms", body, None).await.unwrap();
            assert!(response.success);
            assert_eq!(response.queued, None);
        }
        assert!(receiver.dlq.list().await.unwrap().is_empty());

        let record = store.find_by_reference("REF-1").await.unwrap().unwrap();
        assert_eq!(record.current_location.as_deref(), Some("Memphis, TN"));
        assert_eq!(record.status, crate::status::ShipmentStatus::Booked);
    }

    #[tokio::test]
    async fn test_unreachable_idempotency_store_still_processes() {
        let store = Arc::new(MemoryStore::new());
        let receiver = WebhookReceiver::new(
            None,
            store.clone(),
            Deduplicator::new(Arc::new(OfflineKeys), &DedupConfig::default()),
            Arc::new(Router::standard(store.clone())),
            DeadLetterQueue::new(store.clone(), Duration::from_secs(3600)),
        );

        let response = receiver.receive("tms", CREATED, None).await.unwrap();
        assert_eq!(response, IngestResponse::processed("load.created"));
        assert_eq!(store.shipment_count().await, 1);

        // Without deduplication a redelivery reaches the handler, which is a no-op.
        let again = receiver.receive("tms", CREATED, None).await.unwrap();
        assert_eq!(again.duplicate, None);
        assert_eq!(store.shipment_count().await, 1);
        assert_eq!(store.list_events("REF-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_redelivery_applies_once() {
        let store = Arc::new(MemoryStore::new());
        let receiver = receiver(store.clone(), None);
        receiver.receive("tms", CREATED, None).await.unwrap();

        let body = br#"{ "event_type": "load.status_updated", "reference_number": "REF-1",
                         "occurred_at": "2025-03-07T12:00:00Z", "data": { "status": "Delivered" } }"#;
        let (a, b) = tokio::join!(
            receiver.receive("tms", body, None),
            receiver.receive("tms", body, None)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let duplicates = [&a, &b]
            .iter()
            .filter(|r| r.duplicate == Some(true))
            .count();
        assert_eq!(duplicates, 1);
        assert!(a.success && b.success);
        assert_eq!(store.list_events("REF-1").await.unwrap().len(), 2);
    }
}
