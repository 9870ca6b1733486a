//! Idempotency keys and the claim/commit protocol around them.
//!
//! A key is claimed (`SET NX` with a short in-flight TTL) before any
//! mutation, committed with the full TTL once the event is applied, and
//! released when processing fails so a redelivery or retry can run again.
//! If the store itself is unreachable the receiver proceeds without
//! deduplication; handlers are idempotent, so a double application is
//! harmless.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::DedupConfig;
use crate::event::WebhookEnvelope;
use crate::store::IdempotencyStore;

/// Result of trying to claim a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// First sighting; the caller owns the key
    Acquired,
    /// Already applied or in flight elsewhere
    Duplicate,
    /// Store unreachable; proceed without deduplication
    Unavailable,
}

/// `sha256("{event_type}|{reference}|{occurred_at}")`, hex encoded.
pub fn idempotency_key(event_type: &str, reference: &str, occurred_at: &str) -> String {
    let digest = Sha256::digest(format!("{event_type}|{reference}|{occurred_at}").as_bytes());
    hex::encode(digest)
}

/// Key for a received envelope.
///
/// Without a timestamp the body hash stands in, so byte-identical
/// redeliveries still collapse.
pub fn key_for_envelope(envelope: &WebhookEnvelope, raw: &[u8]) -> String {
    let occurred_at = envelope
        .occurred_at
        .clone()
        .unwrap_or_else(|| format!("body:{}", hex::encode(Sha256::digest(raw))));

    idempotency_key(
        &envelope.canonical_type(),
        envelope.reference_number.as_deref().unwrap_or_default(),
        &occurred_at,
    )
}

#[derive(Clone)]
pub struct Deduplicator {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
    in_flight_ttl: Duration,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: &DedupConfig) -> Self {
        Self {
            store,
            ttl: Duration::from_secs(config.ttl_secs),
            in_flight_ttl: Duration::from_secs(config.in_flight_ttl_secs),
        }
    }

    pub async fn claim(&self, key: &str) -> Claim {
        match self.store.claim(key, self.in_flight_ttl).await {
            Ok(true) => Claim::Acquired,
            Ok(false) => {
                debug!(key, "Duplicate delivery");
                Claim::Duplicate
            }
            Err(e) => {
                warn!(key, error = %e, "Idempotency store unavailable, skipping deduplication");
                Claim::Unavailable
            }
        }
    }

    /// Mark the key as applied for the full TTL.
    pub async fn commit(&self, key: &str) {
        if let Err(e) = self.store.commit(key, self.ttl).await {
            warn!(key, error = %e, "Failed to commit idempotency key");
        }
    }

    pub async fn release(&self, key: &str) {
        if let Err(e) = self.store.release(key).await {
            warn!(key, error = %e, "Failed to release idempotency key");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_key_is_stable_and_field_sensitive() {
        let a = idempotency_key("load.created", "REF-1", "2025-03-07T10:00:00Z");
        assert_eq!(a, idempotency_key("load.created", "REF-1", "2025-03-07T10:00:00Z"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, idempotency_key("load.created", "REF-2", "2025-03-07T10:00:00Z"));
        assert_ne!(a, idempotency_key("load.status_updated", "REF-1", "2025-03-07T10:00:00Z"));
    }

    #[test]
    fn test_spellings_of_one_event_share_a_key() {
        let a = WebhookEnvelope::parse(
            br#"{ "event_type": "load.created", "reference_number": "R", "occurred_at": "t1" }"#,
        )
        .unwrap();
        let b = WebhookEnvelope::parse(
            br#"{ "eventType": "LOAD_CREATED", "data": { "referenceNumber": "R", "occurredAt": "t1" } }"#,
        )
        .unwrap();

        assert_eq!(key_for_envelope(&a, b"x"), key_for_envelope(&b, b"y"));
    }

    #[test]
    fn test_body_hash_stands_in_for_missing_timestamp() {
        let raw = br#"{ "event_type": "load.created", "reference_number": "R" }"#;
        let envelope = WebhookEnvelope::parse(raw).unwrap();

        assert_eq!(key_for_envelope(&envelope, raw), key_for_envelope(&envelope, raw));
        assert_ne!(
            key_for_envelope(&envelope, raw),
            key_for_envelope(&envelope, b"different body")
        );
    }

    #[tokio::test]
    async fn test_claim_commit_release() {
        let dedup = Deduplicator::new(Arc::new(MemoryStore::new()), &DedupConfig::default());

        assert_eq!(dedup.claim("k").await, Claim::Acquired);
        assert_eq!(dedup.claim("k").await, Claim::Duplicate);

        dedup.release("k").await;
        assert_eq!(dedup.claim("k").await, Claim::Acquired);

        dedup.commit("k").await;
        assert_eq!(dedup.claim("k").await, Claim::Duplicate);
    }
}
