//! Wiring: one [`SyncContext`] holds every component, built once at startup
//! and shared by the HTTP server and the worker.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config::SyncConfig;
use crate::dlq::DeadLetterQueue;
use crate::idempotency::Deduplicator;
use crate::ingest::WebhookReceiver;
use crate::notify::{self, MemoryNotifier, Notifier, NotifyError};
use crate::reconcile::Reconciler;
use crate::retry::RetryDriver;
use crate::router::Router;
use crate::store::{
    DeadLetterStore, IdempotencyStore, MemoryStore, RedisStore, ShipmentStore, StoreError,
};
use crate::upstream::{Upstream, UpstreamClient, UpstreamError};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("upstream client: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("notifier: {0}")]
    Notifier(#[from] NotifyError),
}

/// The stores behind a context.
pub struct Stores {
    pub shipments: Arc<dyn ShipmentStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
}

impl Stores {
    /// One backend serving all three roles.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: ShipmentStore + IdempotencyStore + DeadLetterStore + 'static,
    {
        Self {
            shipments: store.clone(),
            idempotency: store.clone(),
            dead_letters: store,
        }
    }
}

pub struct SyncContext {
    pub config: SyncConfig,
    pub store: Arc<dyn ShipmentStore>,
    pub dlq: DeadLetterQueue,
    pub receiver: WebhookReceiver,
    pub retry: RetryDriver,
    pub reconciler: Reconciler,
}

impl SyncContext {
    /// Connect to Redis and the TMS as configured.
    pub async fn connect(config: SyncConfig) -> Result<Self, ContextError> {
        let redis = Arc::new(RedisStore::connect(&config.redis.url, &config.redis.key_prefix)?);
        redis.ping().await?;
        info!(prefix = %config.redis.key_prefix, "Connected to Redis");

        let upstream = Arc::new(UpstreamClient::new(&config.upstream)?);
        let notifier = notify::from_config(&config.alerts)?;
        info!(notifier = %notifier.name(), "Alerting configured");

        Ok(Self::assemble(config, Stores::shared(redis), upstream, notifier))
    }

    /// Build every component over the given collaborators.
    pub fn assemble(
        config: SyncConfig,
        stores: Stores,
        upstream: Arc<dyn Upstream>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let dlq = DeadLetterQueue::new(
            stores.dead_letters,
            Duration::from_secs(config.dlq.retention_secs),
        );
        let dedup = Deduplicator::new(stores.idempotency, &config.dedup);
        let router = Arc::new(Router::standard(stores.shipments.clone()));

        let receiver = WebhookReceiver::new(
            config.server.webhook_secret.clone(),
            stores.shipments.clone(),
            dedup.clone(),
            router.clone(),
            dlq.clone(),
        );

        let retry = RetryDriver::new(dlq.clone(), router, dedup, notifier.clone())
            .with_concurrency(config.retry.concurrency)
            .with_backlog_alert_threshold(config.retry.backlog_alert_threshold);

        let reconciler = Reconciler::new(
            upstream,
            stores.shipments.clone(),
            notifier,
            &config.reconcile,
            &config.upstream,
        );

        Self {
            config,
            store: stores.shipments,
            dlq,
            receiver,
            retry,
            reconciler,
        }
    }

    /// In-memory context for tests and local experiments.
    pub fn in_memory(
        config: SyncConfig,
        upstream: Arc<dyn Upstream>,
    ) -> (Self, Arc<MemoryStore>, Arc<MemoryNotifier>) {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let context = Self::assemble(
            config,
            Stores::shared(store.clone()),
            upstream,
            notifier.clone(),
        );
        (context, store, notifier)
    }
}
