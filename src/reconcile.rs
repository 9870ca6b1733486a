//! Reconciliation job.
//!
//! Pages through every load the TMS knows about and converges the local
//! store onto it: missing records are created, diverged ones are corrected
//! with a `reconciliation` audit event, and loads without equipment are
//! skipped. Only one run may be active at a time (a store-level lock with a
//! TTL), and each run stops cleanly between records once its wall-clock
//! budget is spent.
//!
//! ```text
//! acquire lock ─► page 1 ─► page 2 ─► ... ─► save run ─► alerts ─► release lock
//!                  │ per load: skip | create | compare + correct
//!                  └─ budget checked before every fetch and every record
//! ```

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ReconcileConfig, UpstreamConfig};
use crate::mutation::{create_shipment, mutate_shipment, CreateOutcome, MutationError, MutationOutcome};
use crate::notify::{raise, Alert, AlertKind, Notifier};
use crate::shipment::{
    apply_upstream, build_record_from_upstream, reported_status, EventSource, ReconciliationRun,
    RunStatus, RunTrigger,
};
use crate::store::{ShipmentStore, StoreError};
use crate::upstream::{Upstream, UpstreamLoad};

/// Name of the store lock guarding reconciliation.
pub const LOCK_NAME: &str = "reconciliation";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("a reconciliation run is already in progress")]
    AlreadyRunning,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Reconciler {
    upstream: Arc<dyn Upstream>,
    store: Arc<dyn ShipmentStore>,
    notifier: Arc<dyn Notifier>,
    page_size: u32,
    page_delay: Duration,
    budget: Duration,
    lock_ttl: Duration,
    alert_threshold: u64,
}

impl Reconciler {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        store: Arc<dyn ShipmentStore>,
        notifier: Arc<dyn Notifier>,
        reconcile: &ReconcileConfig,
        upstream_config: &UpstreamConfig,
    ) -> Self {
        Self {
            upstream,
            store,
            notifier,
            page_size: upstream_config.page_size.max(1),
            page_delay: Duration::from_millis(upstream_config.page_delay_ms),
            budget: reconcile.budget(),
            lock_ttl: Duration::from_secs(reconcile.lock_ttl_secs),
            alert_threshold: reconcile.alert_threshold,
        }
    }

    /// Run one reconciliation sweep.
    ///
    /// Returns [`ReconcileError::AlreadyRunning`] without touching anything
    /// when another run holds the lock.
    pub async fn run(&self, trigger: RunTrigger) -> Result<ReconciliationRun, ReconcileError> {
        let holder = Uuid::new_v4().to_string();
        if !self.store.acquire_lock(LOCK_NAME, &holder, self.lock_ttl).await? {
            info!(trigger = ?trigger, "Reconciliation already running, skipping");
            return Err(ReconcileError::AlreadyRunning);
        }

        let result = self.sweep(trigger).await;

        if let Err(e) = self.store.release_lock(LOCK_NAME, &holder).await {
            warn!(error = %e, "Failed to release reconciliation lock, it will expire");
        }

        result
    }

    async fn sweep(&self, trigger: RunTrigger) -> Result<ReconciliationRun, ReconcileError> {
        let deadline = Instant::now() + self.budget;
        let mut run = ReconciliationRun::start(trigger, Utc::now());
        let mut status = RunStatus::Completed;
        let mut page = 1;

        info!(run_id = %run.id, trigger = ?trigger, "Reconciliation started");

        'pages: loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                status = RunStatus::TimedOut;
                break;
            }

            let fetched = tokio::time::timeout(
                remaining,
                self.upstream.fetch_page(page, self.page_size),
            )
            .await;

            let batch = match fetched {
                Err(_) => {
                    status = RunStatus::TimedOut;
                    break;
                }
                Ok(Err(e)) => {
                    error!(run_id = %run.id, page, error = %e, "Failed to fetch upstream page");
                    run.errors += 1;
                    status = RunStatus::Failed;
                    break;
                }
                Ok(Ok(batch)) => batch,
            };

            debug!(page, loads = batch.loads.len(), more = batch.more_available, "Fetched page");

            for load in &batch.loads {
                if Instant::now() >= deadline {
                    status = RunStatus::TimedOut;
                    break 'pages;
                }

                run.records_scanned += 1;
                if !load.has_equipment() {
                    run.records_skipped += 1;
                    continue;
                }

                if let Err(e) = self.reconcile_load(load, &mut run).await {
                    warn!(
                        run_id = %run.id,
                        reference = %load.reference_number,
                        error = %e,
                        "Failed to reconcile load"
                    );
                    run.errors += 1;
                }
            }

            if !batch.more_available || batch.loads.is_empty() {
                break;
            }

            page += 1;
            if !self.page_delay.is_zero() {
                tokio::time::sleep(self.page_delay).await;
            }
        }

        run.finish(status, Utc::now());
        self.store.save_reconciliation_run(&run).await?;

        info!(
            run_id = %run.id,
            status = ?run.status,
            scanned = run.records_scanned,
            created = run.records_created,
            updated = run.records_updated,
            skipped = run.records_skipped,
            discrepancies = run.discrepancies,
            errors = run.errors,
            "Reconciliation finished"
        );

        self.alert(&run).await;
        Ok(run)
    }

    async fn reconcile_load(
        &self,
        load: &UpstreamLoad,
        run: &mut ReconciliationRun,
    ) -> Result<(), MutationError> {
        let now = Utc::now();
        let store = self.store.as_ref();

        let Some(local) = store.find_by_reference(&load.reference_number).await? else {
            let record = build_record_from_upstream(load, now);
            let description = format!("Shipment created by reconciliation ({})", record.status.label());
            match create_shipment(store, record, description, EventSource::Reconciliation, now)
                .await?
            {
                CreateOutcome::Created { .. } => run.records_created += 1,
                CreateOutcome::AlreadyExists => {
                    debug!(reference = %load.reference_number, "Record appeared concurrently");
                }
            }
            return Ok(());
        };

        if let Some(remote_status) = reported_status(load).filter(|s| *s != local.status) {
            run.discrepancies += 1;
            info!(
                reference = %load.reference_number,
                local = %local.status,
                upstream = %remote_status,
                "Status drift detected"
            );
        }

        let outcome = mutate_shipment(
            store,
            &load.reference_number,
            EventSource::Reconciliation,
            now,
            |record| {
                let previous = record.status;
                if !apply_upstream(record, load) {
                    return None;
                }
                Some(if previous != record.status {
                    format!(
                        "Status corrected from {} to {} by reconciliation",
                        previous.label(),
                        record.status.label()
                    )
                } else {
                    "Shipment details corrected by reconciliation".to_string()
                })
            },
        )
        .await?;

        if let MutationOutcome::Applied { .. } = outcome {
            run.records_updated += 1;
        }
        Ok(())
    }

    async fn alert(&self, run: &ReconciliationRun) {
        if run.discrepancies > self.alert_threshold {
            raise(
                self.notifier.as_ref(),
                Alert::new(
                    AlertKind::ReconciliationDrift,
                    format!(
                        "Reconciliation found {} status discrepancies (threshold {})",
                        run.discrepancies, self.alert_threshold
                    ),
                    json!({
                        "run_id": run.id,
                        "discrepancies": run.discrepancies,
                        "threshold": self.alert_threshold,
                    }),
                ),
            )
            .await;
        }

        let (kind, message) = match run.status {
            RunStatus::Failed => (AlertKind::ReconciliationFailed, "Reconciliation run failed"),
            RunStatus::TimedOut => (
                AlertKind::ReconciliationTimedOut,
                "Reconciliation run ran out of time before covering every load",
            ),
            _ => return,
        };
        raise(
            self.notifier.as_ref(),
            Alert::new(
                kind,
                message,
                json!({
                    "run_id": run.id,
                    "records_scanned": run.records_scanned,
                    "errors": run.errors,
                    "budget_secs": self.budget.as_secs(),
                }),
            ),
        )
        .await;
    }
}
