//! loadsync worker - in-process scheduler.
//!
//! Runs the DLQ retry sweep and the reconciliation job on their configured
//! intervals, for deployments without an external cron calling `/cron/*`.
//! Reconciliation is lock-guarded, so running several workers is safe.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `LOADSYNC_CONFIG`: path to the TOML config (default `config/loadsync.toml`)
//! - `LOADSYNC_WORKER_NAME`: worker identifier for logs (default: hostname or UUID)
//! - `RUST_LOG`: log filter (default `info`)

use anyhow::Context;
use chrono::Utc;
use std::env;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use loadsync::reconcile::ReconcileError;
use loadsync::shipment::RunTrigger;
use loadsync::shutdown::ShutdownSignal;
use loadsync::{SyncConfig, SyncContext};

/// Get the worker name from environment or generate one.
fn get_worker_name() -> String {
    if let Ok(name) = env::var("LOADSYNC_WORKER_NAME") {
        return name;
    }

    if let Ok(hostname) = hostname::get() {
        if let Some(name) = hostname.to_str() {
            return format!("worker-{name}");
        }
    }

    format!("worker-{}", uuid::Uuid::new_v4())
}

async fn retry_tick(ctx: &SyncContext, worker: &str) {
    match ctx.retry.run_due(Utc::now()).await {
        Ok(summary) if summary.attempted > 0 => info!(
            worker,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Retry sweep complete"
        ),
        Ok(_) => {}
        Err(e) => error!(worker, error = %e, "Retry sweep failed"),
    }
}

async fn reconcile_tick(ctx: &SyncContext, worker: &str) {
    match ctx.reconciler.run(RunTrigger::Scheduled).await {
        Ok(run) => info!(
            worker,
            run_id = %run.id,
            status = ?run.status,
            discrepancies = run.discrepancies,
            "Scheduled reconciliation complete"
        ),
        Err(ReconcileError::AlreadyRunning) => {
            info!(worker, "Reconciliation running elsewhere, skipping tick")
        }
        Err(e) => error!(worker, error = %e, "Scheduled reconciliation failed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let worker = get_worker_name();
    let config = SyncConfig::load().context("failed to load configuration")?;
    let retry_every = Duration::from_secs(config.retry.interval_secs.max(1));
    let reconcile_every = Duration::from_secs(config.reconcile.interval_secs.max(1));

    let ctx = SyncContext::connect(config)
        .await
        .context("failed to initialize sync engine")?;

    info!(
        worker = %worker,
        retry_interval_secs = retry_every.as_secs(),
        reconcile_interval_secs = reconcile_every.as_secs(),
        "Worker started"
    );

    let shutdown = ShutdownSignal::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { shutdown.listen().await }
    });

    let mut retry_timer = interval(retry_every);
    retry_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reconcile_timer = interval(reconcile_every);
    reconcile_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = retry_timer.tick() => retry_tick(&ctx, &worker).await,
            _ = reconcile_timer.tick() => reconcile_tick(&ctx, &worker).await,
        }
    }

    info!(worker = %worker, "Worker stopped");
    Ok(())
}
