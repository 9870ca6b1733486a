//! loadsync HTTP server.
//!
//! Serves the webhook endpoint, the admin surface and the cron triggers.
//!
//! ## Configuration
//!
//! - `LOADSYNC_CONFIG`: path to the TOML config (default `config/loadsync.toml`)
//! - `RUST_LOG`: log filter (default `info`)
//!
//! Secrets in the config file are usually `${VAR}` placeholders; a `.env`
//! file is loaded first if present.

use anyhow::Context;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use loadsync::server::build_app;
use loadsync::shutdown::ShutdownSignal;
use loadsync::{SyncConfig, SyncContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = SyncConfig::load().context("failed to load configuration")?;
    let port = config.server.port;
    let grace = Duration::from_secs(config.server.shutdown_grace_secs);

    let ctx = SyncContext::connect(config)
        .await
        .context("failed to initialize sync engine")?;
    let app = build_app(Arc::new(ctx));

    let shutdown = ShutdownSignal::with_timeout(grace);
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { shutdown.listen().await }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(%addr, version = env!("CARGO_PKG_VERSION"), "loadsync server listening");

    let server = axum::serve(listener, app).with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move { shutdown.recv().await }
    });

    tokio::select! {
        result = server.into_future() => result.context("server error")?,
        _ = shutdown.grace_expired() => {
            warn!(grace_secs = grace.as_secs(), "In-flight requests did not drain in time, exiting");
        }
    }

    info!("loadsync server stopped");
    Ok(())
}
