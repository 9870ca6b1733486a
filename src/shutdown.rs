//! Graceful shutdown coordination.
//!
//! [`ShutdownSignal`] is shared by the HTTP server and the worker loops.
//! One task calls [`ShutdownSignal::listen`] to turn SIGINT/SIGTERM into a
//! trigger; every component awaits [`ShutdownSignal::recv`], which also
//! returns immediately if shutdown already happened.
//! [`ShutdownSignal::grace_expired`] bounds how long draining may take.
//!
//! # Example
//!
//! ```rust,ignore
//! use loadsync::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! tokio::spawn({
//!     let shutdown = shutdown.clone();
//!     async move { shutdown.listen().await }
//! });
//!
//! loop {
//!     tokio::select! {
//!         _ = shutdown.recv() => break,
//!         _ = ticker.tick() => { /* ... */ }
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Grace period for in-flight work once shutdown starts.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
    timeout: Duration,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGINT or SIGTERM, then trigger shutdown.
    pub async fn listen(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
            _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
        }

        self.trigger();
    }

    /// Resolve once the grace period has run out after shutdown started.
    pub async fn grace_expired(&self) {
        self.recv().await;
        tokio::time::sleep(self.timeout).await;
    }

    /// Resolve once shutdown has been triggered.
    pub async fn recv(&self) {
        let mut receiver = self.sender.subscribe();
        if self.is_shutdown() {
            return;
        }
        // Lagged or closed both mean the signal already fired.
        let _ = receiver.recv().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Trigger shutdown programmatically.
    pub fn trigger(&self) {
        if !self.triggered.swap(true, Ordering::SeqCst) {
            info!("Shutdown triggered");
        }
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeout() {
        assert_eq!(ShutdownSignal::new().timeout(), Duration::from_secs(30));
        let signal = ShutdownSignal::with_timeout(Duration::from_secs(5));
        assert_eq!(signal.timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.recv().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.trigger();

        let joined = tokio::time::timeout(Duration::from_millis(500), handle).await;
        assert!(joined.is_ok());
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_grace_period_starts_at_trigger() {
        let signal = ShutdownSignal::with_timeout(Duration::from_millis(50));

        // Not triggered: the grace period never starts.
        let idle = tokio::time::timeout(Duration::from_millis(100), signal.grace_expired()).await;
        assert!(idle.is_err());

        signal.trigger();
        let expired = tokio::time::timeout(Duration::from_millis(500), signal.grace_expired()).await;
        assert!(expired.is_ok());
    }

    #[tokio::test]
    async fn test_recv_after_trigger_returns_immediately() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutdown());
        signal.trigger();

        let result = tokio::time::timeout(Duration::from_millis(100), signal.recv()).await;
        assert!(result.is_ok());
    }
}
