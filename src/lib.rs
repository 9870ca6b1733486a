//! # loadsync
//!
//! Keeps a local shipment store consistent with an upstream Transportation
//! Management System (TMS).
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────── webhook path ────────────────┐
//! TMS ──POST──► WebhookReceiver ──► Router ──► handlers ──► local store
//!                     │ failure                       ▲
//!                     ▼                               │
//!                    DLQ ──────► RetryDriver ─────────┘
//!
//! TMS ◄──GET pages── Reconciler ──────────────────────────► local store
//! ```
//!
//! ## Modules
//!
//! - [`event`]: webhook envelope and typed events
//! - [`router`] / [`handlers`]: dispatch and per-category mutations
//! - [`ingest`]: the webhook receiver
//! - [`idempotency`], [`signature`]: delivery-level guards
//! - [`dlq`], [`retry`]: failure capture and scheduled recovery
//! - [`reconcile`], [`upstream`], [`status`]: periodic convergence with the TMS
//! - [`store`]: Redis and in-memory storage behind traits
//! - [`server`], [`context`], [`config`], [`shutdown`]: process plumbing

pub mod config;
pub mod context;
pub mod dlq;
pub mod event;
pub mod handlers;
pub mod health;
pub mod idempotency;
pub mod ingest;
pub mod mutation;
pub mod notify;
pub mod reconcile;
pub mod retry;
pub mod router;
pub mod server;
pub mod shipment;
pub mod shutdown;
pub mod signature;
pub mod status;
pub mod store;
pub mod upstream;

// Re-export commonly used types at crate root
pub use config::SyncConfig;
pub use context::SyncContext;
pub use event::{EventKind, TmsEvent, WebhookEnvelope};
pub use handlers::{EventHandler, HandlerError, HandlerOutcome};
pub use router::Router;
pub use shipment::{ShipmentEvent, ShipmentRecord};
pub use status::{map_upstream_status, ShipmentStatus};
