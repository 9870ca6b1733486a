//! Event Router - dispatches TMS events to their handlers.
//!
//! Every [`EventKind`] has exactly one handler. Events whose type is not
//! recognized arrive as [`TmsEvent::Unknown`] and are acknowledged without
//! touching the store.
//!
//! # Architecture
//!
//! ```text
//! TmsEvent::StatusUpdated
//!     │
//!     ▼
//! ┌─────────────────────────────────────────┐
//! │            ROUTER                       │
//! │                                         │
//! │  1. kind() = StatusUpdated              │
//! │  2. handlers[StatusUpdated]? YES        │
//! │  3. Execute: StatusUpdatedHandler       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use loadsync::router::Router;
//! use loadsync::shipment::EventSource;
//!
//! let router = Router::standard(store);
//! let dispatched = router.dispatch(&event, EventSource::Webhook).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::event::{EventKind, TmsEvent};
use crate::handlers::{
    DocumentAddedHandler, EquipmentUpdatedHandler, EventHandler, HandlerError, HandlerOutcome,
    InfoUpdatedHandler, LoadCreatedHandler, StatusUpdatedHandler, TenderStatusChangedHandler,
};
use crate::shipment::EventSource;
use crate::store::ShipmentStore;

/// Errors that can occur during routing.
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("handler '{handler}' failed: {source}")]
    HandlerFailed {
        handler: String,
        #[source]
        source: HandlerError,
    },
}

impl RouterError {
    /// True when retrying the same event cannot succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            RouterError::HandlerFailed { source, .. } => source.is_permanent(),
        }
    }
}

/// Result of dispatching an event.
#[derive(Debug, Clone)]
pub enum DispatchResult {
    Handled(HandlerOutcome),
    /// Unrecognized event type, acknowledged as a no-op
    Ignored { event_type: String },
    /// Known category with no registered handler
    Unrouted { kind: EventKind },
}

impl DispatchResult {
    pub fn outcome(&self) -> Option<&HandlerOutcome> {
        match self {
            DispatchResult::Handled(outcome) => Some(outcome),
            _ => None,
        }
    }
}

/// Maps event categories to handlers.
///
/// Wrap in `Arc` to share across tasks.
pub struct Router {
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl Router {
    /// Create a router with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// A router with a handler for every known category.
    pub fn standard(store: Arc<dyn ShipmentStore>) -> Self {
        let mut router = Self::new();
        router.on(Arc::new(LoadCreatedHandler::new(store.clone())));
        router.on(Arc::new(StatusUpdatedHandler::new(store.clone())));
        router.on(Arc::new(InfoUpdatedHandler::new(store.clone())));
        router.on(Arc::new(EquipmentUpdatedHandler::new(store.clone())));
        router.on(Arc::new(DocumentAddedHandler::new(store.clone())));
        router.on(Arc::new(TenderStatusChangedHandler::new(store)));
        router
    }

    /// Register a handler for the category it declares, replacing any
    /// previous one.
    pub fn on(&mut self, handler: Arc<dyn EventHandler>) {
        debug!(
            kind = %handler.kind(),
            handler = %handler.name(),
            "Registering event handler"
        );
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn has_handler(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Canonical names of the routed categories, sorted.
    pub fn event_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.handlers.keys().map(|k| k.canonical()).collect();
        types.sort_unstable();
        types
    }

    /// Dispatch an event to its handler.
    pub async fn dispatch(
        &self,
        event: &TmsEvent,
        source: EventSource,
    ) -> Result<DispatchResult, RouterError> {
        let Some(kind) = event.kind() else {
            info!(
                event_type = %event.type_name(),
                "Ignoring unrecognized event type"
            );
            return Ok(DispatchResult::Ignored {
                event_type: event.type_name().to_string(),
            });
        };

        let Some(handler) = self.handlers.get(&kind) else {
            warn!(kind = %kind, "No handler registered for event kind");
            return Ok(DispatchResult::Unrouted { kind });
        };

        debug!(
            kind = %kind,
            reference = event.reference_number().unwrap_or_default(),
            source = ?source,
            "Dispatching event"
        );

        match handler.handle(event, source).await {
            Ok(outcome) => {
                info!(
                    kind = %kind,
                    handler = %handler.name(),
                    reference = %outcome.reference_number,
                    action = ?outcome.action,
                    message = %outcome.message,
                    "Event handled"
                );
                Ok(DispatchResult::Handled(outcome))
            }
            Err(e) => {
                let error = RouterError::HandlerFailed {
                    handler: handler.name().to_string(),
                    source: e,
                };
                warn!(
                    kind = %kind,
                    error = %error,
                    permanent = error.is_permanent(),
                    "Event handler failed"
                );
                Err(error)
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
