//! Event handlers.
//!
//! One handler per TMS event category. Each one translates a validated
//! [`TmsEvent`] into a versioned mutation of the local record store through
//! [`crate::mutation`], so every handler is idempotent: re-applying the same
//! event leaves the record untouched and writes no audit entry.
//!
//! ## Built-in Handlers
//!
//! - [`LoadCreatedHandler`]: creates the record (or refreshes it if it exists)
//! - [`StatusUpdatedHandler`]: maps the upstream status and location
//! - [`InfoUpdatedHandler`]: route and dates
//! - [`EquipmentUpdatedHandler`]: container, equipment type and seal
//! - [`DocumentAddedHandler`]: attaches document references
//! - [`TenderStatusChangedHandler`]: tender state, including cancellation
//!
//! Update events for a reference number with no local record are no-ops;
//! the reconciliation job creates the record on its next sweep. Payloads
//! that are well formed but leave out the field a handler acts on (a blank
//! tender status, a document without a type) are acknowledged and skipped
//! rather than parked, since no retry can fill the field in.

pub mod details;
pub mod document;
pub mod load;
pub mod status;
pub mod tender;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::event::{EventKind, TmsEvent};
use crate::mutation::{MutationError, MutationOutcome};
use crate::shipment::EventSource;
use crate::store::StoreError;

pub use details::{EquipmentUpdatedHandler, InfoUpdatedHandler};
pub use document::DocumentAddedHandler;
pub use load::LoadCreatedHandler;
pub use status::StatusUpdatedHandler;
pub use tender::TenderStatusChangedHandler;

/// Errors that can occur while handling an event.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Concurrent writers kept winning the compare-and-swap
    #[error("record {reference} is contended ({attempts} attempts)")]
    Conflict { reference: String, attempts: u32 },

    /// The payload can never be applied; retrying will not help
    #[error("invalid {event_type} payload: {reason}")]
    InvalidPayload { event_type: String, reason: String },
}

impl HandlerError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::InvalidPayload { .. })
    }

    pub(crate) fn unexpected(handler: &str, event: &TmsEvent) -> Self {
        HandlerError::InvalidPayload {
            event_type: event.type_name().to_string(),
            reason: format!("routed to the {handler} handler"),
        }
    }
}

impl From<MutationError> for HandlerError {
    fn from(err: MutationError) -> Self {
        match err {
            MutationError::Store(e) => HandlerError::Store(e),
            MutationError::Conflict {
                reference,
                attempts,
            } => HandlerError::Conflict {
                reference,
                attempts,
            },
        }
    }
}

/// What a handler did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerAction {
    Created,
    Updated,
    Unchanged,
    /// Nothing applied: no local record, or the payload carried nothing usable
    Skipped,
}

/// Result of a successful handler run.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerOutcome {
    pub handler: String,
    pub reference_number: String,
    pub action: HandlerAction,
    pub message: String,
}

impl HandlerOutcome {
    pub fn new(
        handler: &str,
        reference_number: &str,
        action: HandlerAction,
        message: impl Into<String>,
    ) -> Self {
        Self {
            handler: handler.to_string(),
            reference_number: reference_number.to_string(),
            action,
            message: message.into(),
        }
    }

    /// Describe a [`MutationOutcome`].
    pub(crate) fn from_mutation(handler: &str, reference: &str, outcome: &MutationOutcome) -> Self {
        match outcome {
            MutationOutcome::Applied { event, .. } => {
                Self::new(handler, reference, HandlerAction::Updated, &event.description)
            }
            MutationOutcome::Unchanged { .. } => {
                Self::new(handler, reference, HandlerAction::Unchanged, "already up to date")
            }
            MutationOutcome::Missing => Self::new(
                handler,
                reference,
                HandlerAction::Skipped,
                "no local record, left for reconciliation",
            ),
        }
    }
}

/// A handler for one event category.
///
/// Handlers must be `Send + Sync`; the router shares them across tasks.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Short handler name for logs (e.g. "status-updated")
    fn name(&self) -> &str;

    /// The category this handler owns.
    fn kind(&self) -> EventKind;

    /// Apply the event. `source` records whether it arrived by webhook or retry.
    async fn handle(
        &self,
        event: &TmsEvent,
        source: EventSource,
    ) -> Result<HandlerOutcome, HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_invalid_payload_is_permanent() {
        let invalid = HandlerError::InvalidPayload {
            event_type: "load.created".to_string(),
            reason: "missing field".to_string(),
        };
        assert!(invalid.is_permanent());

        let conflict = HandlerError::Conflict {
            reference: "REF-1".to_string(),
            attempts: 3,
        };
        assert!(!conflict.is_permanent());
        assert!(!HandlerError::Store(StoreError::Unavailable("down".into())).is_permanent());
    }

    #[test]
    fn test_mutation_conflict_converts() {
        let err: HandlerError = MutationError::Conflict {
            reference: "REF-1".to_string(),
            attempts: 3,
        }
        .into();
        assert!(matches!(err, HandlerError::Conflict { attempts: 3, .. }));
    }
}
