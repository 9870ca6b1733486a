//! `load.status_updated` handler.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use super::{EventHandler, HandlerAction, HandlerError, HandlerOutcome};
use crate::event::{EventKind, TmsEvent};
use crate::mutation::{mutate_shipment, MutationOutcome};
use crate::shipment::{overwrite, EventSource};
use crate::status::map_upstream_status;
use crate::store::ShipmentStore;

pub struct StatusUpdatedHandler {
    store: Arc<dyn ShipmentStore>,
}

impl StatusUpdatedHandler {
    pub fn new(store: Arc<dyn ShipmentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for StatusUpdatedHandler {
    fn name(&self) -> &str {
        "status-updated"
    }

    fn kind(&self) -> EventKind {
        EventKind::StatusUpdated
    }

    async fn handle(
        &self,
        event: &TmsEvent,
        source: EventSource,
    ) -> Result<HandlerOutcome, HandlerError> {
        let TmsEvent::StatusUpdated(update) = event else {
            return Err(HandlerError::unexpected(self.name(), event));
        };

        let upstream_status = update
            .status
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if upstream_status.is_none() && update.location.is_none() {
            warn!(
                reference = %update.reference_number,
                "Status update carries neither status nor location, skipping"
            );
            return Ok(HandlerOutcome::new(
                self.name(),
                &update.reference_number,
                HandlerAction::Skipped,
                "no status or location in payload",
            ));
        }
        let mapped = upstream_status.map(map_upstream_status);

        let outcome = mutate_shipment(
            self.store.as_ref(),
            &update.reference_number,
            source,
            Utc::now(),
            |record| {
                let previous = record.status;
                let next = mapped.unwrap_or(previous);
                record.status = next;
                let moved = overwrite(&mut record.current_location, &update.location);

                match (previous != next, moved) {
                    (true, _) => Some(format!(
                        "Status changed from {} to {}",
                        previous.label(),
                        next.label()
                    )),
                    (false, true) => Some(format!(
                        "Location updated to {}",
                        record.current_location.as_deref().unwrap_or_default()
                    )),
                    (false, false) => None,
                }
            },
        )
        .await?;

        if let MutationOutcome::Applied { record, .. } = &outcome {
            info!(
                reference = %record.reference_number,
                upstream_status = upstream_status.unwrap_or_default(),
                status = %record.status,
                "Shipment status updated"
            );
        }

        Ok(HandlerOutcome::from_mutation(
            self.name(),
            &update.reference_number,
            &outcome,
        ))
    }
}
