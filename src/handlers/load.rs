//! `load.created` handler.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use super::{EventHandler, HandlerAction, HandlerError, HandlerOutcome};
use crate::event::{EventKind, TmsEvent};
use crate::mutation::{create_shipment, mutate_shipment, CreateOutcome};
use crate::shipment::{apply_upstream, build_record_from_upstream, EventSource};
use crate::store::ShipmentStore;

/// Creates the local record for a new load.
///
/// If the record already exists (a redelivery, or reconciliation got there
/// first) the upstream fields are applied to it instead.
pub struct LoadCreatedHandler {
    store: Arc<dyn ShipmentStore>,
}

impl LoadCreatedHandler {
    pub fn new(store: Arc<dyn ShipmentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for LoadCreatedHandler {
    fn name(&self) -> &str {
        "load-created"
    }

    fn kind(&self) -> EventKind {
        EventKind::LoadCreated
    }

    async fn handle(
        &self,
        event: &TmsEvent,
        source: EventSource,
    ) -> Result<HandlerOutcome, HandlerError> {
        let TmsEvent::LoadCreated(load) = event else {
            return Err(HandlerError::unexpected(self.name(), event));
        };

        let now = Utc::now();
        let record = build_record_from_upstream(load, now);
        let description = format!("Shipment created ({})", record.status.label());

        match create_shipment(self.store.as_ref(), record, description, source, now).await? {
            CreateOutcome::Created { record, event } => {
                info!(
                    reference = %record.reference_number,
                    tracking_id = %record.tracking_id,
                    status = %record.status,
                    "Shipment created"
                );
                Ok(HandlerOutcome::new(
                    self.name(),
                    &record.reference_number,
                    HandlerAction::Created,
                    event.description,
                ))
            }
            CreateOutcome::AlreadyExists => {
                let outcome = mutate_shipment(
                    self.store.as_ref(),
                    &load.reference_number,
                    source,
                    now,
                    |record| {
                        apply_upstream(record, load)
                            .then(|| "Shipment refreshed from load creation".to_string())
                    },
                )
                .await?;
                Ok(HandlerOutcome::from_mutation(
                    self.name(),
                    &load.reference_number,
                    &outcome,
                ))
            }
        }
    }
}
