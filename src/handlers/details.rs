//! `load.info_updated` and `load.equipment_updated` handlers.
//!
//! Both overwrite descriptive fields with whatever the event carries and
//! leave omitted fields alone.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use super::{EventHandler, HandlerError, HandlerOutcome};
use crate::event::{EventKind, TmsEvent};
use crate::mutation::mutate_shipment;
use crate::shipment::{overwrite, EventSource};
use crate::store::ShipmentStore;

/// Route and schedule changes.
pub struct InfoUpdatedHandler {
    store: Arc<dyn ShipmentStore>,
}

impl InfoUpdatedHandler {
    pub fn new(store: Arc<dyn ShipmentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for InfoUpdatedHandler {
    fn name(&self) -> &str {
        "info-updated"
    }

    fn kind(&self) -> EventKind {
        EventKind::InfoUpdated
    }

    async fn handle(
        &self,
        event: &TmsEvent,
        source: EventSource,
    ) -> Result<HandlerOutcome, HandlerError> {
        let TmsEvent::InfoUpdated(info) = event else {
            return Err(HandlerError::unexpected(self.name(), event));
        };

        let outcome = mutate_shipment(
            self.store.as_ref(),
            &info.reference_number,
            source,
            Utc::now(),
            |record| {
                let mut changed = Vec::new();
                if overwrite(&mut record.origin, &info.origin) {
                    changed.push("origin");
                }
                if overwrite(&mut record.destination, &info.destination) {
                    changed.push("destination");
                }
                if overwrite(&mut record.pickup_date, &info.pickup_date) {
                    changed.push("pickup date");
                }
                if overwrite(&mut record.delivery_date, &info.delivery_date) {
                    changed.push("delivery date");
                }
                describe("Shipment details updated", &changed)
            },
        )
        .await?;

        Ok(HandlerOutcome::from_mutation(
            self.name(),
            &info.reference_number,
            &outcome,
        ))
    }
}

/// Container, equipment type and seal changes.
pub struct EquipmentUpdatedHandler {
    store: Arc<dyn ShipmentStore>,
}

impl EquipmentUpdatedHandler {
    pub fn new(store: Arc<dyn ShipmentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for EquipmentUpdatedHandler {
    fn name(&self) -> &str {
        "equipment-updated"
    }

    fn kind(&self) -> EventKind {
        EventKind::EquipmentUpdated
    }

    async fn handle(
        &self,
        event: &TmsEvent,
        source: EventSource,
    ) -> Result<HandlerOutcome, HandlerError> {
        let TmsEvent::EquipmentUpdated(equipment) = event else {
            return Err(HandlerError::unexpected(self.name(), event));
        };

        let outcome = mutate_shipment(
            self.store.as_ref(),
            &equipment.reference_number,
            source,
            Utc::now(),
            |record| {
                let mut changed = Vec::new();
                if overwrite(&mut record.container_number, &equipment.container_number) {
                    changed.push("container");
                }
                if overwrite(&mut record.equipment_type, &equipment.equipment_type) {
                    changed.push("equipment type");
                }
                if overwrite(&mut record.seal_number, &equipment.seal_number) {
                    changed.push("seal");
                }
                describe("Equipment updated", &changed)
            },
        )
        .await?;

        Ok(HandlerOutcome::from_mutation(
            self.name(),
            &equipment.reference_number,
            &outcome,
        ))
    }
}

fn describe(prefix: &str, changed: &[&str]) -> Option<String> {
    if changed.is_empty() {
        None
    } else {
        Some(format!("{prefix}: {}", changed.join(", ")))
    }
}
