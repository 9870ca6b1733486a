//! `load.tender_status_changed` handler.
//!
//! Tender state is the only route to [`ShipmentStatus::Cancelled`]. A
//! cancelling tender state cancels the shipment; a later non-cancelling one
//! puts a cancelled shipment back to booked.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use super::{EventHandler, HandlerAction, HandlerError, HandlerOutcome};
use crate::event::{EventKind, TmsEvent};
use crate::mutation::{mutate_shipment, MutationOutcome};
use crate::shipment::{is_cancelled_tender, EventSource};
use crate::status::ShipmentStatus;
use crate::store::ShipmentStore;

pub struct TenderStatusChangedHandler {
    store: Arc<dyn ShipmentStore>,
}

impl TenderStatusChangedHandler {
    pub fn new(store: Arc<dyn ShipmentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for TenderStatusChangedHandler {
    fn name(&self) -> &str {
        "tender-status-changed"
    }

    fn kind(&self) -> EventKind {
        EventKind::TenderStatusChanged
    }

    async fn handle(
        &self,
        event: &TmsEvent,
        source: EventSource,
    ) -> Result<HandlerOutcome, HandlerError> {
        let TmsEvent::TenderStatusChanged(change) = event else {
            return Err(HandlerError::unexpected(self.name(), event));
        };

        let tender_status = change.tender_status.trim().to_string();
        if tender_status.is_empty() {
            warn!(reference = %change.reference_number, "Tender change without a tender status, skipping");
            return Ok(HandlerOutcome::new(
                self.name(),
                &change.reference_number,
                HandlerAction::Skipped,
                "no tender status in payload",
            ));
        }
        let cancelled = is_cancelled_tender(&tender_status);

        let outcome = mutate_shipment(
            self.store.as_ref(),
            &change.reference_number,
            source,
            Utc::now(),
            |record| {
                let tender_changed = record.tender_status.as_deref() != Some(tender_status.as_str());
                record.tender_status = Some(tender_status.clone());

                if cancelled && record.status != ShipmentStatus::Cancelled {
                    record.status = ShipmentStatus::Cancelled;
                    Some(format!("Shipment cancelled (tender {tender_status})"))
                } else if !cancelled && record.status == ShipmentStatus::Cancelled {
                    record.status = ShipmentStatus::Booked;
                    Some(format!("Shipment reinstated (tender {tender_status})"))
                } else if tender_changed {
                    Some(format!("Tender status changed to {tender_status}"))
                } else {
                    None
                }
            },
        )
        .await?;

        if let MutationOutcome::Applied { record, .. } = &outcome {
            info!(
                reference = %record.reference_number,
                tender_status = %tender_status,
                status = %record.status,
                "Tender status applied"
            );
        }

        Ok(HandlerOutcome::from_mutation(
            self.name(),
            &change.reference_number,
            &outcome,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TenderStatusChange;
    use crate::handlers::{HandlerAction, LoadCreatedHandler};
    use crate::store::MemoryStore;
    use crate::upstream::UpstreamLoad;

    fn tender(status: &str) -> TmsEvent {
        TmsEvent::TenderStatusChanged(TenderStatusChange {
            reference_number: "REF-1".to_string(),
            tender_status: status.to_string(),
        })
    }

    async fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        LoadCreatedHandler::new(store.clone())
            .handle(&TmsEvent::LoadCreated(UpstreamLoad::new("REF-1")), EventSource::Webhook)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_rejected_tender_cancels() {
        let store = seeded().await;
        let handler = TenderStatusChangedHandler::new(store.clone());

        let outcome = handler.handle(&tender("Rejected"), EventSource::Webhook).await.unwrap();
        assert_eq!(outcome.message, "Shipment cancelled (tender Rejected)");

        let record = store.find_by_reference("REF-1").await.unwrap().unwrap();
        assert_eq!(record.status, ShipmentStatus::Cancelled);
        assert_eq!(record.tender_status.as_deref(), Some("Rejected"));

        let again = handler.handle(&tender("Rejected"), EventSource::Webhook).await.unwrap();
        assert_eq!(again.action, HandlerAction::Unchanged);
    }

    #[tokio::test]
    async fn test_accepted_tender_reinstates() {
        let store = seeded().await;
        let handler = TenderStatusChangedHandler::new(store.clone());

        handler.handle(&tender("Cancelled"), EventSource::Webhook).await.unwrap();
        handler.handle(&tender("Accepted"), EventSource::Webhook).await.unwrap();

        let record = store.find_by_reference("REF-1").await.unwrap().unwrap();
        assert_eq!(record.status, ShipmentStatus::Booked);
    }

    #[tokio::test]
    async fn test_blank_tender_status_is_skipped() {
        let store = seeded().await;
        let handler = TenderStatusChangedHandler::new(store.clone());

        let outcome = handler.handle(&tender(" "), EventSource::Webhook).await.unwrap();
        assert_eq!(outcome.action, HandlerAction::Skipped);

        let record = store.find_by_reference("REF-1").await.unwrap().unwrap();
        assert_eq!(record.status, ShipmentStatus::Booked);
        assert_eq!(record.tender_status, None);
    }

    #[tokio::test]
    async fn test_non_cancelling_change_keeps_status() {
        let store = seeded().await;
        let handler = TenderStatusChangedHandler::new(store.clone());

        let outcome = handler.handle(&tender("Accepted"), EventSource::Webhook).await.unwrap();
        assert_eq!(outcome.message, "Tender status changed to Accepted");

        let record = store.find_by_reference("REF-1").await.unwrap().unwrap();
        assert_eq!(record.status, ShipmentStatus::Booked);
    }
}
