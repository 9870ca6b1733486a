//! `load.document_added` handler.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

use super::{EventHandler, HandlerAction, HandlerError, HandlerOutcome};
use crate::event::{EventKind, TmsEvent};
use crate::mutation::mutate_shipment;
use crate::shipment::{DocumentRef, EventSource};
use crate::store::ShipmentStore;

/// Attaches a document reference. The same document twice is a no-op.
pub struct DocumentAddedHandler {
    store: Arc<dyn ShipmentStore>,
}

impl DocumentAddedHandler {
    pub fn new(store: Arc<dyn ShipmentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for DocumentAddedHandler {
    fn name(&self) -> &str {
        "document-added"
    }

    fn kind(&self) -> EventKind {
        EventKind::DocumentAdded
    }

    async fn handle(
        &self,
        event: &TmsEvent,
        source: EventSource,
    ) -> Result<HandlerOutcome, HandlerError> {
        let TmsEvent::DocumentAdded(added) = event else {
            return Err(HandlerError::unexpected(self.name(), event));
        };

        let document_type = added.document_type.trim();
        if document_type.is_empty() {
            warn!(reference = %added.reference_number, "Document without a type, skipping");
            return Ok(HandlerOutcome::new(
                self.name(),
                &added.reference_number,
                HandlerAction::Skipped,
                "no document type in payload",
            ));
        }

        let document = DocumentRef {
            document_type: document_type.to_string(),
            name: added.name.clone(),
            url: added.url.clone(),
        };

        let outcome = mutate_shipment(
            self.store.as_ref(),
            &added.reference_number,
            source,
            Utc::now(),
            |record| {
                if record.documents.contains(&document) {
                    return None;
                }
                record.documents.push(document.clone());
                Some(match &document.name {
                    Some(name) => format!("Document added: {} ({name})", document.document_type),
                    None => format!("Document added: {}", document.document_type),
                })
            },
        )
        .await?;

        Ok(HandlerOutcome::from_mutation(
            self.name(),
            &added.reference_number,
            &outcome,
        ))
    }
}
