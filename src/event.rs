//! Webhook envelope and typed TMS events.
//!
//! The TMS posts a loosely shaped JSON envelope:
//!
//! ```json
//! {
//!   "event_type": "load.status_updated",
//!   "reference_number": "REF-1",
//!   "data": { "status": "In Transit", "updated_at": "2025-03-07T10:00:00Z" },
//!   "changedValues": { "status": "Out for delivery" }
//! }
//! ```
//!
//! Older deliveries use `eventType` instead of `event_type`, and may carry
//! the reference number inside `data`. [`WebhookEnvelope::parse`] absorbs
//! those differences; [`TmsEvent::decode`] turns the envelope into a tagged
//! union with one validated payload per category. Categories this engine
//! does not know become [`TmsEvent::Unknown`] and are acknowledged as no-ops.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

use crate::upstream::UpstreamLoad;

/// Payload keys that may carry the reference number.
const REFERENCE_KEYS: [&str; 3] = ["reference_number", "referenceNumber", "customId"];

/// Payload keys that may carry the event timestamp, in priority order.
const OCCURRED_AT_KEYS: [&str; 5] = [
    "occurred_at",
    "occurredAt",
    "updated_at",
    "updatedAt",
    "lastUpdatedOn",
];

/// Errors raised while reading a webhook body.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("envelope is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope has no event type")]
    MissingEventType,

    #[error("{event_type} event has no reference number")]
    MissingReference { event_type: String },

    #[error("invalid {event_type} payload: {reason}")]
    InvalidPayload { event_type: String, reason: String },
}

impl EventError {
    /// The delivery names no record, so there is nothing to apply or retry.
    pub fn is_unaddressed(&self) -> bool {
        matches!(self, EventError::MissingReference { .. })
    }
}

/// Event categories handled by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LoadCreated,
    StatusUpdated,
    InfoUpdated,
    EquipmentUpdated,
    DocumentAdded,
    TenderStatusChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::LoadCreated,
        EventKind::StatusUpdated,
        EventKind::InfoUpdated,
        EventKind::EquipmentUpdated,
        EventKind::DocumentAdded,
        EventKind::TenderStatusChanged,
    ];

    /// Canonical wire name (e.g. `load.status_updated`).
    pub fn canonical(&self) -> &'static str {
        match self {
            EventKind::LoadCreated => "load.created",
            EventKind::StatusUpdated => "load.status_updated",
            EventKind::InfoUpdated => "load.info_updated",
            EventKind::EquipmentUpdated => "load.equipment_updated",
            EventKind::DocumentAdded => "load.document_added",
            EventKind::TenderStatusChanged => "load.tender_status_changed",
        }
    }

    /// Recognize an event type string in any of its historical spellings.
    ///
    /// `load.status_updated`, `LOAD_STATUS_UPDATED`, `LoadStatusUpdated` and
    /// `status-updated` all resolve to [`EventKind::StatusUpdated`].
    pub fn from_type(raw: &str) -> Option<EventKind> {
        let normalized = normalize_type(raw);
        let name = normalized.strip_prefix("load_").unwrap_or(&normalized);

        match name {
            "created" | "load_created" => Some(EventKind::LoadCreated),
            "status_updated" | "status_update" | "status_changed" => {
                Some(EventKind::StatusUpdated)
            }
            "info_updated" | "dates_updated" | "details_updated" => Some(EventKind::InfoUpdated),
            "equipment_updated" | "container_updated" => Some(EventKind::EquipmentUpdated),
            "document_added" | "document_uploaded" => Some(EventKind::DocumentAdded),
            "tender_status_changed" | "tender_updated" | "tender_status_updated" => {
                Some(EventKind::TenderStatusChanged)
            }
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical())
    }
}

/// Lowercase, split camelCase, and fold separators into `_`.
fn normalize_type(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut previous_lower = false;

    for c in raw.trim().chars() {
        if matches!(c, '.' | '-' | ' ' | '_' | ':' | '/') {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            previous_lower = false;
            continue;
        }

        if c.is_uppercase() && previous_lower && !out.ends_with('_') {
            out.push('_');
        }
        previous_lower = c.is_lowercase() || c.is_ascii_digit();
        out.extend(c.to_lowercase());
    }

    out.trim_end_matches('_').to_string()
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    event_type: Option<String>,

    #[serde(default, rename = "eventType")]
    event_type_legacy: Option<String>,

    #[serde(default)]
    data: Option<Value>,

    #[serde(default, rename = "changedValues")]
    changed_values: Option<Value>,

    #[serde(default)]
    reference_number: Option<Value>,

    #[serde(default)]
    occurred_at: Option<String>,
}

/// A parsed webhook body, before category-specific validation.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEnvelope {
    /// Event type exactly as sent
    pub event_type: String,

    pub reference_number: Option<String>,

    /// Best-effort event timestamp
    pub occurred_at: Option<String>,

    /// `data` overlaid with `changedValues`
    pub payload: Map<String, Value>,
}

impl WebhookEnvelope {
    /// Parse a raw webhook body.
    pub fn parse(raw: &[u8]) -> Result<Self, EventError> {
        let envelope: RawEnvelope = serde_json::from_slice(raw)?;

        let event_type = envelope
            .event_type
            .or(envelope.event_type_legacy)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(EventError::MissingEventType)?;

        let mut payload = match envelope.data {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if let Some(Value::Object(changed)) = envelope.changed_values {
            payload.extend(changed);
        }

        let reference_number = envelope
            .reference_number
            .as_ref()
            .and_then(value_as_string)
            .or_else(|| {
                REFERENCE_KEYS
                    .iter()
                    .find_map(|key| payload.get(*key).and_then(value_as_string))
            });

        let occurred_at = OCCURRED_AT_KEYS
            .iter()
            .find_map(|key| payload.get(*key).and_then(value_as_string))
            .or(envelope.occurred_at.filter(|t| !t.trim().is_empty()));

        Ok(Self {
            event_type,
            reference_number,
            occurred_at,
            payload,
        })
    }

    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_type(&self.event_type)
    }

    /// Canonical name for known categories, the lowercased raw type otherwise.
    pub fn canonical_type(&self) -> String {
        self.kind()
            .map(|k| k.canonical().to_string())
            .unwrap_or_else(|| self.event_type.to_lowercase())
    }
}

/// Strings pass through; numbers are rendered; empty and other values are dropped.
fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `load.status_updated` payload. Either field may be absent; a
/// location-only update leaves the status alone.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusUpdate {
    pub reference_number: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "currentLocation")]
    pub location: Option<String>,
}

/// `load.info_updated` payload: route and dates.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InfoUpdate {
    pub reference_number: String,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default, alias = "pickupDate")]
    pub pickup_date: Option<String>,
    #[serde(default, alias = "deliveryDate")]
    pub delivery_date: Option<String>,
}

/// `load.equipment_updated` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EquipmentUpdate {
    pub reference_number: String,
    #[serde(default, alias = "containerNumber")]
    pub container_number: Option<String>,
    #[serde(default, alias = "equipmentType")]
    pub equipment_type: Option<String>,
    #[serde(default, alias = "sealNumber")]
    pub seal_number: Option<String>,
}

/// `load.document_added` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DocumentAdded {
    pub reference_number: String,
    #[serde(default, alias = "documentType")]
    pub document_type: String,
    #[serde(default, alias = "documentName")]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// `load.tender_status_changed` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TenderStatusChange {
    pub reference_number: String,
    #[serde(default, alias = "tenderStatus")]
    pub tender_status: String,
}

/// A validated TMS event.
#[derive(Debug, Clone, PartialEq)]
pub enum TmsEvent {
    LoadCreated(UpstreamLoad),
    StatusUpdated(StatusUpdate),
    InfoUpdated(InfoUpdate),
    EquipmentUpdated(EquipmentUpdate),
    DocumentAdded(DocumentAdded),
    TenderStatusChanged(TenderStatusChange),
    Unknown { event_type: String },
}

impl TmsEvent {
    /// Validate an envelope against its category's schema.
    pub fn decode(envelope: &WebhookEnvelope) -> Result<Self, EventError> {
        let Some(kind) = envelope.kind() else {
            return Ok(TmsEvent::Unknown {
                event_type: envelope.event_type.clone(),
            });
        };

        let reference = envelope
            .reference_number
            .clone()
            .ok_or_else(|| EventError::MissingReference {
                event_type: kind.canonical().to_string(),
            })?;

        // Normalize the reference under one key so aliased fields don't collide.
        let mut payload = envelope.payload.clone();
        for key in REFERENCE_KEYS {
            payload.remove(key);
        }
        payload.insert("reference_number".to_string(), Value::String(reference));

        let event = match kind {
            EventKind::LoadCreated => TmsEvent::LoadCreated(from_payload(kind, payload)?),
            EventKind::StatusUpdated => TmsEvent::StatusUpdated(from_payload(kind, payload)?),
            EventKind::InfoUpdated => TmsEvent::InfoUpdated(from_payload(kind, payload)?),
            EventKind::EquipmentUpdated => {
                TmsEvent::EquipmentUpdated(from_payload(kind, payload)?)
            }
            EventKind::DocumentAdded => TmsEvent::DocumentAdded(from_payload(kind, payload)?),
            EventKind::TenderStatusChanged => {
                TmsEvent::TenderStatusChanged(from_payload(kind, payload)?)
            }
        };

        Ok(event)
    }

    pub fn kind(&self) -> Option<EventKind> {
        match self {
            TmsEvent::LoadCreated(_) => Some(EventKind::LoadCreated),
            TmsEvent::StatusUpdated(_) => Some(EventKind::StatusUpdated),
            TmsEvent::InfoUpdated(_) => Some(EventKind::InfoUpdated),
            TmsEvent::EquipmentUpdated(_) => Some(EventKind::EquipmentUpdated),
            TmsEvent::DocumentAdded(_) => Some(EventKind::DocumentAdded),
            TmsEvent::TenderStatusChanged(_) => Some(EventKind::TenderStatusChanged),
            TmsEvent::Unknown { .. } => None,
        }
    }

    pub fn reference_number(&self) -> Option<&str> {
        match self {
            TmsEvent::LoadCreated(load) => Some(&load.reference_number),
            TmsEvent::StatusUpdated(e) => Some(&e.reference_number),
            TmsEvent::InfoUpdated(e) => Some(&e.reference_number),
            TmsEvent::EquipmentUpdated(e) => Some(&e.reference_number),
            TmsEvent::DocumentAdded(e) => Some(&e.reference_number),
            TmsEvent::TenderStatusChanged(e) => Some(&e.reference_number),
            TmsEvent::Unknown { .. } => None,
        }
    }

    /// Event type label for logs and responses.
    pub fn type_name(&self) -> &str {
        match self {
            TmsEvent::Unknown { event_type } => event_type,
            other => other.kind().map(|k| k.canonical()).unwrap_or_default(),
        }
    }
}

fn from_payload<T: DeserializeOwned>(
    kind: EventKind,
    payload: Map<String, Value>,
) -> Result<T, EventError> {
    serde_json::from_value(Value::Object(payload)).map_err(|e| EventError::InvalidPayload {
        event_type: kind.canonical().to_string(),
        reason: e.to_string(),
    })
}
