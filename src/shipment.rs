//! Shipment records, audit events and reconciliation run summaries.
//!
//! The local store owns persistence; this module owns the identity rules.
//! At most one [`ShipmentRecord`] exists per upstream reference number and
//! records are never deleted, only moved between statuses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::{map_upstream_status, ShipmentStatus};
use crate::upstream::UpstreamLoad;

/// Which path produced a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Webhook,
    Retry,
    Reconciliation,
}

/// A document attached to a shipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub document_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// The local record for one upstream load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentRecord {
    /// Internal tracking identifier, generated once at creation
    pub tracking_id: String,

    /// Upstream reference number (identity key)
    pub reference_number: String,

    pub status: ShipmentStatus,

    #[serde(default)]
    pub container_number: Option<String>,
    #[serde(default)]
    pub equipment_type: Option<String>,
    #[serde(default)]
    pub seal_number: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub pickup_date: Option<String>,
    #[serde(default)]
    pub delivery_date: Option<String>,
    #[serde(default)]
    pub current_location: Option<String>,
    #[serde(default)]
    pub tender_status: Option<String>,
    #[serde(default)]
    pub documents: Vec<DocumentRef>,

    /// Optimistic concurrency counter, bumped by the store on every update
    #[serde(default)]
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit entry written alongside each accepted mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentEvent {
    pub id: String,
    pub tracking_id: String,
    pub reference_number: String,
    pub status: ShipmentStatus,
    pub description: String,
    pub source: EventSource,
    pub recorded_at: DateTime<Utc>,
}

impl ShipmentEvent {
    pub fn new(
        record: &ShipmentRecord,
        description: impl Into<String>,
        source: EventSource,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracking_id: record.tracking_id.clone(),
            reference_number: record.reference_number.clone(),
            status: record.status,
            description: description.into(),
            source,
            recorded_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    TimedOut,
    Failed,
}

/// Summary of one reconciliation sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub id: String,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_scanned: u64,
    pub records_created: u64,
    pub records_updated: u64,
    pub records_skipped: u64,
    pub discrepancies: u64,
    pub errors: u64,
}

impl ReconciliationRun {
    pub fn start(trigger: RunTrigger, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            trigger,
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            records_scanned: 0,
            records_created: 0,
            records_updated: 0,
            records_skipped: 0,
            discrepancies: 0,
            errors: 0,
        }
    }

    pub fn finish(&mut self, status: RunStatus, completed_at: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(completed_at);
    }
}

/// Generate a new internal tracking identifier (`LS-` + 10 characters).
pub fn generate_tracking_id() -> String {
    let raw = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("LS-{}", &raw[..10])
}

/// True for tender states that take a load out of service.
pub fn is_cancelled_tender(tender_status: &str) -> bool {
    matches!(
        tender_status.trim().to_lowercase().as_str(),
        "cancelled" | "canceled" | "rejected" | "declined"
    )
}

/// The status an upstream representation actually reports, if any.
///
/// Tender cancellation wins; otherwise a non-blank `status` goes through the
/// Status Mapper. `None` when the representation says nothing about status.
pub fn reported_status(load: &UpstreamLoad) -> Option<ShipmentStatus> {
    if load.tender_status.as_deref().is_some_and(is_cancelled_tender) {
        return Some(ShipmentStatus::Cancelled);
    }

    load.status
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(map_upstream_status)
}

/// Resolve the internal status for a new record.
///
/// A representation without a status starts out `booked`.
pub fn resolve_status(load: &UpstreamLoad) -> ShipmentStatus {
    reported_status(load).unwrap_or(ShipmentStatus::Booked)
}

/// Build a brand-new record from an upstream representation.
///
/// Shared by the `load.created` handler and the reconciliation job.
pub fn build_record_from_upstream(load: &UpstreamLoad, now: DateTime<Utc>) -> ShipmentRecord {
    ShipmentRecord {
        tracking_id: generate_tracking_id(),
        reference_number: load.reference_number.clone(),
        status: resolve_status(load),
        container_number: non_empty(&load.container_number),
        equipment_type: non_empty(&load.equipment_type),
        seal_number: non_empty(&load.seal_number),
        origin: non_empty(&load.origin),
        destination: non_empty(&load.destination),
        pickup_date: non_empty(&load.pickup_date),
        delivery_date: non_empty(&load.delivery_date),
        current_location: non_empty(&load.current_location),
        tender_status: non_empty(&load.tender_status),
        documents: Vec::new(),
        version: 0,
        created_at: now,
        updated_at: now,
    }
}

/// Overwrite mutable fields with the upstream values.
///
/// Fields the upstream representation omits are left alone. Returns whether
/// anything changed.
pub fn apply_upstream(record: &mut ShipmentRecord, load: &UpstreamLoad) -> bool {
    let mut changed = false;

    if let Some(status) = reported_status(load) {
        if record.status != status {
            record.status = status;
            changed = true;
        }
    }

    changed |= overwrite(&mut record.container_number, &load.container_number);
    changed |= overwrite(&mut record.equipment_type, &load.equipment_type);
    changed |= overwrite(&mut record.seal_number, &load.seal_number);
    changed |= overwrite(&mut record.origin, &load.origin);
    changed |= overwrite(&mut record.destination, &load.destination);
    changed |= overwrite(&mut record.pickup_date, &load.pickup_date);
    changed |= overwrite(&mut record.delivery_date, &load.delivery_date);
    changed |= overwrite(&mut record.current_location, &load.current_location);
    changed |= overwrite(&mut record.tender_status, &load.tender_status);

    changed
}

/// Set `field` to `value` when `value` is present and different.
pub(crate) fn overwrite(field: &mut Option<String>, value: &Option<String>) -> bool {
    match non_empty(value) {
        Some(v) if field.as_deref() != Some(v.as_str()) => {
            *field = Some(v);
            true
        }
        _ => false,
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
