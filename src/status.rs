//! Status Mapper.
//!
//! Translates the TMS's free-text status vocabulary into [`ShipmentStatus`].
//! The webhook handlers and the reconciliation job both go through
//! [`map_upstream_status`], so the two paths never disagree on the same input.
//!
//! # Vocabulary
//!
//! Matching is case-insensitive and treats `_`, `-`, `.`, `/` and runs of
//! whitespace as a single space.
//!
//! ```text
//! Upstream value                                   | Internal
//! -------------------------------------------------|------------------
//! new, quote, tendered, accepted, covered, booked, | booked
//! planned, dispatched, assigned                    |
//! at port, at terminal, arrived at port,           | at_port
//! discharged, available, at pickup,                |
//! arrived at pickup                                |
//! picked up, loaded, departed, en route,           | in_transit
//! en route to delivery, in transit, on rail        |
//! out for delivery, at delivery,                   | out_for_delivery
//! arrived at delivery, at consignee                |
//! delivered, completed, pod received,              | delivered
//! proof of delivery, empty returned                |
//! anything else                                    | booked
//! ```
//!
//! `cancelled` is deliberately not part of this table: it is reached only
//! through tender state (see [`crate::shipment::resolve_status`]).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Internal shipment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    Booked,
    AtPort,
    InTransit,
    OutForDelivery,
    Delivered,
    /// Terminal for practical purposes; only set from tender state.
    Cancelled,
}

impl ShipmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShipmentStatus::Booked => "booked",
            ShipmentStatus::AtPort => "at_port",
            ShipmentStatus::InTransit => "in_transit",
            ShipmentStatus::OutForDelivery => "out_for_delivery",
            ShipmentStatus::Delivered => "delivered",
            ShipmentStatus::Cancelled => "cancelled",
        }
    }

    /// Human-readable label used in audit event descriptions.
    pub fn label(&self) -> &'static str {
        match self {
            ShipmentStatus::Booked => "Booked",
            ShipmentStatus::AtPort => "At port",
            ShipmentStatus::InTransit => "In transit",
            ShipmentStatus::OutForDelivery => "Out for delivery",
            ShipmentStatus::Delivered => "Delivered",
            ShipmentStatus::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The documented upstream vocabulary, in normalized form.
pub const STATUS_VOCABULARY: &[(&str, ShipmentStatus)] = &[
    ("new", ShipmentStatus::Booked),
    ("quote", ShipmentStatus::Booked),
    ("tendered", ShipmentStatus::Booked),
    ("accepted", ShipmentStatus::Booked),
    ("covered", ShipmentStatus::Booked),
    ("booked", ShipmentStatus::Booked),
    ("planned", ShipmentStatus::Booked),
    ("dispatched", ShipmentStatus::Booked),
    ("assigned", ShipmentStatus::Booked),
    ("at port", ShipmentStatus::AtPort),
    ("at terminal", ShipmentStatus::AtPort),
    ("arrived at port", ShipmentStatus::AtPort),
    ("discharged", ShipmentStatus::AtPort),
    ("available", ShipmentStatus::AtPort),
    ("at pickup", ShipmentStatus::AtPort),
    ("arrived at pickup", ShipmentStatus::AtPort),
    ("picked up", ShipmentStatus::InTransit),
    ("loaded", ShipmentStatus::InTransit),
    ("departed", ShipmentStatus::InTransit),
    ("en route", ShipmentStatus::InTransit),
    ("en route to delivery", ShipmentStatus::InTransit),
    ("in transit", ShipmentStatus::InTransit),
    ("on rail", ShipmentStatus::InTransit),
    ("out for delivery", ShipmentStatus::OutForDelivery),
    ("at delivery", ShipmentStatus::OutForDelivery),
    ("arrived at delivery", ShipmentStatus::OutForDelivery),
    ("at consignee", ShipmentStatus::OutForDelivery),
    ("delivered", ShipmentStatus::Delivered),
    ("completed", ShipmentStatus::Delivered),
    ("pod received", ShipmentStatus::Delivered),
    ("proof of delivery", ShipmentStatus::Delivered),
    ("empty returned", ShipmentStatus::Delivered),
];

/// Map an upstream status string to the internal enum.
///
/// Total: unrecognized input maps to [`ShipmentStatus::Booked`], never to
/// `Delivered`.
pub fn map_upstream_status(raw: &str) -> ShipmentStatus {
    let normalized = normalize(raw);

    STATUS_VOCABULARY
        .iter()
        .find(|(term, _)| *term == normalized)
        .map(|(_, status)| *status)
        .unwrap_or(ShipmentStatus::Booked)
}

fn normalize(raw: &str) -> String {
    raw.to_lowercase()
        .split(|c: char| c.is_whitespace() || matches!(c, '_' | '-' | '.' | '/'))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERNAL_STATES: [ShipmentStatus; 5] = [
        ShipmentStatus::Booked,
        ShipmentStatus::AtPort,
        ShipmentStatus::InTransit,
        ShipmentStatus::OutForDelivery,
        ShipmentStatus::Delivered,
    ];

    #[test]
    fn test_every_vocabulary_term_maps_to_a_defined_state() {
        for (term, expected) in STATUS_VOCABULARY {
            let mapped = map_upstream_status(term);
            assert_eq!(mapped, *expected, "term {term:?}");
            assert!(INTERNAL_STATES.contains(&mapped));
        }
    }

    #[test]
    fn test_vocabulary_has_no_duplicate_terms() {
        let mut terms: Vec<&str> = STATUS_VOCABULARY.iter().map(|(t, _)| *t).collect();
        terms.sort_unstable();
        let before = terms.len();
        terms.dedup();
        assert_eq!(before, terms.len());
    }

    #[test]
    fn test_unrecognized_maps_to_booked() {
        assert_eq!(map_upstream_status("teleported"), ShipmentStatus::Booked);
        assert_eq!(map_upstream_status(""), ShipmentStatus::Booked);
        assert_eq!(map_upstream_status("cancelled"), ShipmentStatus::Booked);
    }

    #[test]
    fn test_normalization() {
        assert_eq!(map_upstream_status("IN_TRANSIT"), ShipmentStatus::InTransit);
        assert_eq!(map_upstream_status("  Out-For-Delivery "), ShipmentStatus::OutForDelivery);
        assert_eq!(map_upstream_status("Picked  Up"), ShipmentStatus::InTransit);
        assert_eq!(map_upstream_status("en.route"), ShipmentStatus::InTransit);
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&ShipmentStatus::OutForDelivery).unwrap();
        assert_eq!(json, "\"out_for_delivery\"");
        assert_eq!(ShipmentStatus::AtPort.to_string(), "at_port");
    }
}
