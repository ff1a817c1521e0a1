//! Event classification
//!
//! Maps an envelope to a canonical event type or a rejection. Rules are
//! evaluated in order and the first match wins:
//!
//! 1. JSON transport frames are rejected
//! 2. Envelopes without a packet are rejected
//! 3. Banned origins are rejected
//! 4. Origins below the validity threshold are rejected with a warning
//! 5. Routing traffic (acks, pings) is rejected
//! 6. Store-and-forward traffic is rejected
//! 7. Otherwise the type is derived from the event type, the payload variant
//!    and finally the event name

use mesh_shared::{CanonicalType, ClassifierRules, RawEvent};
use std::fmt;
use tracing::warn;

/// Event name that always classifies as a range test
const RANGE_TEST_EVENT: &str = "onRangeTestPacket";

/// Event name that always classifies as a text message
const MESSAGE_EVENT: &str = "onMessagePacket";

/// Why an event was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    JsonTransport,
    MissingEvent,
    BannedOrigin,
    InvalidOrigin,
    Routing,
    StoreForward,
    Unsupported(String),
}

impl RejectReason {
    /// Short label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::JsonTransport => "json_transport",
            RejectReason::MissingEvent => "missing_event",
            RejectReason::BannedOrigin => "banned_origin",
            RejectReason::InvalidOrigin => "invalid_origin",
            RejectReason::Routing => "routing",
            RejectReason::StoreForward => "store_forward",
            RejectReason::Unsupported(_) => "unsupported",
        }
    }

    /// Rejections that are reported with a warning
    pub fn is_warning(&self) -> bool {
        matches!(self, RejectReason::InvalidOrigin)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Unsupported(kind) => write!(f, "unsupported({})", kind),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Classification outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Accepted(CanonicalType),
    Rejected(RejectReason),
}

impl Classification {
    pub fn accepted(&self) -> Option<CanonicalType> {
        match self {
            Classification::Accepted(kind) => Some(*kind),
            Classification::Rejected(_) => None,
        }
    }
}

/// Classify an inbound event
///
/// Side-effect free apart from the warning emitted for invalid origins.
pub fn classify(
    event_name: &str,
    event_type: &str,
    raw: Option<&RawEvent>,
    rules: &ClassifierRules,
) -> Classification {
    if event_type == "json" {
        return Classification::Rejected(RejectReason::JsonTransport);
    }

    let Some(raw) = raw else {
        return Classification::Rejected(RejectReason::MissingEvent);
    };

    let origin = raw.origin_id.0;

    if rules.banned_ids.contains(&origin) {
        return Classification::Rejected(RejectReason::BannedOrigin);
    }

    if origin < rules.min_valid_id {
        warn!(
            origin_id = origin,
            event_name = event_name,
            endpoint = %raw.source_endpoint,
            "Rejected event from invalid origin id"
        );
        return Classification::Rejected(RejectReason::InvalidOrigin);
    }

    let base = lower_first(event_type);

    if base == "routing" {
        return Classification::Rejected(RejectReason::Routing);
    }

    if event_name == rules.store_forward_marker {
        return Classification::Rejected(RejectReason::StoreForward);
    }

    let mut kind = base;
    if let Some(case @ ("deviceMetrics" | "environmentMetrics")) = raw.variant_case() {
        kind = case.to_string();
    }
    match event_name {
        RANGE_TEST_EVENT => kind = CanonicalType::RangeTest.as_str().to_string(),
        MESSAGE_EVENT => kind = CanonicalType::Message.as_str().to_string(),
        _ => {}
    }

    match kind.parse::<CanonicalType>() {
        Ok(kind) => Classification::Accepted(kind),
        Err(_) => Classification::Rejected(RejectReason::Unsupported(kind)),
    }
}

fn lower_first(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
