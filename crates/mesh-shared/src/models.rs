//! Data model shared by the adapters, the pipeline and the store layout

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Destination address meaning "every node on the channel"
pub const BROADCAST_ADDR: u32 = 0xffff_ffff;

/// Mesh node number
///
/// Transports disagree on signedness: the JSON feed reports `from` as a signed
/// 32-bit integer while protobuf packets carry it as `fixed32`. Both are the
/// same 32 bits, so the node number is always kept unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Interpret a wire value that may be signed 32-bit or unsigned 32-bit
    ///
    /// Returns `None` when the value fits neither representation.
    pub fn from_wire(value: i64) -> Option<Self> {
        if (i32::MIN as i64..0).contains(&value) {
            Some(Self(value as i32 as u32))
        } else {
            u32::try_from(value).ok().map(Self)
        }
    }

    /// Parse the `!0a1b2c3d` form used for gateway ids
    pub fn parse_hex(value: &str) -> Option<Self> {
        let digits = value.strip_prefix('!')?;
        u32::from_str_radix(digits, 16).ok().map(Self)
    }

    /// Format as `!0a1b2c3d`
    pub fn hex(&self) -> String {
        format!("!{:08x}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Semantic label assigned to an accepted event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CanonicalType {
    Position,
    DeviceMetrics,
    EnvironmentMetrics,
    Message,
    User,
    DeviceMetadata,
    RangeTest,
}

impl CanonicalType {
    /// Field name used in the node state hash
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalType::Position => "position",
            CanonicalType::DeviceMetrics => "deviceMetrics",
            CanonicalType::EnvironmentMetrics => "environmentMetrics",
            CanonicalType::Message => "message",
            CanonicalType::User => "user",
            CanonicalType::DeviceMetadata => "deviceMetadata",
            CanonicalType::RangeTest => "rangeTest",
        }
    }

    /// Series key prefix for types that keep a history, `None` otherwise
    pub fn series_name(&self) -> Option<&'static str> {
        match self {
            CanonicalType::Position => Some("gps"),
            CanonicalType::DeviceMetrics => Some("deviceMetrics"),
            CanonicalType::EnvironmentMetrics => Some("environmentMetrics"),
            CanonicalType::Message => Some("messages"),
            CanonicalType::DeviceMetadata => Some("deviceMetadata"),
            CanonicalType::User | CanonicalType::RangeTest => None,
        }
    }
}

impl fmt::Display for CanonicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "position" => Ok(CanonicalType::Position),
            "deviceMetrics" => Ok(CanonicalType::DeviceMetrics),
            "environmentMetrics" => Ok(CanonicalType::EnvironmentMetrics),
            "message" => Ok(CanonicalType::Message),
            "user" => Ok(CanonicalType::User),
            "deviceMetadata" => Ok(CanonicalType::DeviceMetadata),
            "rangeTest" => Ok(CanonicalType::RangeTest),
            other => Err(format!("Unsupported event type: {}", other)),
        }
    }
}

/// A packet received from one endpoint, after transport decoding
///
/// Serialized field names follow the mesh client conventions (`from`, `id`,
/// `data`) so stored node state keeps the shape downstream readers expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    /// Label of the endpoint the packet arrived through
    pub source_endpoint: String,
    /// Full transport topic, when the endpoint is topic based
    pub full_topic: Option<String>,
    pub topic_channel: Option<String>,
    pub topic_user: Option<String>,
    pub event_name: String,
    pub event_type: String,
    #[serde(rename = "data")]
    pub payload: serde_json::Value,
    #[serde(rename = "from")]
    pub origin_id: NodeId,
    pub to: Option<u32>,
    #[serde(rename = "id")]
    pub message_id: Option<u32>,
    pub gateway_id: Option<String>,
    pub hop_limit: Option<u32>,
    pub rx_rssi: Option<i32>,
    pub rx_snr: Option<f32>,
    /// Server receive time
    pub timestamp: DateTime<Utc>,
}

impl RawEvent {
    /// Point-to-point packets carry a concrete destination
    pub fn is_direct(&self) -> bool {
        matches!(self.to, Some(to) if to != BROADCAST_ADDR)
    }

    /// Discriminator embedded in telemetry payloads (`data.variant.case`)
    pub fn variant_case(&self) -> Option<&str> {
        self.payload
            .get("variant")
            .and_then(|v| v.get("case"))
            .and_then(|c| c.as_str())
    }
}

/// Uniform envelope emitted by every source adapter
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub event_name: String,
    pub event_type: String,
    /// `None` when the frame decoded to something that is not a packet object
    pub raw: Option<RawEvent>,
}

impl Envelope {
    pub fn new(raw: RawEvent) -> Self {
        Self {
            event_name: raw.event_name.clone(),
            event_type: raw.event_type.clone(),
            raw: Some(raw),
        }
    }

    /// Envelope for a frame whose body was not a usable packet
    pub fn empty(event_name: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            event_type: event_type.into(),
            raw: None,
        }
    }
}
