//! Mesh packet protobuf messages
//!
//! Hand-maintained subset of the Meshtastic schema. Only the fields consumed
//! by the pipeline are declared; prost skips unknown fields on decode. Enum
//! fields are kept as raw `i32` values.

use serde::Serialize;

/// Envelope published by MQTT gateways on `.../2/e/...` and `.../2/map/` topics
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceEnvelope {
    #[prost(message, optional, tag = "1")]
    pub packet: Option<MeshPacket>,
    #[prost(string, tag = "2")]
    pub channel_id: String,
    #[prost(string, tag = "3")]
    pub gateway_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MeshPacket {
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
    #[prost(bool, tag = "14")]
    pub via_mqtt: bool,
    #[prost(uint32, tag = "15")]
    pub hop_start: u32,
    #[prost(oneof = "mesh_packet::PayloadVariant", tags = "4, 5")]
    pub payload_variant: Option<mesh_packet::PayloadVariant>,
}

pub mod mesh_packet {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "4")]
        Decoded(super::Data),
        /// Channel-encrypted payload, not decodable without the channel key
        #[prost(bytes, tag = "5")]
        Encrypted(Vec<u8>),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Data {
    #[prost(int32, tag = "1")]
    pub portnum: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
}

#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    #[prost(sfixed32, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude_i: Option<i32>,
    #[prost(sfixed32, optional, tag = "2")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude_i: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<i32>,
    #[prost(fixed32, tag = "4")]
    pub time: u32,
    #[prost(uint32, optional, tag = "15")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ground_speed: Option<u32>,
    #[prost(uint32, optional, tag = "16")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ground_track: Option<u32>,
    #[prost(uint32, tag = "19")]
    pub sats_in_view: u32,
    #[prost(uint32, tag = "23")]
    pub precision_bits: u32,
}

#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
    #[prost(int32, tag = "5")]
    pub hw_model: i32,
    #[prost(bool, tag = "6")]
    pub is_licensed: bool,
    #[prost(int32, tag = "7")]
    pub role: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Telemetry {
    #[prost(fixed32, tag = "1")]
    pub time: u32,
    #[prost(oneof = "telemetry::Variant", tags = "2, 3")]
    pub variant: Option<telemetry::Variant>,
}

pub mod telemetry {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Variant {
        #[prost(message, tag = "2")]
        DeviceMetrics(super::DeviceMetrics),
        #[prost(message, tag = "3")]
        EnvironmentMetrics(super::EnvironmentMetrics),
    }
}

#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetrics {
    #[prost(uint32, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<u32>,
    #[prost(float, optional, tag = "2")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f32>,
    #[prost(float, optional, tag = "3")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_utilization: Option<f32>,
    #[prost(float, optional, tag = "4")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub air_util_tx: Option<f32>,
    #[prost(uint32, optional, tag = "5")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u32>,
}

#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentMetrics {
    #[prost(float, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[prost(float, optional, tag = "2")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_humidity: Option<f32>,
    #[prost(float, optional, tag = "3")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barometric_pressure: Option<f32>,
    #[prost(float, optional, tag = "4")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_resistance: Option<f32>,
    #[prost(float, optional, tag = "5")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f32>,
    #[prost(float, optional, tag = "6")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<f32>,
    #[prost(uint32, optional, tag = "7")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iaq: Option<u32>,
}

/// Routing control message, only the error branch of its oneof is read
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Routing {
    #[prost(int32, optional, tag = "3")]
    pub error_reason: Option<i32>,
}

#[derive(Clone, PartialEq, Serialize, ::prost::Message)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetadata {
    #[prost(string, tag = "1")]
    pub firmware_version: String,
    #[prost(uint32, tag = "2")]
    pub device_state_version: u32,
    #[prost(bool, tag = "4")]
    pub has_wifi: bool,
    #[prost(bool, tag = "5")]
    pub has_bluetooth: bool,
    #[prost(bool, tag = "6")]
    pub has_ethernet: bool,
    #[prost(int32, tag = "7")]
    pub role: i32,
    #[prost(int32, tag = "9")]
    pub hw_model: i32,
}

/// Frame read from a node's HTTP `fromradio` endpoint
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FromRadio {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(oneof = "from_radio::PayloadVariant", tags = "2, 3, 13")]
    pub payload_variant: Option<from_radio::PayloadVariant>,
}

pub mod from_radio {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "2")]
        Packet(super::MeshPacket),
        #[prost(message, tag = "3")]
        MyInfo(super::MyNodeInfo),
        #[prost(message, tag = "13")]
        Metadata(super::DeviceMetadata),
    }
}

/// Frame written to a node's HTTP `toradio` endpoint
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ToRadio {
    /// Asks the node to replay its configuration, including `my_info`
    #[prost(uint32, optional, tag = "3")]
    pub want_config_id: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MyNodeInfo {
    #[prost(uint32, tag = "1")]
    pub my_node_num: u32,
}

/// Application port numbers
pub mod port {
    pub const TEXT_MESSAGE: i32 = 1;
    pub const POSITION: i32 = 3;
    pub const NODEINFO: i32 = 4;
    pub const ROUTING: i32 = 5;
    pub const STORE_FORWARD: i32 = 65;
    pub const RANGE_TEST: i32 = 66;
    pub const TELEMETRY: i32 = 67;
}

/// Name of a routing error reason
pub fn routing_error_name(reason: i32) -> &'static str {
    match reason {
        0 => "NONE",
        1 => "NO_ROUTE",
        2 => "GOT_NAK",
        3 => "TIMEOUT",
        4 => "NO_INTERFACE",
        5 => "MAX_RETRANSMIT",
        6 => "NO_CHANNEL",
        7 => "TOO_LARGE",
        8 => "NO_RESPONSE",
        9 => "DUTY_CYCLE_LIMIT",
        32 => "BAD_REQUEST",
        33 => "NOT_AUTHORIZED",
        _ => "UNKNOWN",
    }
}
