//! Packet decoding
//!
//! Turns opaque transport bytes into structured packets. The pipeline only
//! sees the [`PacketDecoder`] trait; [`MeshtasticDecoder`] is the protobuf
//! implementation used in production.

pub mod proto;

use prost::Message;
use serde_json::{json, Value};
use thiserror::Error;

/// Decode failures
///
/// Messages are matched against the suppression deny-list by substring, so
/// routing failures carry the error reason name.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),

    #[error("json decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("routing error: {0}")]
    Routing(String),
}

/// A decoded mesh packet
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    pub event_name: String,
    pub event_type: String,
    pub from: u32,
    pub to: u32,
    pub id: u32,
    pub channel_id: Option<String>,
    pub gateway_id: Option<String>,
    pub hop_limit: u32,
    pub rx_rssi: i32,
    pub rx_snr: f32,
    pub payload: Value,
}

/// A decoded direct-feed frame
#[derive(Debug, Clone, PartialEq)]
pub enum FromRadioFrame {
    Packet(DecodedPacket),
    /// Node number of the node serving the feed
    MyNodeNum(u32),
    /// Device metadata of the node serving the feed
    Metadata(Value),
    /// Anything the pipeline does not consume
    Other,
}

/// Bytes to structured packet collaborator
pub trait PacketDecoder: Send + Sync {
    /// Decode a gateway service envelope
    ///
    /// `Ok(None)` means the frame is valid but carries nothing to process
    /// (encrypted payload, unhandled port).
    fn decode_envelope(&self, bytes: &[u8]) -> Result<Option<DecodedPacket>, DecodeError>;

    /// Decode one frame read from a node's HTTP API
    fn decode_from_radio(&self, bytes: &[u8]) -> Result<FromRadioFrame, DecodeError>;
}

/// Protobuf decoder for Meshtastic packets
#[derive(Debug, Default, Clone, Copy)]
pub struct MeshtasticDecoder;

impl MeshtasticDecoder {
    pub fn new() -> Self {
        Self
    }

    fn decode_mesh_packet(
        &self,
        packet: proto::MeshPacket,
        channel_id: Option<String>,
        gateway_id: Option<String>,
    ) -> Result<Option<DecodedPacket>, DecodeError> {
        let data = match packet.payload_variant {
            Some(proto::mesh_packet::PayloadVariant::Decoded(data)) => data,
            Some(proto::mesh_packet::PayloadVariant::Encrypted(_)) | None => return Ok(None),
        };

        let Some((event_name, event_type, payload)) = decode_port(&data)? else {
            return Ok(None);
        };

        Ok(Some(DecodedPacket {
            event_name: event_name.to_string(),
            event_type: event_type.to_string(),
            from: packet.from,
            to: packet.to,
            id: packet.id,
            channel_id,
            gateway_id,
            hop_limit: packet.hop_limit,
            rx_rssi: packet.rx_rssi,
            rx_snr: packet.rx_snr,
            payload,
        }))
    }
}

/// Decode the application payload of a port
fn decode_port(data: &proto::Data) -> Result<Option<(&'static str, &'static str, Value)>, DecodeError> {
    let bytes = data.payload.as_slice();

    let decoded = match data.portnum {
        proto::port::TEXT_MESSAGE => (
            "onMessagePacket",
            "string",
            Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ),
        proto::port::RANGE_TEST => (
            "onRangeTestPacket",
            "string",
            Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ),
        proto::port::POSITION => {
            let position = proto::Position::decode(bytes)?;
            ("onPositionPacket", "Position", serde_json::to_value(position)?)
        }
        proto::port::NODEINFO => {
            let user = proto::User::decode(bytes)?;
            ("onUserPacket", "User", serde_json::to_value(user)?)
        }
        proto::port::TELEMETRY => {
            let telemetry = proto::Telemetry::decode(bytes)?;
            let variant = match telemetry.variant {
                Some(proto::telemetry::Variant::DeviceMetrics(metrics)) => {
                    json!({"case": "deviceMetrics", "value": serde_json::to_value(metrics)?})
                }
                Some(proto::telemetry::Variant::EnvironmentMetrics(metrics)) => {
                    json!({"case": "environmentMetrics", "value": serde_json::to_value(metrics)?})
                }
                None => json!({"case": null}),
            };
            (
                "onTelemetryPacket",
                "Telemetry",
                json!({"time": telemetry.time, "variant": variant}),
            )
        }
        proto::port::ROUTING => {
            let routing = proto::Routing::decode(bytes)?;
            match routing.error_reason {
                Some(reason) if reason != 0 => {
                    return Err(DecodeError::Routing(
                        proto::routing_error_name(reason).to_string(),
                    ));
                }
                _ => (
                    "onRoutingPacket",
                    "Routing",
                    json!({"requestId": data.request_id}),
                ),
            }
        }
        proto::port::STORE_FORWARD => ("onStoreForwardPacket", "StoreAndForward", Value::Null),
        _ => return Ok(None),
    };

    Ok(Some(decoded))
}

/// Encode the request that makes a node replay its configuration
pub fn want_config_frame(nonce: u32) -> Vec<u8> {
    proto::ToRadio {
        want_config_id: Some(nonce),
    }
    .encode_to_vec()
}

impl PacketDecoder for MeshtasticDecoder {
    fn decode_envelope(&self, bytes: &[u8]) -> Result<Option<DecodedPacket>, DecodeError> {
        let envelope = proto::ServiceEnvelope::decode(bytes)?;

        let Some(packet) = envelope.packet else {
            return Err(DecodeError::Malformed("service envelope without packet".to_string()));
        };

        let channel_id = Some(envelope.channel_id).filter(|c| !c.is_empty());
        let gateway_id = Some(envelope.gateway_id).filter(|g| !g.is_empty());

        self.decode_mesh_packet(packet, channel_id, gateway_id)
    }

    fn decode_from_radio(&self, bytes: &[u8]) -> Result<FromRadioFrame, DecodeError> {
        let frame = proto::FromRadio::decode(bytes)?;

        Ok(match frame.payload_variant {
            Some(proto::from_radio::PayloadVariant::Packet(packet)) => {
                match self.decode_mesh_packet(packet, None, None)? {
                    Some(decoded) => FromRadioFrame::Packet(decoded),
                    None => FromRadioFrame::Other,
                }
            }
            Some(proto::from_radio::PayloadVariant::MyInfo(info)) => {
                FromRadioFrame::MyNodeNum(info.my_node_num)
            }
            Some(proto::from_radio::PayloadVariant::Metadata(metadata)) => {
                FromRadioFrame::Metadata(serde_json::to_value(metadata)?)
            }
            None => FromRadioFrame::Other,
        })
    }
}
