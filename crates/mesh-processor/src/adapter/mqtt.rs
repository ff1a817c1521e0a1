//! Topic-subscribe adapter over MQTT

use super::topic::{self, KIND_JSON, KIND_STAT};
use super::{packet_to_raw, ErrorSuppressor, SessionOutcome, SourceAdapter};
use crate::decoder::{DecodeError, PacketDecoder};
use crate::error::ProcessorError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mesh_shared::{AdapterSettings, EndpointConfig, Envelope, NodeId, RawEvent};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, Span};

/// Default MQTT port when the address has none
const DEFAULT_MQTT_PORT: u16 = 1883;

pub struct MqttAdapter {
    endpoint: EndpointConfig,
    settings: AdapterSettings,
    decoder: Arc<dyn PacketDecoder>,
    suppressor: Arc<ErrorSuppressor>,
}

impl MqttAdapter {
    pub fn new(
        endpoint: EndpointConfig,
        settings: AdapterSettings,
        decoder: Arc<dyn PacketDecoder>,
        suppressor: Arc<ErrorSuppressor>,
    ) -> Self {
        Self {
            endpoint,
            settings,
            decoder,
            suppressor,
        }
    }

    fn options(&self) -> Result<MqttOptions, ProcessorError> {
        let (host, port) = parse_broker_url(&self.endpoint.address)
            .map_err(|e| ProcessorError::transport(&self.endpoint.name, e))?;

        let simple = uuid::Uuid::new_v4().simple().to_string();
        let client_id = format!("mqtt_{}", &simple[..8]);

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(self.settings.keep_alive);
        options.set_clean_session(true);

        if let Some(username) = &self.endpoint.username {
            options.set_credentials(
                username.clone(),
                self.endpoint.password.clone().unwrap_or_default(),
            );
        }

        Ok(options)
    }
}

#[async_trait]
impl SourceAdapter for MqttAdapter {
    fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    #[instrument(
        name = "mqtt_session",
        skip_all,
        fields(endpoint = %self.endpoint.name, address = %self.endpoint.address)
    )]
    async fn run_session(
        &self,
        tx: &mpsc::Sender<Envelope>,
        cancel: &CancellationToken,
    ) -> SessionOutcome {
        let options = match self.options() {
            Ok(options) => options,
            Err(error) => {
                return SessionOutcome::Disconnected {
                    established: false,
                    error,
                }
            }
        };

        let (client, mut eventloop) = AsyncClient::new(options, 100);

        // Requests are queued until the event loop connects
        for filter in &self.settings.subscribe_topics {
            if let Err(e) = client.subscribe(filter.as_str(), QoS::AtMostOnce).await {
                return SessionOutcome::Disconnected {
                    established: false,
                    error: ProcessorError::transport(&self.endpoint.name, e),
                };
            }
        }

        let mut established = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Shutdown signal received");
                    let _ = client.disconnect().await;
                    return SessionOutcome::Cancelled;
                }
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let envelope = handle_frame(
                                &self.endpoint.name,
                                &publish.topic,
                                &publish.payload,
                                self.decoder.as_ref(),
                                &self.suppressor,
                            );

                            if let Some(envelope) = envelope {
                                if tx.send(envelope).await.is_err() {
                                    debug!("Envelope channel closed");
                                    let _ = client.disconnect().await;
                                    return SessionOutcome::Cancelled;
                                }
                            }
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            established = true;
                            info!(
                                topics = self.settings.subscribe_topics.len(),
                                "Connected to MQTT broker"
                            );
                        }
                        Ok(Event::Incoming(Packet::SubAck(_))) => {
                            debug!("Subscription acknowledged");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return SessionOutcome::Disconnected {
                                established,
                                error: ProcessorError::transport(&self.endpoint.name, e),
                            };
                        }
                    }
                }
            }
        }
    }
}

/// Turn one published frame into an envelope
///
/// Returns `None` for frames that are dropped: unparseable topics, `stat`
/// frames and anything the decoder rejects.
pub fn handle_frame(
    endpoint: &str,
    topic: &str,
    payload: &[u8],
    decoder: &dyn PacketDecoder,
    suppressor: &ErrorSuppressor,
) -> Option<Envelope> {
    let span = info_span!(
        parent: Span::none(),
        "mesh_frame",
        endpoint = %endpoint,
        topic = %topic,
        payload_size = payload.len(),
    );
    let _entered = span.enter();

    let Some(parts) = topic::parse_topic(topic) else {
        debug!("Dropped frame with unexpected topic shape");
        return None;
    };

    match parts.packet_kind.as_str() {
        KIND_STAT => None,
        KIND_JSON => match json_frame(endpoint, &parts, payload) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                suppressor.report(endpoint, &e);
                None
            }
        },
        _ => match decoder.decode_envelope(payload) {
            Ok(Some(packet)) => Some(Envelope::new(packet_to_raw(endpoint, Some(&parts), packet))),
            Ok(None) => None,
            Err(e) => {
                suppressor.report(endpoint, &e);
                None
            }
        },
    }
}

/// Map a text-encoded JSON frame
fn json_frame(
    endpoint: &str,
    parts: &topic::TopicParts,
    payload: &[u8],
) -> Result<Envelope, DecodeError> {
    let body: Value = serde_json::from_slice(payload)?;

    let Some(object) = body.as_object() else {
        return Ok(Envelope::empty(KIND_JSON, KIND_JSON));
    };

    let Some(origin) = object.get("from").and_then(Value::as_i64).and_then(NodeId::from_wire) else {
        return Ok(Envelope::empty(KIND_JSON, KIND_JSON));
    };

    let as_u32 = |key: &str| {
        object
            .get(key)
            .and_then(Value::as_i64)
            .and_then(NodeId::from_wire)
            .map(|id| id.0)
    };

    let timestamp = object
        .get("timestamp")
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    Ok(Envelope::new(RawEvent {
        source_endpoint: endpoint.to_string(),
        full_topic: Some(parts.full.clone()),
        topic_channel: parts.channel.clone(),
        topic_user: parts.user.clone(),
        event_name: KIND_JSON.to_string(),
        event_type: KIND_JSON.to_string(),
        payload: object.get("payload").cloned().unwrap_or(Value::Null),
        origin_id: origin,
        to: as_u32("to"),
        message_id: as_u32("id"),
        gateway_id: object.get("sender").and_then(Value::as_str).map(String::from),
        hop_limit: object
            .get("hop_limit")
            .and_then(Value::as_u64)
            .and_then(|h| u32::try_from(h).ok()),
        rx_rssi: object
            .get("rssi")
            .and_then(Value::as_i64)
            .and_then(|r| i32::try_from(r).ok()),
        rx_snr: object.get("snr").and_then(Value::as_f64).map(|s| s as f32),
        timestamp,
    }))
}

/// Parse broker URL in format mqtt://host:port or tcp://host:port or host:port
fn parse_broker_url(url: &str) -> Result<(&str, u16), String> {
    let url = url.trim_start_matches("mqtt://");
    let url = url.trim_start_matches("tcp://");
    let url = url.trim_end_matches('/');

    let parts: Vec<&str> = url.split(':').collect();
    match parts.as_slice() {
        [host] if !host.is_empty() => Ok((*host, DEFAULT_MQTT_PORT)),
        [host, port] if !host.is_empty() => port
            .parse::<u16>()
            .map(|port| (*host, port))
            .map_err(|_| format!("Invalid port in broker URL: {}", port)),
        _ => Err(format!("Invalid broker URL format: {}", url)),
    }
}
