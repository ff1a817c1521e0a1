//! Direct-feed adapter polling a node's HTTP API
//!
//! The node exposes `GET /api/v1/fromradio` returning one protobuf frame per
//! call, or an empty body when its queue is drained. Each named packet kind
//! maps to one envelope; device metadata is attributed to the serving node.

use super::{packet_to_raw, ErrorSuppressor, SessionOutcome, SourceAdapter};
use crate::decoder::{want_config_frame, FromRadioFrame, PacketDecoder};
use crate::error::ProcessorError;
use async_trait::async_trait;
use chrono::Utc;
use mesh_shared::{AdapterSettings, EndpointConfig, Envelope, NodeId, RawEvent};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

const PROTOBUF_MIME: &str = "application/x-protobuf";

pub struct HttpFeedAdapter {
    endpoint: EndpointConfig,
    settings: AdapterSettings,
    decoder: Arc<dyn PacketDecoder>,
    suppressor: Arc<ErrorSuppressor>,
    client: reqwest::Client,
}

impl HttpFeedAdapter {
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
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.address.trim_end_matches('/'), path)
    }

    fn disconnected(&self, established: bool, reason: impl std::fmt::Display) -> SessionOutcome {
        SessionOutcome::Disconnected {
            established,
            error: ProcessorError::transport(&self.endpoint.name, reason),
        }
    }

    async fn request_config(&self) -> Result<(), reqwest::Error> {
        let nonce = uuid::Uuid::new_v4().as_u128() as u32;

        self.client
            .put(self.url("/api/v1/toradio"))
            .header(CONTENT_TYPE, PROTOBUF_MIME)
            .body(want_config_frame(nonce))
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    async fn fetch_frame(&self) -> Result<Vec<u8>, reqwest::Error> {
        let response = self
            .client
            .get(self.url("/api/v1/fromradio?all=false"))
            .header(ACCEPT, PROTOBUF_MIME)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl SourceAdapter for HttpFeedAdapter {
    fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    #[instrument(
        name = "direct_feed_session",
        skip_all,
        fields(endpoint = %self.endpoint.name, address = %self.endpoint.address)
    )]
    async fn run_session(
        &self,
        tx: &mpsc::Sender<Envelope>,
        cancel: &CancellationToken,
    ) -> SessionOutcome {
        tokio::select! {
            _ = cancel.cancelled() => return SessionOutcome::Cancelled,
            result = self.request_config() => {
                if let Err(e) = result {
                    return self.disconnected(false, e);
                }
            }
        }

        info!("Connected to direct feed");

        let mut feed = FeedState::default();

        loop {
            let body = tokio::select! {
                _ = cancel.cancelled() => return SessionOutcome::Cancelled,
                result = self.fetch_frame() => match result {
                    Ok(body) => body,
                    Err(e) => return self.disconnected(true, e),
                },
            };

            if body.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => return SessionOutcome::Cancelled,
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
                continue;
            }

            let frame = match self.decoder.decode_from_radio(&body) {
                Ok(frame) => frame,
                Err(e) => {
                    self.suppressor.report(&self.endpoint.name, &e);
                    continue;
                }
            };

            if let Some(envelope) = feed.handle(&self.endpoint.name, frame) {
                if tx.send(envelope).await.is_err() {
                    debug!("Envelope channel closed");
                    return SessionOutcome::Cancelled;
                }
            }
        }
    }
}

/// Per-session state of a direct feed
#[derive(Debug, Default)]
pub struct FeedState {
    my_node_num: Option<u32>,
}

impl FeedState {
    /// Map one decoded frame to an envelope
    pub fn handle(&mut self, endpoint: &str, frame: FromRadioFrame) -> Option<Envelope> {
        match frame {
            FromRadioFrame::Packet(packet) => Some(Envelope::new(packet_to_raw(endpoint, None, packet))),
            FromRadioFrame::MyNodeNum(num) => {
                debug!(endpoint = endpoint, node = %NodeId(num).hex(), "Learned local node number");
                self.my_node_num = Some(num);
                None
            }
            FromRadioFrame::Metadata(payload) => {
                let Some(num) = self.my_node_num else {
                    debug!(endpoint = endpoint, "Dropped device metadata before node number is known");
                    return None;
                };

                Some(Envelope::new(RawEvent {
                    source_endpoint: endpoint.to_string(),
                    full_topic: None,
                    topic_channel: None,
                    topic_user: None,
                    event_name: "onDeviceMetadataPacket".to_string(),
                    event_type: "DeviceMetadata".to_string(),
                    payload,
                    origin_id: NodeId(num),
                    to: None,
                    message_id: None,
                    gateway_id: None,
                    hop_limit: None,
                    rx_rssi: None,
                    rx_snr: None,
                    timestamp: Utc::now(),
                }))
            }
            FromRadioFrame::Other => None,
        }
    }
}
