//! Event source adapters
//!
//! Each configured endpoint gets one adapter task that turns its transport
//! frames into [`Envelope`]s on a shared channel:
//!
//! - topic-subscribe endpoints are MQTT brokers ([`mqtt::MqttAdapter`])
//! - direct-feed endpoints are polled node HTTP APIs ([`direct_feed::HttpFeedAdapter`])
//!
//! Transport failures are retried with a fixed delay up to a bounded number
//! of consecutive attempts, see [`run_with_reconnect`].

pub mod direct_feed;
pub mod mqtt;
pub mod suppression;
pub mod topic;

pub use suppression::ErrorSuppressor;

use crate::decoder::{DecodedPacket, PacketDecoder};
use crate::error::ProcessorError;
use async_trait::async_trait;
use chrono::Utc;
use mesh_shared::{AdapterSettings, EndpointConfig, EndpointKind, Envelope, NodeId, RawEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use topic::TopicParts;

/// How a single connection session ended
#[derive(Debug)]
pub enum SessionOutcome {
    /// Shutdown requested or the pipeline stopped consuming
    Cancelled,
    /// Transport failed; `established` tells whether the connection had come up
    Disconnected {
        established: bool,
        error: ProcessorError,
    },
}

/// Why an adapter task stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterExit {
    Cancelled,
    RetriesExhausted,
}

/// One connection session against an endpoint
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn endpoint(&self) -> &EndpointConfig;

    /// Connect and forward envelopes until the transport fails or `cancel` fires
    async fn run_session(
        &self,
        tx: &mpsc::Sender<Envelope>,
        cancel: &CancellationToken,
    ) -> SessionOutcome;
}

/// Drive an adapter, reconnecting after transport failures
///
/// The attempt counter resets whenever a session had connected successfully.
/// Once `max_retry_attempts` consecutive attempts failed the adapter stops.
pub async fn run_with_reconnect(
    adapter: Arc<dyn SourceAdapter>,
    settings: AdapterSettings,
    tx: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
) -> AdapterExit {
    let endpoint = adapter.endpoint().name.clone();
    let mut retry_count = 0;

    info!(endpoint = %endpoint, address = %adapter.endpoint().address, "Starting source adapter");

    let exit = loop {
        if cancel.is_cancelled() {
            break AdapterExit::Cancelled;
        }

        match adapter.run_session(&tx, &cancel).await {
            SessionOutcome::Cancelled => {
                debug!(endpoint = %endpoint, "Source adapter session cancelled");
                break AdapterExit::Cancelled;
            }
            SessionOutcome::Disconnected { established, error } => {
                if established {
                    retry_count = 0;
                }

                warn!(endpoint = %endpoint, error = %error, "Endpoint transport error");

                retry_count += 1;
                if retry_count >= settings.max_retry_attempts {
                    error!(
                        endpoint = %endpoint,
                        max_retries = settings.max_retry_attempts,
                        "Max retry attempts reached, stopping source adapter"
                    );
                    break AdapterExit::RetriesExhausted;
                }

                info!(
                    endpoint = %endpoint,
                    attempt = retry_count,
                    max_attempts = settings.max_retry_attempts,
                    "Reconnecting to endpoint"
                );

                tokio::select! {
                    _ = cancel.cancelled() => break AdapterExit::Cancelled,
                    _ = tokio::time::sleep(settings.retry_delay) => {}
                }
            }
        }
    };

    info!(endpoint = %endpoint, "Source adapter stopped");
    exit
}

/// Spawn one adapter task per configured endpoint
pub fn spawn_adapters(
    endpoints: &[EndpointConfig],
    settings: &AdapterSettings,
    decoder: Arc<dyn PacketDecoder>,
    tx: mpsc::Sender<Envelope>,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<AdapterExit>> {
    let suppressor = Arc::new(ErrorSuppressor::new(settings.suppressed_errors.clone()));

    endpoints
        .iter()
        .map(|endpoint| {
            let adapter: Arc<dyn SourceAdapter> = match endpoint.kind {
                EndpointKind::TopicSubscribe => Arc::new(mqtt::MqttAdapter::new(
                    endpoint.clone(),
                    settings.clone(),
                    Arc::clone(&decoder),
                    Arc::clone(&suppressor),
                )),
                EndpointKind::DirectFeed => Arc::new(direct_feed::HttpFeedAdapter::new(
                    endpoint.clone(),
                    settings.clone(),
                    Arc::clone(&decoder),
                    Arc::clone(&suppressor),
                )),
            };

            tokio::spawn(run_with_reconnect(
                adapter,
                settings.clone(),
                tx.clone(),
                cancel.child_token(),
            ))
        })
        .collect()
}

/// Build the event of a decoded packet
pub(crate) fn packet_to_raw(
    endpoint: &str,
    topic: Option<&TopicParts>,
    packet: DecodedPacket,
) -> RawEvent {
    RawEvent {
        source_endpoint: endpoint.to_string(),
        full_topic: topic.map(|t| t.full.clone()),
        topic_channel: topic.and_then(|t| t.channel.clone()).or(packet.channel_id),
        topic_user: topic.and_then(|t| t.user.clone()),
        event_name: packet.event_name,
        event_type: packet.event_type,
        payload: packet.payload,
        origin_id: NodeId(packet.from),
        to: Some(packet.to),
        message_id: Some(packet.id).filter(|id| *id != 0),
        gateway_id: packet.gateway_id,
        hop_limit: Some(packet.hop_limit),
        rx_rssi: Some(packet.rx_rssi),
        rx_snr: Some(packet.rx_snr),
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FlakyAdapter {
        endpoint: EndpointConfig,
        sessions: AtomicUsize,
        connects: bool,
    }

    impl FlakyAdapter {
        fn new(connects: bool) -> Self {
            Self {
                endpoint: EndpointConfig {
                    name: "msk".to_string(),
                    address: "mqtt://localhost:1883".to_string(),
                    kind: EndpointKind::TopicSubscribe,
                    notify: true,
                    username: None,
                    password: None,
                },
                sessions: AtomicUsize::new(0),
                connects,
            }
        }
    }

    #[async_trait]
    impl SourceAdapter for FlakyAdapter {
        fn endpoint(&self) -> &EndpointConfig {
            &self.endpoint
        }

        async fn run_session(
            &self,
            _tx: &mpsc::Sender<Envelope>,
            _cancel: &CancellationToken,
        ) -> SessionOutcome {
            self.sessions.fetch_add(1, Ordering::SeqCst);
            SessionOutcome::Disconnected {
                established: self.connects,
                error: ProcessorError::transport("msk", "connection refused"),
            }
        }
    }

    fn settings() -> AdapterSettings {
        AdapterSettings {
            max_retry_attempts: 5,
            retry_delay: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_stops_after_budget() {
        let adapter = Arc::new(FlakyAdapter::new(false));
        let (tx, _rx) = mpsc::channel(8);

        let exit = run_with_reconnect(
            adapter.clone(),
            settings(),
            tx,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(exit, AdapterExit::RetriesExhausted);
        assert_eq!(adapter.sessions.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_established_sessions_reset_budget() {
        let adapter = Arc::new(FlakyAdapter::new(true));
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_with_reconnect(
            adapter.clone(),
            settings(),
            tx,
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!handle.is_finished());
        assert!(adapter.sessions.load(Ordering::SeqCst) > 5);

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), AdapterExit::Cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let adapter = Arc::new(FlakyAdapter::new(false));
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let exit = run_with_reconnect(adapter.clone(), settings(), tx, cancel).await;

        assert_eq!(exit, AdapterExit::Cancelled);
        assert_eq!(adapter.sessions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_packet_to_raw_maps_topic_and_signal() {
        let topic = topic::parse_topic("msh/msk/2/e/LongFast/!088aa170").unwrap();
        let packet = DecodedPacket {
            event_name: "onMessagePacket".to_string(),
            event_type: "string".to_string(),
            from: 2_482_595_192,
            to: 0xffff_ffff,
            id: 0,
            channel_id: Some("LongFast".to_string()),
            gateway_id: Some("!088aa170".to_string()),
            hop_limit: 3,
            rx_rssi: -97,
            rx_snr: 6.25,
            payload: serde_json::json!("hi"),
        };

        let raw = packet_to_raw("msk", Some(&topic), packet);

        assert_eq!(raw.full_topic.as_deref(), Some("msh/msk/2/e/LongFast/!088aa170"));
        assert_eq!(raw.topic_user.as_deref(), Some("!088aa170"));
        assert_eq!(raw.origin_id, NodeId(2_482_595_192));
        assert_eq!(raw.message_id, None);
        assert!(!raw.is_direct());
    }
}
