//! Envelope processing
//!
//! Every envelope runs through classify, upsert and, for text messages,
//! correlation. Each envelope is handled in its own task, so a store error or
//! a panic only affects the event that caused it.

use crate::aggregator::{StateAggregator, UpsertOutcome};
use crate::classifier::{classify, Classification, RejectReason};
use crate::correlation::{CorrelationWindow, OfferOutcome};
use mesh_shared::{CanonicalType, ClassifierRules, Envelope};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info_span, warn, Instrument, Span};

/// What happened to one envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Rejected(RejectReason),
    Processed {
        kind: CanonicalType,
        /// `None` when the store write failed
        upsert: Option<UpsertOutcome>,
        /// Set for message events only
        offer: Option<OfferOutcome>,
    },
}

pub struct Pipeline {
    rules: ClassifierRules,
    aggregator: StateAggregator,
    window: CorrelationWindow,
}

impl Pipeline {
    pub fn new(rules: ClassifierRules, aggregator: StateAggregator, window: CorrelationWindow) -> Self {
        Self {
            rules,
            aggregator,
            window,
        }
    }

    /// Process one envelope
    pub async fn handle(&self, envelope: Envelope) -> PipelineOutcome {
        let classification = classify(
            &envelope.event_name,
            &envelope.event_type,
            envelope.raw.as_ref(),
            &self.rules,
        );

        let (kind, event) = match (classification, envelope.raw) {
            (Classification::Accepted(kind), Some(event)) => (kind, event),
            (Classification::Rejected(reason), _) => {
                debug!(
                    event_name = %envelope.event_name,
                    reason = %reason,
                    "Event rejected"
                );

                #[cfg(feature = "metrics")]
                metrics::counter!("mesh_processor.events_rejected", "reason" => reason.as_str())
                    .increment(1);

                return PipelineOutcome::Rejected(reason);
            }
            (Classification::Accepted(_), None) => {
                return PipelineOutcome::Rejected(RejectReason::MissingEvent);
            }
        };

        let upsert = match self.aggregator.upsert(kind, &event).await {
            Ok(outcome) => {
                #[cfg(feature = "metrics")]
                metrics::counter!("mesh_processor.events_stored", "type" => kind.as_str())
                    .increment(1);

                Some(outcome)
            }
            Err(e) => {
                error!(
                    origin_id = %event.origin_id,
                    kind = %kind,
                    error = %e,
                    "Failed to store event"
                );
                None
            }
        };

        let offer = (kind == CanonicalType::Message).then(|| self.window.offer(&event));

        debug!(
            origin_id = %event.origin_id,
            kind = %kind,
            upsert = ?upsert,
            offer = ?offer,
            "Event processed"
        );

        PipelineOutcome::Processed { kind, upsert, offer }
    }

    /// Process envelopes until every sender is dropped
    pub async fn run(self: Arc<Self>, mut envelopes: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = envelopes.recv().await {
            let pipeline = Arc::clone(&self);
            let span = info_span!(
                parent: Span::none(),
                "process_envelope",
                event_name = %envelope.event_name,
            );

            let task = tokio::spawn(async move { pipeline.handle(envelope).await }.instrument(span));

            tokio::spawn(async move {
                if let Err(e) = task.await {
                    warn!(error = %e, "Envelope task failed");
                }
            });
        }

        debug!("Envelope channel closed, pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mesh_shared::store::{device_key, series_key};
    use mesh_shared::{
        CorrelationSettings, EndpointConfig, EndpointKind, KeyedStore, MemoryStore, NodeId, RawEvent,
    };
    use serde_json::{json, Value};
    use tokio::time::Duration;

    fn endpoints() -> Vec<EndpointConfig> {
        vec![EndpointConfig {
            name: "msk".to_string(),
            address: "mqtt://msk.example.org".to_string(),
            kind: EndpointKind::TopicSubscribe,
            notify: true,
            username: None,
            password: None,
        }]
    }

    fn pipeline(store: Arc<MemoryStore>) -> (Pipeline, mpsc::UnboundedReceiver<crate::correlation::MessageGroup>) {
        let (window, groups) = CorrelationWindow::new(CorrelationSettings::default(), &endpoints());
        let aggregator = StateAggregator::new(store, 200);
        (Pipeline::new(ClassifierRules::default(), aggregator, window), groups)
    }

    fn event(event_name: &str, event_type: &str, payload: Value) -> RawEvent {
        RawEvent {
            source_endpoint: "msk".to_string(),
            full_topic: Some("msh/msk/2/e/LongFast/!088aa170".to_string()),
            topic_channel: Some("LongFast".to_string()),
            topic_user: Some("!088aa170".to_string()),
            event_name: event_name.to_string(),
            event_type: event_type.to_string(),
            payload,
            origin_id: NodeId(2_482_595_192),
            to: Some(0xffff_ffff),
            message_id: Some(383_448_021),
            gateway_id: Some("!088aa170".to_string()),
            hop_limit: Some(3),
            rx_rssi: Some(-97),
            rx_snr: Some(6.25),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_is_stored_and_correlated() {
        let store = Arc::new(MemoryStore::new());
        let (pipeline, mut groups) = pipeline(Arc::clone(&store));

        let outcome = pipeline
            .handle(Envelope::new(event("onMessagePacket", "string", json!("hello"))))
            .await;

        assert_eq!(
            outcome,
            PipelineOutcome::Processed {
                kind: CanonicalType::Message,
                upsert: Some(UpsertOutcome::Appended),
                offer: Some(OfferOutcome::Opened),
            }
        );

        let state = store.get_all_fields(&device_key(NodeId(2_482_595_192))).await.unwrap();
        assert!(state.contains_key("message"));

        tokio::time::advance(Duration::from_secs(8)).await;
        let group = groups.recv().await.unwrap();
        assert_eq!(group.message_id, 383_448_021);
    }

    #[tokio::test]
    async fn test_rejected_event_is_not_stored() {
        let store = Arc::new(MemoryStore::new());
        let (pipeline, _groups) = pipeline(Arc::clone(&store));

        let mut banned = event("onPositionPacket", "Position", json!({"latitudeI": 1, "longitudeI": 2}));
        banned.origin_id = NodeId(4_184_512_284);

        let outcome = pipeline.handle(Envelope::new(banned)).await;
        assert_eq!(outcome, PipelineOutcome::Rejected(RejectReason::BannedOrigin));
        assert!(store.key_scan("*").await.unwrap().is_empty());

        let outcome = pipeline.handle(Envelope::empty("json", "json")).await;
        assert_eq!(outcome, PipelineOutcome::Rejected(RejectReason::JsonTransport));
    }

    #[tokio::test]
    async fn test_telemetry_not_offered_to_window() {
        let store = Arc::new(MemoryStore::new());
        let (pipeline, _groups) = pipeline(Arc::clone(&store));

        let telemetry = event(
            "onTelemetryPacket",
            "Telemetry",
            json!({"variant": {"case": "deviceMetrics", "value": {"batteryLevel": 87}}}),
        );
        let outcome = pipeline.handle(Envelope::new(telemetry)).await;

        assert_eq!(
            outcome,
            PipelineOutcome::Processed {
                kind: CanonicalType::DeviceMetrics,
                upsert: Some(UpsertOutcome::Appended),
                offer: None,
            }
        );
        let series = store
            .list_range(&series_key("deviceMetrics", NodeId(2_482_595_192)), 0, -1)
            .await
            .unwrap();
        assert_eq!(series.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_processes_channel() {
        let store = Arc::new(MemoryStore::new());
        let (pipeline, _groups) = pipeline(Arc::clone(&store));

        let (tx, rx) = mpsc::channel(8);
        tx.send(Envelope::new(event("onUserPacket", "User", json!({"longName": "Alice"}))))
            .await
            .unwrap();
        drop(tx);

        Arc::new(pipeline).run(rx).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let state = store.get_all_fields(&device_key(NodeId(2_482_595_192))).await.unwrap();
        assert!(state.contains_key("user"));
    }
}
