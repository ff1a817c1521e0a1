//! Mesh telemetry processor library
//!
//! Ingests packets from MQTT brokers and node HTTP feeds, classifies them,
//! keeps per-node state and bounded series, and correlates text messages
//! received through several gateways into one notification.
//! Exported for the binary and for integration tests.

pub mod adapter;
pub mod aggregator;
pub mod classifier;
pub mod correlation;
pub mod decoder;
pub mod error;
pub mod formatter;
pub mod notifier;
pub mod processor;

// Re-export commonly used types
pub use aggregator::{StateAggregator, UpsertOutcome};
pub use classifier::{classify, Classification, RejectReason};
pub use correlation::{CorrelationWindow, GatewayReceipt, MessageGroup, OfferOutcome};
pub use decoder::{MeshtasticDecoder, PacketDecoder};
pub use error::{ProcessorError, Result};
pub use formatter::{render_group, FormatOptions, NodeIdentity, SenderIdentity};
pub use notifier::{LogSink, NotificationSink, Notifier, TelegramSink};
pub use processor::{Pipeline, PipelineOutcome};
