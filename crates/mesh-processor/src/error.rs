//! Error types for the processing pipeline
//!
//! Every failure is scoped to the single event that caused it. None of these
//! errors is retried; only transport disconnects drive the bounded
//! reconnection loop of the adapters.

use crate::decoder::DecodeError;
use thiserror::Error;

/// Pipeline error types
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// Frame could not be decoded; the frame is dropped
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Keyed store unreachable or a command failed; the event write is abandoned
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] mesh_shared::Error),

    /// Endpoint transport lost or could not be established
    #[error("Transport disconnect on {endpoint}: {reason}")]
    TransportDisconnect { endpoint: String, reason: String },

    /// Notification sink rejected a message
    #[error("Notification delivery failed: {0}")]
    NotificationDelivery(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProcessorError {
    /// Create a TransportDisconnect error
    pub fn transport(endpoint: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::TransportDisconnect {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a NotificationDelivery error
    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::NotificationDelivery(msg.into())
    }

    /// Create an Internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if the condition may clear up on its own
    ///
    /// Transient errors (store outage, transport loss, delivery) are expected
    /// to recover. Decode and serialization failures are a property of the
    /// frame and never will.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProcessorError::StoreUnavailable(_)
                | ProcessorError::TransportDisconnect { .. }
                | ProcessorError::NotificationDelivery(_)
        )
    }
}

/// Result type alias using ProcessorError
pub type Result<T> = std::result::Result<T, ProcessorError>;
