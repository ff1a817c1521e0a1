//! Shared library for the mesh telemetry backend
//!
//! This crate provides common functionality used by the processor:
//! - Configuration management
//! - Error handling types
//! - The node/event data model
//! - The keyed store abstraction with Redis and in-memory backends
//! - Logging infrastructure

pub mod config;
pub mod error;
pub mod models;
pub mod store;

// Re-export commonly used types
pub use config::{
    AdapterSettings, ClassifierRules, Config, CorrelationSettings, EndpointConfig, EndpointKind,
    RedisConfig, StoreBackend, TelegramConfig,
};
pub use error::{Error, Result};
pub use models::{CanonicalType, Envelope, NodeId, RawEvent, BROADCAST_ADDR};
pub use store::{KeyedStore, MemoryStore, RedisStore};

/// Initialize tracing subscriber for structured logging
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesh_shared=debug,mesh_processor=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
