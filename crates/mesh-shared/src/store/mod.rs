//! Keyed store abstraction
//!
//! Node state is kept as string hashes and append-only string lists:
//!
//! - `device:{id}` - hash with `server`, `timestamp` and one JSON field per event type
//! - `user:{id}` - hash with the flattened identity (`longName`, `shortName`, ...)
//! - `gps:{id}`, `deviceMetrics:{id}`, `environmentMetrics:{id}`,
//!   `messages:{id}`, `deviceMetadata:{id}` - bounded lists of JSON entries
//!
//! List indices follow Redis semantics: negative values count from the tail.

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::error::Result;
use crate::models::NodeId;
use async_trait::async_trait;
use std::collections::HashMap;

/// Hash and list operations needed by the state aggregator and the notifier
#[async_trait]
pub trait KeyedStore: Send + Sync {
    /// Read every field of a hash, empty when the key does not exist
    async fn get_all_fields(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Set several hash fields at once, leaving other fields untouched
    async fn set_fields(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// Append to the tail of a list, returning the new length
    async fn list_append(&self, key: &str, value: &str) -> Result<usize>;

    /// Read an inclusive index range of a list
    async fn list_range(&self, key: &str, start: isize, end: isize) -> Result<Vec<String>>;

    /// Keep only the inclusive index range of a list
    async fn list_trim(&self, key: &str, start: isize, end: isize) -> Result<()>;

    /// Find keys matching a `*` glob pattern
    async fn key_scan(&self, pattern: &str) -> Result<Vec<String>>;
}

/// Key of the node state hash
pub fn device_key(id: NodeId) -> String {
    format!("device:{}", id)
}

/// Key of the node identity hash
pub fn user_key(id: NodeId) -> String {
    format!("user:{}", id)
}

/// Key of a metric series, e.g. `gps:2482595192`
pub fn series_key(series: &str, id: NodeId) -> String {
    format!("{}:{}", series, id)
}
