//! Per-node state aggregation
//!
//! Every accepted event overwrites its slot in the node state hash. Types
//! with a history additionally append a narrowed record to a bounded series,
//! unless the record equals the newest entry.
//!
//! The read-diff-append sequence is not atomic against the store. Two
//! concurrent upserts to the same series may both append.

pub mod narrow;

use crate::error::Result;
use mesh_shared::store::{device_key, series_key, user_key};
use mesh_shared::{CanonicalType, KeyedStore, RawEvent};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Identity fields copied into the `user:{id}` hash
const IDENTITY_FIELDS: [&str; 5] = ["id", "longName", "shortName", "hwModel", "role"];

/// What an upsert did besides overwriting node state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Type without a series
    StateOnly,
    /// A new series entry was appended
    Appended,
    /// The narrowed record equals the newest entry
    Unchanged,
    /// Position without a fix, not recorded in the series
    NoFix,
}

pub struct StateAggregator {
    store: Arc<dyn KeyedStore>,
    max_series_len: usize,
}

impl StateAggregator {
    pub fn new(store: Arc<dyn KeyedStore>, max_series_len: usize) -> Self {
        Self {
            store,
            max_series_len: max_series_len.max(1),
        }
    }

    /// Record an accepted event
    pub async fn upsert(&self, kind: CanonicalType, event: &RawEvent) -> Result<UpsertOutcome> {
        let origin = event.origin_id;

        let state = vec![
            ("server".to_string(), event.source_endpoint.clone()),
            ("timestamp".to_string(), event.timestamp.to_rfc3339()),
            (kind.as_str().to_string(), serde_json::to_string(event)?),
        ];
        self.store.set_fields(&device_key(origin), &state).await?;

        if kind == CanonicalType::User {
            let identity = identity_fields(&event.payload);
            if !identity.is_empty() {
                self.store.set_fields(&user_key(origin), &identity).await?;
            }
        }

        let Some(series) = kind.series_name() else {
            return Ok(UpsertOutcome::StateOnly);
        };

        if kind == CanonicalType::Position && narrow::is_no_fix(event) {
            debug!(origin_id = %origin, "Skipped position without fix");
            return Ok(UpsertOutcome::NoFix);
        }

        let Some(record) = narrow::narrow(kind, event) else {
            return Ok(UpsertOutcome::StateOnly);
        };

        let key = series_key(series, origin);

        let newest = self.store.list_range(&key, -1, -1).await?;
        if let Some(last) = newest.first() {
            match serde_json::from_str::<Map<String, Value>>(last) {
                Ok(last) if narrow::records_equal(&last, &record) => {
                    return Ok(UpsertOutcome::Unchanged);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "Unreadable series entry, appending");
                }
            }
        }

        let mut entry = Map::with_capacity(record.len() + 1);
        entry.insert(
            "timestamp".to_string(),
            Value::String(event.timestamp.to_rfc3339()),
        );
        entry.extend(record);

        let len = self
            .store
            .list_append(&key, &Value::Object(entry).to_string())
            .await?;

        if len > self.max_series_len {
            self.store
                .list_trim(&key, -(self.max_series_len as isize), -1)
                .await?;
        }

        debug!(key = %key, len = len.min(self.max_series_len), "Appended series entry");

        Ok(UpsertOutcome::Appended)
    }
}

/// Flatten the identity of a user payload into string fields
fn identity_fields(payload: &Value) -> Vec<(String, String)> {
    IDENTITY_FIELDS
        .iter()
        .filter_map(|field| {
            let value = match payload.get(*field)? {
                Value::String(s) if !s.is_empty() => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            Some((field.to_string(), value))
        })
        .collect()
}
