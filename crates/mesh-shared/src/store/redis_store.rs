//! Redis backed keyed store

use super::KeyedStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use tracing::debug;

/// Number of keys requested per SCAN round trip
const SCAN_BATCH: usize = 100;

/// Keyed store using a Redis connection manager
///
/// The connection manager reconnects on its own; callers clone it per command.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
}

impl RedisStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Open a client and establish the managed connection
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            Client::open(url).map_err(|e| Error::config(format!("Invalid Redis URL: {}", e)))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::internal(format!("Failed to connect to Redis: {}", e)))?;

        debug!("Connected to Redis");

        Ok(Self::new(redis))
    }
}

#[async_trait]
impl KeyedStore for RedisStore {
    async fn get_all_fields(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn set_fields(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }

        let mut conn = self.redis.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn list_append(&self, key: &str, value: &str) -> Result<usize> {
        let mut conn = self.redis.clone();
        let len: usize = conn.rpush(key, value).await?;
        Ok(len)
    }

    async fn list_range(&self, key: &str, start: isize, end: isize) -> Result<Vec<String>> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(key, start, end).await?;
        Ok(entries)
    }

    async fn list_trim(&self, key: &str, start: isize, end: isize) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: () = conn.ltrim(key, start, end).await?;
        Ok(())
    }

    async fn key_scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            keys.extend(batch);

            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_redis_url() {
        let result = RedisStore::connect("invalid://url").await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
