//! Process-local keyed store
//!
//! Used for tests and for running without Redis. Behaves like the Redis
//! backend for the subset of commands the pipeline uses.

use super::KeyedStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, Vec<String>>,
}

/// In-memory keyed store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::internal("memory store lock poisoned"))
    }
}

/// Resolve a Redis style inclusive range into a half-open slice range
fn resolve_range(len: usize, start: isize, end: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let end = if end < 0 { len + end } else { end.min(len - 1) };

    if start > end || start >= len {
        None
    } else {
        Some((start as usize, end as usize + 1))
    }
}

/// Match a glob pattern where `*` is the only wildcard
fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !key.starts_with(first) || key.len() < first.len() + last.len() || !key.ends_with(last) {
        return false;
    }

    let mut rest = &key[first.len()..key.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}

#[async_trait]
impl KeyedStore for MemoryStore {
    async fn get_all_fields(&self, key: &str) -> Result<HashMap<String, String>> {
        let inner = self.lock()?;
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn set_fields(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }

        let mut inner = self.lock()?;
        let hash = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn list_append(&self, key: &str, value: &str) -> Result<usize> {
        let mut inner = self.lock()?;
        let list = inner.lists.entry(key.to_string()).or_default();
        list.push(value.to_string());
        Ok(list.len())
    }

    async fn list_range(&self, key: &str, start: isize, end: isize) -> Result<Vec<String>> {
        let inner = self.lock()?;
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };

        Ok(match resolve_range(list.len(), start, end) {
            Some((from, to)) => list[from..to].to_vec(),
            None => Vec::new(),
        })
    }

    async fn list_trim(&self, key: &str, start: isize, end: isize) -> Result<()> {
        let mut inner = self.lock()?;
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(());
        };

        match resolve_range(list.len(), start, end) {
            Some((from, to)) => {
                list.truncate(to);
                list.drain(..from);
            }
            None => {
                // Redis deletes the key once the list is empty
                inner.lists.remove(key);
            }
        }
        Ok(())
    }

    async fn key_scan(&self, pattern: &str) -> Result<Vec<String>> {
        let inner = self.lock()?;
        let mut keys: Vec<String> = inner
            .hashes
            .keys()
            .chain(inner.lists.keys())
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_fields_merge() {
        let store = MemoryStore::new();
        store
            .set_fields(
                "device:1",
                &[
                    ("server".to_string(), "msk".to_string()),
                    ("timestamp".to_string(), "t1".to_string()),
                ],
            )
            .await
            .unwrap();
        store
            .set_fields("device:1", &[("timestamp".to_string(), "t2".to_string())])
            .await
            .unwrap();

        let fields = store.get_all_fields("device:1").await.unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["server"], "msk");
        assert_eq!(fields["timestamp"], "t2");
        assert!(store.get_all_fields("device:2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_negative_indices() {
        let store = MemoryStore::new();
        for value in ["a", "b", "c", "d"] {
            store.list_append("gps:1", value).await.unwrap();
        }

        assert_eq!(store.list_range("gps:1", -1, -1).await.unwrap(), vec!["d"]);
        assert_eq!(
            store.list_range("gps:1", 0, -1).await.unwrap(),
            vec!["a", "b", "c", "d"]
        );
        assert_eq!(store.list_range("gps:1", 1, 100).await.unwrap(), vec!["b", "c", "d"]);
        assert!(store.list_range("gps:1", 5, 10).await.unwrap().is_empty());
        assert!(store.list_range("gps:9", -1, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_trim_keeps_tail() {
        let store = MemoryStore::new();
        for value in ["a", "b", "c", "d", "e"] {
            store.list_append("gps:1", value).await.unwrap();
        }

        store.list_trim("gps:1", -3, -1).await.unwrap();
        assert_eq!(
            store.list_range("gps:1", 0, -1).await.unwrap(),
            vec!["c", "d", "e"]
        );

        store.list_trim("gps:1", 5, 6).await.unwrap();
        assert!(store.key_scan("gps:*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_key_scan_glob() {
        let store = MemoryStore::new();
        store.list_append("gps:1", "x").await.unwrap();
        store.list_append("gps:2", "x").await.unwrap();
        store
            .set_fields("device:1", &[("server".to_string(), "msk".to_string())])
            .await
            .unwrap();

        assert_eq!(store.key_scan("gps:*").await.unwrap(), vec!["gps:1", "gps:2"]);
        assert_eq!(store.key_scan("*:1").await.unwrap(), vec!["device:1", "gps:1"]);
        assert_eq!(store.key_scan("device:1").await.unwrap(), vec!["device:1"]);
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a*c", "abc"));
        assert!(glob_match("a*b*c", "aXbYc"));
        assert!(!glob_match("a*b*c", "aXc"));
        assert!(!glob_match("ab*ba", "aba"));
    }
}
