use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::kv::KvStore;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process `KvStore` with the same ttl semantics as the Redis
/// implementation. Backs tests and single-node local runs.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|entry| !entry.is_expired()) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let matches = entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired() && entry.value == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut entries = self.entries.lock().await;
        let (current, expires_at) = match entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                (entry.value.parse::<i64>().unwrap_or(0), entry.expires_at)
            }
            _ => (0, None),
        };
        let next = current + delta;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_is_first_writer_wins() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx("k", "a", Duration::from_secs(10)).await.unwrap());
        assert!(!kv.set_nx("k", "b", Duration::from_secs(10)).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn expired_keys_read_as_absent() {
        let kv = MemoryKv::new();
        kv.set("k", "a", Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert!(kv.set_nx("k", "b", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn delete_if_eq_requires_matching_value() {
        let kv = MemoryKv::new();
        kv.set("k", "token-1", Duration::from_secs(10)).await.unwrap();
        assert!(!kv.delete_if_eq("k", "token-2").await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("token-1"));
        assert!(kv.delete_if_eq("k", "token-1").await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_by_starts_from_zero_and_goes_negative() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr_by("counter", 6).await.unwrap(), 6);
        assert_eq!(kv.incr_by("counter", -2).await.unwrap(), 4);
        assert_eq!(kv.incr_by("counter", -10).await.unwrap(), -6);
    }
}
