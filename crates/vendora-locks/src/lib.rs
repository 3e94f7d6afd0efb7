use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;
use vendora_platform::KvStore;

const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Mutual exclusion for periodic jobs. Acquisition is a single atomic
/// set-if-absent with a ttl; release only deletes the key while it still holds
/// the token this process wrote, so an expired-and-reacquired lock is never
/// released out from under its new owner.
pub struct LockManager<S: KvStore> {
    store: Arc<S>,
    held: Mutex<HashMap<String, String>>,
}

impl<S: KvStore> LockManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Try to take the lock, with `retries` extra attempts spaced by a short
    /// backoff. Periodic jobs pass 0 and rely on the next tick instead.
    pub async fn acquire(&self, key: &str, ttl: Duration, retries: u32) -> Result<bool> {
        let token = Uuid::new_v4().to_string();
        for attempt in 0..=retries {
            if self.store.set_nx(key, &token, ttl).await? {
                self.held.lock().await.insert(key.to_string(), token);
                return Ok(true);
            }
            if attempt < retries {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
        Ok(false)
    }

    /// Ownership-checked release. A no-op when this process does not hold the
    /// key or lost it to ttl expiry.
    pub async fn release(&self, key: &str) -> Result<()> {
        let token = self.held.lock().await.remove(key);
        let Some(token) = token else {
            return Ok(());
        };
        if !self.store.delete_if_eq(key, &token).await? {
            warn!(key, "lock expired before release; another owner may hold it");
        }
        Ok(())
    }

    /// Run `work` under the lock. `None` means another instance already holds
    /// it; callers treat that as "skip this round", not as an error.
    pub async fn with_lock<T, F, Fut>(&self, key: &str, ttl: Duration, work: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.acquire(key, ttl, 0).await? {
            info!(key, "lock busy, skipping");
            return Ok(None);
        }
        let outcome = work().await;
        // The work's outcome wins over any release trouble; the ttl reclaims
        // the key if release fails here or the task panics mid-work.
        if let Err(err) = self.release(key).await {
            warn!(key, "lock release failed: {err:#}");
        }
        outcome.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use vendora_platform::MemoryKv;

    fn manager() -> (Arc<MemoryKv>, LockManager<MemoryKv>) {
        let store = Arc::new(MemoryKv::new());
        (store.clone(), LockManager::new(store))
    }

    /// Store whose compare-and-delete always fails, as when the connection
    /// drops between finishing the work and releasing the lock.
    struct DroppedRelease(MemoryKv);

    #[async_trait]
    impl KvStore for DroppedRelease {
        async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
            self.0.set_nx(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
            self.0.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.0.delete(key).await
        }

        async fn delete_if_eq(&self, _key: &str, _expected: &str) -> Result<bool> {
            anyhow::bail!("connection dropped")
        }

        async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
            self.0.incr_by(key, delta).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
            self.0.expire(key, ttl).await
        }
    }

    #[tokio::test]
    async fn second_acquire_fails_while_held() {
        let (_, locks) = manager();
        assert!(locks.acquire("lock:job", Duration::from_secs(30), 0).await.unwrap());
        assert!(!locks.acquire("lock:job", Duration::from_secs(30), 0).await.unwrap());
    }

    #[tokio::test]
    async fn release_allows_reacquisition() {
        let (_, locks) = manager();
        assert!(locks.acquire("lock:job", Duration::from_secs(30), 0).await.unwrap());
        locks.release("lock:job").await.unwrap();
        assert!(locks.acquire("lock:job", Duration::from_secs(30), 0).await.unwrap());
    }

    #[tokio::test]
    async fn release_does_not_steal_from_new_owner() {
        let store = Arc::new(MemoryKv::new());
        let first = LockManager::new(store.clone());
        let second = LockManager::new(store.clone());

        assert!(first.acquire("lock:job", Duration::from_millis(5), 0).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(second.acquire("lock:job", Duration::from_secs(30), 0).await.unwrap());

        // First holder's token is stale; its release must not free second's lock.
        first.release("lock:job").await.unwrap();
        assert!(!first.acquire("lock:job", Duration::from_secs(30), 0).await.unwrap());
    }

    #[tokio::test]
    async fn with_lock_skips_when_contended() {
        let (_, locks) = manager();
        assert!(locks.acquire("lock:sweep", Duration::from_secs(30), 0).await.unwrap());

        let skipped = locks
            .with_lock("lock:sweep", Duration::from_secs(30), || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(skipped, None);

        locks.release("lock:sweep").await.unwrap();
        let ran = locks
            .with_lock("lock:sweep", Duration::from_secs(30), || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(ran, Some(42));
    }

    #[tokio::test]
    async fn failed_release_does_not_discard_the_work_result() {
        let store = Arc::new(DroppedRelease(MemoryKv::new()));
        let locks = LockManager::new(store);
        let ran = locks
            .with_lock("lock:sweep", Duration::from_secs(30), || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(ran, Some(7));
    }

    #[tokio::test]
    async fn with_lock_releases_after_failed_work() {
        let (_, locks) = manager();
        let failed: Result<Option<()>> = locks
            .with_lock("lock:sweep", Duration::from_secs(30), || async {
                anyhow::bail!("job blew up")
            })
            .await;
        assert!(failed.is_err());
        assert!(locks.acquire("lock:sweep", Duration::from_secs(30), 0).await.unwrap());
    }
}
