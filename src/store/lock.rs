// Leased distributed locks over the store: SETNX with a random per-call
// token, exponential backoff on contention, scripted compare-and-del on
// release so a lock lost to TTL expiry is detected rather than clobbered.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

use super::SharedStore;
use crate::error::{EngineError, EngineResult};

#[derive(Clone)]
pub struct LockManager {
    store: SharedStore,
    ttl: Duration,
    retries: u32,
}

impl LockManager {
    pub fn new(store: SharedStore, ttl: Duration, retries: u32) -> Self {
        Self { store, ttl, retries }
    }

    /// Acquire with backoff (100 * attempt ms); fails with LockUnavailable
    /// once the retry budget is exhausted.
    pub async fn acquire(&self, key: &str) -> EngineResult<LockGuard> {
        for attempt in 1..=self.retries {
            if let Some(guard) = self.try_acquire(key).await? {
                return Ok(guard);
            }
            tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
        }
        Err(EngineError::LockUnavailable(key.to_string()))
    }

    /// Single attempt; None on contention.
    pub async fn try_acquire(&self, key: &str) -> EngineResult<Option<LockGuard>> {
        let token = random_token();
        if self.store.set_if_absent(key, &token, self.ttl).await? {
            Ok(Some(LockGuard {
                store: self.store.clone(),
                key: key.to_string(),
                token,
            }))
        } else {
            Ok(None)
        }
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

pub struct LockGuard {
    store: SharedStore,
    key: String,
    token: String,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}

impl LockGuard {
    /// Release the lease. Returns false when the lock was already lost to
    /// TTL expiry; the caller's result still stands, the next risk cycle
    /// re-reconciles derived state.
    pub async fn release(self) -> bool {
        match self.store.compare_and_del(&self.key, &self.token).await {
            Ok(true) => true,
            Ok(false) => {
                warn!("lock {} lost before release (TTL elapsed mid-operation)", self.key);
                false
            }
            Err(e) => {
                warn!("lock {} release failed: {}", self.key, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn manager(retries: u32) -> LockManager {
        let store: SharedStore = Arc::new(MemoryStore::new());
        LockManager::new(store, Duration::from_millis(200), retries)
    }

    #[tokio::test]
    async fn acquire_release_roundtrip() {
        let locks = manager(3);
        let guard = locks.acquire("lock:balance:0xa").await.unwrap();
        assert!(locks.try_acquire("lock:balance:0xa").await.unwrap().is_none());
        assert!(guard.release().await);
        assert!(locks.try_acquire("lock:balance:0xa").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn contention_exhausts_retries() {
        let locks = manager(2);
        let _held = locks.acquire("lock:funding:0xt").await.unwrap();
        let err = locks.acquire("lock:funding:0xt").await.unwrap_err();
        assert!(matches!(err, EngineError::LockUnavailable(_)));
    }

    #[tokio::test]
    async fn release_detects_lost_lease() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let locks = LockManager::new(store.clone(), Duration::from_millis(10), 1);
        let guard = locks.acquire("lock:x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Lease expired; another holder takes it.
        let _second = locks.acquire("lock:x").await.unwrap();
        assert!(!guard.release().await);
    }
}
