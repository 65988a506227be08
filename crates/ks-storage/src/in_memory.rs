//! In-memory adapter: the default backend, and the one every engine's
//! unit tests run against. One `InMemoryAdapter` instance hosts all
//! three maps (lock/rate-limiter/cache) behind their own `RwLock`, so a
//! single background sweep covers TTL eviction for all of them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use ks_domain::{Error, Result, SharedClock};

use crate::contracts::{
    CacheAdapter, CacheRecord, LockAdapter, LockRecord, RateLimiterRecord,
    RateLimiterStorageAdapter, RateLimiterTransition,
};

fn is_expired(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    matches!(expires_at, Some(at) if at <= now)
}

fn to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(ttl.as_millis() as i64)
}

pub struct InMemoryAdapter {
    locks: RwLock<HashMap<String, LockRecord>>,
    limiters: RwLock<HashMap<String, RateLimiterRecord>>,
    cache: RwLock<HashMap<String, CacheRecord>>,
    clock: SharedClock,
}

impl InMemoryAdapter {
    pub fn new(clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            locks: RwLock::new(HashMap::new()),
            limiters: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            clock,
        })
    }

    /// Start the periodic TTL sweep. The returned handle is owned by the
    /// caller; dropping it (or aborting it) stops the sweep.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.sweep();
            }
        })
    }

    /// Evict every expired entry across all three maps. Exposed directly
    /// (not just via `spawn_sweeper`) so tests can sweep deterministically.
    pub fn sweep(&self) {
        let now = self.clock.now();
        let mut locks = self.locks.write();
        let before = locks.len();
        locks.retain(|_, rec| !is_expired(rec.expires_at, now));
        if locks.len() != before {
            tracing::debug!(evicted = before - locks.len(), "swept expired locks");
        }
        drop(locks);

        self.limiters.write().retain(|_, rec| rec.expires_at > now);
        self.cache.write().retain(|_, rec| !is_expired(rec.expires_at, now));
    }
}

#[async_trait]
impl LockAdapter for InMemoryAdapter {
    async fn acquire(&self, key: &str, lock_id: &str, ttl: Option<Duration>) -> Result<bool> {
        let now = self.clock.now();
        let mut locks = self.locks.write();
        let vacant = match locks.get(key) {
            None => true,
            Some(rec) => is_expired(rec.expires_at, now),
        };
        if !vacant {
            return Ok(false);
        }
        locks.insert(
            key.to_owned(),
            LockRecord {
                lock_id: lock_id.to_owned(),
                expires_at: ttl.map(|d| now + to_chrono(d)),
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, lock_id: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut locks = self.locks.write();
        match locks.get(key) {
            Some(rec) if !is_expired(rec.expires_at, now) && rec.lock_id == lock_id => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn force_release(&self, key: &str) -> Result<bool> {
        Ok(self.locks.write().remove(key).is_some())
    }

    async fn refresh(&self, key: &str, lock_id: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut locks = self.locks.write();
        match locks.get_mut(key) {
            Some(rec) if rec.expires_at.is_some() && !is_expired(rec.expires_at, now) && rec.lock_id == lock_id => {
                rec.expires_at = Some(now + to_chrono(ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_state(&self, key: &str) -> Result<Option<LockRecord>> {
        let now = self.clock.now();
        let locks = self.locks.read();
        match locks.get(key) {
            Some(rec) if !is_expired(rec.expires_at, now) => Ok(Some(rec.clone())),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl RateLimiterStorageAdapter for InMemoryAdapter {
    async fn find(&self, key: &str) -> Result<Option<RateLimiterRecord>> {
        let now = self.clock.now();
        let limiters = self.limiters.read();
        match limiters.get(key) {
            Some(rec) if rec.expires_at > now => Ok(Some(rec.clone())),
            _ => Ok(None),
        }
    }

    async fn transact(&self, key: &str, transition: RateLimiterTransition) -> Result<serde_json::Value> {
        let now = self.clock.now();
        let mut limiters = self.limiters.write();
        let current = limiters.get(key).cloned().filter(|rec| rec.expires_at > now);
        let (next, outcome) = transition(current);
        limiters.insert(key.to_owned(), next);
        Ok(outcome)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.limiters.write().remove(key);
        Ok(())
    }
}

#[async_trait]
impl CacheAdapter for InMemoryAdapter {
    async fn get(&self, key: &str) -> Result<Option<CacheRecord>> {
        let now = self.clock.now();
        let cache = self.cache.read();
        match cache.get(key) {
            Some(rec) if !is_expired(rec.expires_at, now) => Ok(Some(rec.clone())),
            _ => Ok(None),
        }
    }

    async fn get_and_remove(&self, key: &str) -> Result<Option<CacheRecord>> {
        let now = self.clock.now();
        let mut cache = self.cache.write();
        match cache.remove(key) {
            Some(rec) if !is_expired(rec.expires_at, now) => Ok(Some(rec)),
            _ => Ok(None),
        }
    }

    async fn add(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<bool> {
        let now = self.clock.now();
        let mut cache = self.cache.write();
        let vacant = match cache.get(key) {
            None => true,
            Some(rec) => is_expired(rec.expires_at, now),
        };
        if !vacant {
            return Ok(false);
        }
        cache.insert(
            key.to_owned(),
            CacheRecord {
                value,
                expires_at: ttl.map(|d| now + to_chrono(d)),
            },
        );
        Ok(true)
    }

    async fn update(&self, key: &str, value: serde_json::Value) -> Result<bool> {
        let now = self.clock.now();
        let mut cache = self.cache.write();
        match cache.get_mut(key) {
            Some(rec) if !is_expired(rec.expires_at, now) => {
                rec.value = value;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn put(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<bool> {
        let now = self.clock.now();
        let mut cache = self.cache.write();
        let overwrote = matches!(cache.get(key), Some(rec) if !is_expired(rec.expires_at, now));
        cache.insert(
            key.to_owned(),
            CacheRecord {
                value,
                expires_at: ttl.map(|d| now + to_chrono(d)),
            },
        );
        Ok(overwrote)
    }

    async fn increment(&self, key: &str, delta: f64) -> Result<Option<f64>> {
        let now = self.clock.now();
        let mut cache = self.cache.write();
        match cache.get_mut(key) {
            Some(rec) if !is_expired(rec.expires_at, now) => {
                let current = rec
                    .value
                    .as_f64()
                    .ok_or_else(|| Error::TypeCache { key: key.to_owned() })?;
                let next = current + delta;
                rec.value = serde_json::json!(next);
                Ok(Some(next))
            }
            _ => Ok(None),
        }
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.cache.write().remove(key).is_some())
    }

    async fn remove_many(&self, keys: &[String]) -> Result<bool> {
        let mut cache = self.cache.write();
        let mut any = false;
        for key in keys {
            if cache.remove(key).is_some() {
                any = true;
            }
        }
        Ok(any)
    }

    async fn clear(&self, prefix: &str) -> Result<()> {
        self.cache.write().retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ks_domain::ManualClock;

    fn adapter() -> (Arc<InMemoryAdapter>, ManualClock) {
        let clock = ManualClock::epoch();
        let adapter = InMemoryAdapter::new(Arc::new(clock.clone()));
        (adapter, clock)
    }

    #[tokio::test]
    async fn lock_acquire_excludes_other_owners() {
        let (adapter, _clock) = adapter();
        assert!(adapter.acquire("k", "a", None).await.unwrap());
        assert!(!adapter.acquire("k", "b", None).await.unwrap());
    }

    #[tokio::test]
    async fn lock_acquire_after_expiry_succeeds() {
        let (adapter, clock) = adapter();
        adapter
            .acquire("k", "a", Some(Duration::from_millis(100)))
            .await
            .unwrap();
        clock.advance(chrono::Duration::milliseconds(101));
        assert!(adapter.acquire("k", "b", None).await.unwrap());
    }

    #[tokio::test]
    async fn lock_release_requires_ownership() {
        let (adapter, _clock) = adapter();
        adapter.acquire("k", "a", None).await.unwrap();
        assert!(!adapter.release("k", "b").await.unwrap());
        assert!(adapter.release("k", "a").await.unwrap());
        assert!(adapter.get_state("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_refresh_requires_ownership_and_expiring() {
        let (adapter, _clock) = adapter();
        adapter
            .acquire("k", "a", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(!adapter.refresh("k", "b", Duration::from_secs(1)).await.unwrap());
        assert!(adapter.refresh("k", "a", Duration::from_secs(5)).await.unwrap());

        adapter.acquire("non-expiring", "a", None).await.unwrap();
        assert!(!adapter
            .refresh("non-expiring", "a", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn force_release_ignores_ownership() {
        let (adapter, _clock) = adapter();
        adapter.acquire("k", "a", None).await.unwrap();
        assert!(adapter.force_release("k").await.unwrap());
        assert!(!adapter.force_release("k").await.unwrap());
    }

    #[tokio::test]
    async fn cache_add_is_insert_if_absent() {
        let (adapter, _clock) = adapter();
        assert!(adapter.add("k", serde_json::json!(1), None).await.unwrap());
        assert!(!adapter.add("k", serde_json::json!(2), None).await.unwrap());
        assert_eq!(adapter.get("k").await.unwrap().unwrap().value, serde_json::json!(1));
    }

    #[tokio::test]
    async fn cache_put_reports_overwrite() {
        let (adapter, _clock) = adapter();
        assert!(!adapter.put("k", serde_json::json!(1), None).await.unwrap());
        assert!(adapter.put("k", serde_json::json!(2), None).await.unwrap());
        assert_eq!(adapter.get("k").await.unwrap().unwrap().value, serde_json::json!(2));
    }

    #[tokio::test]
    async fn cache_update_requires_presence() {
        let (adapter, _clock) = adapter();
        assert!(!adapter.update("k", serde_json::json!(1)).await.unwrap());
        adapter.add("k", serde_json::json!(1), None).await.unwrap();
        assert!(adapter.update("k", serde_json::json!(2)).await.unwrap());
    }

    #[tokio::test]
    async fn cache_increment_requires_numeric_value() {
        let (adapter, _clock) = adapter();
        adapter.add("k", serde_json::json!("not a number"), None).await.unwrap();
        assert!(adapter.increment("k", 1.0).await.is_err());
        assert_eq!(
            adapter.get("k").await.unwrap().unwrap().value,
            serde_json::json!("not a number")
        );
    }

    #[tokio::test]
    async fn cache_increment_absent_key_returns_none() {
        let (adapter, _clock) = adapter();
        assert_eq!(adapter.increment("missing", 1.0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cache_increment_accumulates() {
        let (adapter, _clock) = adapter();
        adapter.add("k", serde_json::json!(10), None).await.unwrap();
        assert_eq!(adapter.increment("k", 5.0).await.unwrap(), Some(15.0));
        assert_eq!(adapter.increment("k", -20.0).await.unwrap(), Some(-5.0));
    }

    #[tokio::test]
    async fn cache_get_and_remove_is_atomic() {
        let (adapter, _clock) = adapter();
        adapter.add("k", serde_json::json!(1), None).await.unwrap();
        let taken = adapter.get_and_remove("k").await.unwrap().unwrap();
        assert_eq!(taken.value, serde_json::json!(1));
        assert!(adapter.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cache_clear_matches_prefix_only() {
        let (adapter, _clock) = adapter();
        adapter.add("ns:a", serde_json::json!(1), None).await.unwrap();
        adapter.add("ns:b", serde_json::json!(1), None).await.unwrap();
        adapter.add("other:c", serde_json::json!(1), None).await.unwrap();
        adapter.clear("ns:").await.unwrap();
        assert!(adapter.get("ns:a").await.unwrap().is_none());
        assert!(adapter.get("ns:b").await.unwrap().is_none());
        assert!(adapter.get("other:c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rate_limiter_transact_sees_prior_state() {
        let (adapter, clock) = adapter();
        let now = clock.now();
        let outcome = adapter
            .transact(
                "k",
                Box::new(move |current| {
                    assert!(current.is_none());
                    (
                        RateLimiterRecord {
                            state: serde_json::json!({"attempt": 1}),
                            expires_at: now + chrono::Duration::seconds(60),
                        },
                        serde_json::json!("allowed"),
                    )
                }),
            )
            .await
            .unwrap();
        assert_eq!(outcome, serde_json::json!("allowed"));

        let found = adapter.find("k").await.unwrap().unwrap();
        assert_eq!(found.state, serde_json::json!({"attempt": 1}));
    }

    #[tokio::test]
    async fn rate_limiter_expired_record_reads_as_absent() {
        let (adapter, clock) = adapter();
        let now = clock.now();
        adapter
            .transact(
                "k",
                Box::new(move |_| {
                    (
                        RateLimiterRecord {
                            state: serde_json::json!({"attempt": 1}),
                            expires_at: now + chrono::Duration::milliseconds(50),
                        },
                        serde_json::json!(null),
                    )
                }),
            )
            .await
            .unwrap();
        clock.advance(chrono::Duration::milliseconds(100));
        assert!(adapter.find("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_evicts_expired_entries_across_maps() {
        let (adapter, clock) = adapter();
        adapter
            .acquire("lock-k", "a", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        adapter
            .add("cache-k", serde_json::json!(1), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        clock.advance(chrono::Duration::milliseconds(20));
        adapter.sweep();
        assert!(adapter.get_state("lock-k").await.unwrap().is_none());
        assert!(adapter.get("cache-k").await.unwrap().is_none());
    }
}
