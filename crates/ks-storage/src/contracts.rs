//! Adapter contracts: the minimal CRUD + atomic primitive surface each
//! engine drives. An adapter implementation only needs to guarantee
//! atomicity of each individual method with respect to concurrent
//! callers on the same key — engines never hold more than one adapter
//! call/transaction open at a time.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ks_domain::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lock
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub struct LockRecord {
    pub lock_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait LockAdapter: Send + Sync {
    /// Atomic insert-if-absent-or-expired, stamping `lock_id` as owner.
    async fn acquire(&self, key: &str, lock_id: &str, ttl: Option<Duration>) -> Result<bool>;
    /// Atomic delete-if-owner.
    async fn release(&self, key: &str, lock_id: &str) -> Result<bool>;
    /// Unconditional delete.
    async fn force_release(&self, key: &str) -> Result<bool>;
    /// Atomic update-expiration-if-owner-and-expiring.
    async fn refresh(&self, key: &str, lock_id: &str, ttl: Duration) -> Result<bool>;
    async fn get_state(&self, key: &str) -> Result<Option<LockRecord>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rate limiter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct RateLimiterRecord {
    pub state: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

/// What a `transition` closure hands back to the caller of [`RateLimiterStorageAdapter::transact`]
/// alongside the record it persists. Engines encode their state-machine
/// outcome (allowed/blocked, attempt count, ...) as JSON so the adapter
/// boundary stays non-generic and object-safe.
pub type RateLimiterTransition =
    Box<dyn FnOnce(Option<RateLimiterRecord>) -> (RateLimiterRecord, serde_json::Value) + Send>;

#[async_trait]
pub trait RateLimiterStorageAdapter: Send + Sync {
    async fn find(&self, key: &str) -> Result<Option<RateLimiterRecord>>;
    /// Atomically read the current record for `key` (or `None`), hand it
    /// to `transition` to compute the next record synchronously, persist
    /// that record, and return whatever `transition` reported. The whole
    /// read-compute-write must be serializable w.r.t. concurrent callers
    /// on the same key.
    async fn transact(&self, key: &str, transition: RateLimiterTransition) -> Result<serde_json::Value>;
    async fn remove(&self, key: &str) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct CacheRecord {
    pub value: serde_json::Value,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait CacheAdapter: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheRecord>>;
    /// Atomic get-then-delete.
    async fn get_and_remove(&self, key: &str) -> Result<Option<CacheRecord>>;
    /// Insert-if-absent. `true` iff inserted.
    async fn add(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<bool>;
    /// Update-if-present. `true` iff updated.
    async fn update(&self, key: &str, value: serde_json::Value) -> Result<bool>;
    /// Upsert. `true` iff an existing value was overwritten.
    async fn put(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<bool>;
    /// Atomic numeric delta on an existing value. `Ok(None)` if the key
    /// is absent; `Err(TypeCache)` if the stored value isn't numeric.
    async fn increment(&self, key: &str, delta: f64) -> Result<Option<f64>>;
    /// `true` iff the key existed.
    async fn remove(&self, key: &str) -> Result<bool>;
    /// `true` iff at least one of `keys` existed.
    async fn remove_many(&self, keys: &[String]) -> Result<bool>;
    /// Delete every stored key starting with `prefix`.
    async fn clear(&self, prefix: &str) -> Result<()>;
}
