//! Root facade crate: one dependency that pulls in the namespace,
//! event bus, serde registry, task middleware, storage contracts, and
//! the three engines (lock, rate-limiter, cache), plus a [`Keystone`]
//! struct that bundles a working set of them into one shared-services
//! handle.
//!
//! Reaching for a specific engine directly (`ks_lock::LockProvider`,
//! `ks_cache::CacheProvider`, ...) works too — this crate only adds
//! convenience, it doesn't hide anything.

pub mod config;
pub mod defaults;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use ks_domain::{Clock, Error, ManualClock, Result, SharedClock, SystemClock};
pub use ks_events::{EventBus, InProcessEventBus, NoOpEventBus};
pub use ks_namespace::{EncodedKey, Key, Namespace};
pub use ks_serde::SerdeRegistry;
pub use ks_storage::{CacheAdapter, InMemoryAdapter, LockAdapter, RateLimiterStorageAdapter};
pub use ks_task::{Task, TaskCtx, TaskError};

pub use ks_cache::{CacheEntry, CacheProvider};
pub use ks_lock::{Lock, LockProvider, LockState};
pub use ks_ratelimiter::{RateLimiter, RateLimiterProvider};

#[cfg(feature = "redis-backend")]
pub use ks_storage_redis as redis_backend;
#[cfg(feature = "mongodb-backend")]
pub use ks_storage_mongodb as mongodb_backend;
#[cfg(feature = "sql-backend")]
pub use ks_storage_sql as sql_backend;

pub use config::Config;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A working set of providers over one adapter/namespace/event-bus
/// triple. Built directly with [`Keystone::new`] for the in-memory
/// default, or assembled piece by piece with [`KeystoneBuilder`] to
/// swap in a `ks-storage-redis`/`-mongodb`/`-sql` backend.
pub struct Keystone {
    events: Arc<dyn EventBus>,
    cache: CacheProvider,
    lock: LockProvider,
    rate_limiters: HashMap<String, RateLimiterProvider>,
}

impl Keystone {
    /// The in-memory default: one shared [`InMemoryAdapter`] backs
    /// every engine, events are dispatched through an
    /// [`InProcessEventBus`], and a background task sweeps expired
    /// rows every minute.
    pub fn new(config: Config) -> Self {
        KeystoneBuilder::new(config).build()
    }

    pub fn events(&self) -> &Arc<dyn EventBus> {
        &self.events
    }

    pub fn cache(&self) -> &CacheProvider {
        &self.cache
    }

    pub fn lock(&self) -> &LockProvider {
        &self.lock
    }

    /// `None` if `name` wasn't present in the `[rate_limiters]` table
    /// of the [`Config`] this instance was built from.
    pub fn rate_limiter(&self, name: &str) -> Option<&RateLimiterProvider> {
        self.rate_limiters.get(name)
    }
}

/// Assembles a [`Keystone`], defaulting every engine to a shared
/// [`InMemoryAdapter`] and overriding individual adapters/event bus/
/// clock as needed. Each `with_*` call consumes and returns `self`,
/// mirroring `Namespace`'s immutable-builder style.
pub struct KeystoneBuilder {
    config: Config,
    clock: SharedClock,
    events: Option<Arc<dyn EventBus>>,
    lock_adapter: Option<(Arc<dyn LockAdapter>, String)>,
    rate_limiter_adapter: Option<(Arc<dyn RateLimiterStorageAdapter>, String)>,
    cache_adapter: Option<(Arc<dyn CacheAdapter>, String)>,
}

impl KeystoneBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: ks_domain::clock::system_clock(),
            events: None,
            lock_adapter: None,
            rate_limiter_adapter: None,
            cache_adapter: None,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_bus(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_lock_adapter(mut self, adapter: Arc<dyn LockAdapter>, label: impl Into<String>) -> Self {
        self.lock_adapter = Some((adapter, label.into()));
        self
    }

    pub fn with_rate_limiter_adapter(
        mut self,
        adapter: Arc<dyn RateLimiterStorageAdapter>,
        label: impl Into<String>,
    ) -> Self {
        self.rate_limiter_adapter = Some((adapter, label.into()));
        self
    }

    pub fn with_cache_adapter(mut self, adapter: Arc<dyn CacheAdapter>, label: impl Into<String>) -> Self {
        self.cache_adapter = Some((adapter, label.into()));
        self
    }

    pub fn build(self) -> Keystone {
        let shared = InMemoryAdapter::new(self.clock.clone());
        shared.spawn_sweeper(SWEEP_INTERVAL);

        let events = self.events.unwrap_or_else(|| Arc::new(InProcessEventBus::new(self.clock.clone())));
        let root = Namespace::new(self.config.namespace.root.clone(), self.config.namespace.root_id.clone());

        let (lock_adapter, lock_label): (Arc<dyn LockAdapter>, String) = self
            .lock_adapter
            .unwrap_or_else(|| (shared.clone() as Arc<dyn LockAdapter>, "in_memory".to_owned()));
        let (rate_limiter_adapter, rate_limiter_label): (Arc<dyn RateLimiterStorageAdapter>, String) = self
            .rate_limiter_adapter
            .unwrap_or_else(|| (shared.clone() as Arc<dyn RateLimiterStorageAdapter>, "in_memory".to_owned()));
        let (cache_adapter, cache_label): (Arc<dyn CacheAdapter>, String) = self
            .cache_adapter
            .unwrap_or_else(|| (shared.clone() as Arc<dyn CacheAdapter>, "in_memory".to_owned()));

        let cache = CacheProvider::new(
            cache_adapter,
            root.clone().append_root("cache"),
            events.clone(),
            self.clock.clone(),
            self.config.cache.clone(),
            None,
            &cache_label,
        );
        let lock = LockProvider::new(
            lock_adapter,
            root.clone().append_root("lock"),
            events.clone(),
            self.clock.clone(),
            self.config.lock.clone(),
            &lock_label,
        );
        let rate_limiters = self
            .config
            .rate_limiters
            .iter()
            .map(|(name, rl_config)| {
                let provider = RateLimiterProvider::new(
                    rate_limiter_adapter.clone(),
                    root.clone().append_root("ratelimiter").append_root(name.clone()),
                    events.clone(),
                    self.clock.clone(),
                    rl_config.clone(),
                    &rate_limiter_label,
                );
                (name.clone(), provider)
            })
            .collect();

        Keystone { events, cache, lock, rate_limiters }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_builds_working_cache_and_lock_providers() {
        let keystone = Keystone::new(Config::default());

        let entry = keystone.cache().entry("session:1");
        assert!(entry.add(serde_json::json!({"active": true}), None).await.unwrap());
        assert!(entry.exists().await.unwrap());

        let lock = keystone.lock().lock("job:1");
        assert!(lock.run_or_fail(|| async {}).await.is_ok());
    }

    #[tokio::test]
    async fn named_rate_limiters_come_from_the_config_table() {
        let mut config = Config::default();
        config.rate_limiters.insert(
            "login".to_owned(),
            ks_domain::config::RateLimiterConfig {
                limit: 5,
                window_ms: 1_000,
                policy: ks_domain::config::PolicyKind::FixedWindow,
                backoff: ks_domain::config::BackoffKind::default(),
                jitter: 0.0,
                namespace_root: Vec::new(),
            },
        );
        let keystone = Keystone::new(config);

        assert!(keystone.rate_limiter("login").is_some());
        assert!(keystone.rate_limiter("signup").is_none());
    }
}
