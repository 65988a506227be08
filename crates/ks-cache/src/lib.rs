//! Key-indexed TTL cache over a pluggable storage adapter.
//!
//! A [`CacheProvider`] owns an adapter, a namespace, an event bus, an
//! optional schema [`Validator`], and a default TTL; it mints
//! [`CacheEntry`] handles keyed by a caller-chosen key. Bulk operations
//! (`remove_many`, `clear`) live on the provider itself since they don't
//! target a single key.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ks_domain::config::CacheConfig;
use ks_domain::{CacheEvent, Error, Result, SharedClock};
use ks_events::EventBus;
use ks_namespace::{EncodedKey, Key, Namespace};
use ks_serde::{transformer_name, SerdeRegistry, HANDLE_FORMAT_VERSION};
use ks_storage::{CacheAdapter, CacheRecord};

/// A caller-supplied schema check run on every value written to, and
/// read from, the cache. Returns `false` to reject a value.
pub type Validator = Arc<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

/// The minimal record a `CacheEntry` serializes to. Rehydrated via
/// `CacheEntry::deserialize`, which looks `name` up in the process-local
/// `SerdeRegistry` to rebind the adapter/namespace/event bus/validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedCacheEntry {
    pub version: u8,
    pub name: String,
    pub key: EncodedKey,
}

struct CacheCollaborators {
    adapter: Arc<dyn CacheAdapter>,
    namespace: Namespace,
    events: Arc<dyn EventBus>,
    clock: SharedClock,
    validator: Option<Validator>,
    default_ttl: Option<Duration>,
}

/// Owns an adapter, namespace, event bus and validator; mints [`CacheEntry`] handles.
pub struct CacheProvider {
    collaborators: Arc<CacheCollaborators>,
    name: String,
}

impl CacheProvider {
    pub fn new(
        adapter: Arc<dyn CacheAdapter>,
        namespace: Namespace,
        events: Arc<dyn EventBus>,
        clock: SharedClock,
        config: CacheConfig,
        validator: Option<Validator>,
        adapter_class: &str,
    ) -> Self {
        let name = transformer_name("cache", adapter_class, &namespace.prefix());
        let collaborators = Arc::new(CacheCollaborators {
            adapter,
            namespace,
            events,
            clock,
            validator,
            default_ttl: config.default_ttl_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
        });
        SerdeRegistry::global().register_custom(name.clone(), collaborators.clone());
        Self { collaborators, name }
    }

    pub fn entry(&self, key: impl Into<Key>) -> CacheEntry {
        CacheEntry {
            collaborators: self.collaborators.clone(),
            key: self.collaborators.namespace.create(key),
            name: self.name.clone(),
        }
    }

    /// Delete `keys` (namespace-encoded by this provider). `true` iff at
    /// least one of them existed.
    pub async fn remove_many<K: Into<Key>>(&self, keys: impl IntoIterator<Item = K>) -> Result<bool> {
        let encoded: Vec<String> = keys
            .into_iter()
            .map(|k| self.collaborators.namespace.create(k))
            .collect();
        self.collaborators.adapter.remove_many(&encoded).await
    }

    /// Delete every key under this provider's namespace prefix.
    pub async fn clear(&self) -> Result<()> {
        let prefix = self.collaborators.namespace.prefix();
        self.collaborators.adapter.clear(&prefix).await?;
        let payload = serde_json::to_value(&CacheEvent::Cleared { prefix: prefix.clone() })
            .unwrap_or(serde_json::Value::Null);
        let topic = format!("cache:{prefix}");
        self.collaborators.events.dispatch(&topic, payload).await;
        Ok(())
    }
}

/// A handle bound to one key. Cheap to clone; every method reads or
/// writes the current persisted record through the provider's adapter.
#[derive(Clone)]
pub struct CacheEntry {
    collaborators: Arc<CacheCollaborators>,
    key: EncodedKey,
    name: String,
}

impl CacheEntry {
    pub fn key(&self) -> &str {
        &self.key
    }

    fn is_expired(&self, record: &CacheRecord) -> bool {
        record
            .expires_at
            .map(|at| at <= self.collaborators.clock.now())
            .unwrap_or(false)
    }

    fn check(&self, value: &serde_json::Value) -> Result<()> {
        match &self.collaborators.validator {
            Some(validator) if !validator(value) => Err(Error::TypeCache { key: self.key.clone() }),
            _ => Ok(()),
        }
    }

    fn ttl_or_default(&self, ttl: Option<Duration>) -> Option<Duration> {
        ttl.or(self.collaborators.default_ttl)
    }

    async fn read_live(&self) -> Result<Option<serde_json::Value>> {
        match self.collaborators.adapter.get(&self.key).await? {
            Some(record) if !self.is_expired(&record) => {
                self.check(&record.value)?;
                Ok(Some(record.value))
            }
            _ => Ok(None),
        }
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(self.read_live().await?.is_some())
    }

    pub async fn missing(&self) -> Result<bool> {
        Ok(!self.exists().await?)
    }

    pub async fn get(&self) -> Result<Option<serde_json::Value>> {
        let value = self.read_live().await?;
        self.emit(if value.is_some() {
            CacheEvent::Found { key: self.key.clone() }
        } else {
            CacheEvent::NotFound { key: self.key.clone() }
        })
        .await;
        Ok(value)
    }

    pub async fn get_or_fail(&self) -> Result<serde_json::Value> {
        self.get().await?.ok_or_else(|| Error::KeyNotFoundCache(self.key.clone()))
    }

    /// Atomic get+delete.
    pub async fn get_and_remove(&self) -> Result<Option<serde_json::Value>> {
        match self.collaborators.adapter.get_and_remove(&self.key).await? {
            Some(record) if !self.is_expired(&record) => {
                self.check(&record.value)?;
                self.emit(CacheEvent::Removed { key: self.key.clone() }).await;
                Ok(Some(record.value))
            }
            _ => Ok(None),
        }
    }

    /// Read, else call `default` and return it without storing.
    pub async fn get_or<F, Fut>(&self, default: F) -> Result<serde_json::Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = serde_json::Value>,
    {
        if let Some(value) = self.read_live().await? {
            return Ok(value);
        }
        Ok(default().await)
    }

    /// Read, else evaluate `default`, insert (only if still absent), and
    /// return it.
    pub async fn get_or_add<F, Fut>(&self, default: F, ttl: Option<Duration>) -> Result<serde_json::Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = serde_json::Value>,
    {
        if let Some(value) = self.read_live().await? {
            return Ok(value);
        }
        let value = default().await;
        self.check(&value)?;
        let inserted = self
            .collaborators
            .adapter
            .add(&self.key, value.clone(), self.ttl_or_default(ttl))
            .await?;
        if inserted {
            self.emit(CacheEvent::Added { key: self.key.clone() }).await;
        }
        Ok(value)
    }

    /// Insert-if-absent. `true` iff inserted.
    pub async fn add(&self, value: serde_json::Value, ttl: Option<Duration>) -> Result<bool> {
        self.check(&value)?;
        let inserted = self
            .collaborators
            .adapter
            .add(&self.key, value, self.ttl_or_default(ttl))
            .await?;
        if inserted {
            self.emit(CacheEvent::Added { key: self.key.clone() }).await;
        }
        Ok(inserted)
    }

    pub async fn add_or_fail(&self, value: serde_json::Value, ttl: Option<Duration>) -> Result<()> {
        if self.add(value, ttl).await? {
            Ok(())
        } else {
            Err(Error::KeyExistsCache(self.key.clone()))
        }
    }

    /// Update-if-present. `true` iff updated.
    pub async fn update(&self, value: serde_json::Value) -> Result<bool> {
        self.check(&value)?;
        let updated = self.collaborators.adapter.update(&self.key, value).await?;
        if updated {
            self.emit(CacheEvent::Updated { key: self.key.clone() }).await;
        }
        Ok(updated)
    }

    pub async fn update_or_fail(&self, value: serde_json::Value) -> Result<()> {
        if self.update(value).await? {
            Ok(())
        } else {
            Err(Error::KeyNotFoundCache(self.key.clone()))
        }
    }

    /// Upsert. `true` iff an existing value was overwritten.
    pub async fn put(&self, value: serde_json::Value, ttl: Option<Duration>) -> Result<bool> {
        self.check(&value)?;
        let overwritten = self
            .collaborators
            .adapter
            .put(&self.key, value, self.ttl_or_default(ttl))
            .await?;
        self.emit(if overwritten {
            CacheEvent::Updated { key: self.key.clone() }
        } else {
            CacheEvent::Added { key: self.key.clone() }
        })
        .await;
        Ok(overwritten)
    }

    /// Atomic numeric delta on an existing value. `Ok(None)` if absent;
    /// `Err(TypeCache)` if the stored value isn't numeric.
    pub async fn increment(&self, delta: f64) -> Result<Option<f64>> {
        let result = self.collaborators.adapter.increment(&self.key, delta).await?;
        if result.is_some() {
            self.emit(if delta >= 0.0 {
                CacheEvent::Incremented { key: self.key.clone(), delta }
            } else {
                CacheEvent::Decremented { key: self.key.clone(), delta: delta.abs() }
            })
            .await;
        }
        Ok(result)
    }

    pub async fn decrement(&self, delta: f64) -> Result<Option<f64>> {
        self.increment(-delta).await
    }

    /// `true` iff the key existed.
    pub async fn remove(&self) -> Result<bool> {
        let removed = self.collaborators.adapter.remove(&self.key).await?;
        if removed {
            self.emit(CacheEvent::Removed { key: self.key.clone() }).await;
        }
        Ok(removed)
    }

    pub async fn remove_or_fail(&self) -> Result<()> {
        if self.remove().await? {
            Ok(())
        } else {
            Err(Error::KeyNotFoundCache(self.key.clone()))
        }
    }

    async fn emit(&self, event: CacheEvent) {
        let payload = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
        let topic = format!("cache:{}", self.collaborators.namespace.prefix());
        self.collaborators.events.dispatch(&topic, payload).await;
    }

    pub fn serialize(&self) -> SerializedCacheEntry {
        SerializedCacheEntry {
            version: HANDLE_FORMAT_VERSION,
            name: self.name.clone(),
            key: self.key.clone(),
        }
    }

    pub fn deserialize(record: &SerializedCacheEntry) -> Result<CacheEntry> {
        let collaborators = SerdeRegistry::global()
            .get::<CacheCollaborators>(&record.name)
            .ok_or_else(|| Error::UnregisteredAdapter(record.name.clone()))?;
        Ok(CacheEntry {
            collaborators,
            key: record.key.clone(),
            name: record.name.clone(),
        })
    }
}
