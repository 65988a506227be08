//! Distributed mutual exclusion over a pluggable storage adapter.
//!
//! A [`LockProvider`] owns an adapter, a namespace, and an event bus; it
//! mints [`Lock`] handles, each an immutable `{key, lock_id, ttl}` that
//! authenticates itself to the adapter via `lock_id`. `run`/`run_or_fail`/
//! `run_blocking_or_fail` wrap acquire-execute-release so a caller's `fn`
//! always runs under the lock and the lock is always released afterward,
//! panic included.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use ks_domain::config::{BlockingConfig, LockConfig};
use ks_domain::{Error, LockEvent, Result, SharedClock};
use ks_events::EventBus;
use ks_namespace::{EncodedKey, Key, Namespace};
use ks_serde::{transformer_name, SerdeRegistry, HANDLE_FORMAT_VERSION};
use ks_storage::LockAdapter;

/// Read-only view of a lock record, as reported by `Lock::get_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LockState {
    Acquired { remaining_time_ms: Option<i64> },
    Unavailable,
    Expired,
}

/// The minimal record a `Lock` serializes to. Rehydrated via
/// `Lock::deserialize`, which looks `name` up in the process-local
/// `SerdeRegistry` to rebind the adapter/namespace/event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedLock {
    pub version: u8,
    pub name: String,
    pub key: EncodedKey,
    pub lock_id: String,
    pub ttl_ms: Option<i64>,
}

struct LockCollaborators {
    adapter: Arc<dyn LockAdapter>,
    namespace: Namespace,
    events: Arc<dyn EventBus>,
    clock: SharedClock,
}

/// Owns an adapter, namespace, and event bus; mints [`Lock`] handles.
pub struct LockProvider {
    collaborators: Arc<LockCollaborators>,
    config: LockConfig,
    name: String,
}

impl LockProvider {
    pub fn new(
        adapter: Arc<dyn LockAdapter>,
        namespace: Namespace,
        events: Arc<dyn EventBus>,
        clock: SharedClock,
        config: LockConfig,
        adapter_class: &str,
    ) -> Self {
        let name = transformer_name("lock", adapter_class, &namespace.prefix());
        let collaborators = Arc::new(LockCollaborators {
            adapter,
            namespace,
            events,
            clock,
        });
        SerdeRegistry::global().register_custom(name.clone(), collaborators.clone());
        Self {
            collaborators,
            config,
            name,
        }
    }

    /// Mint a handle for `key`, generating a fresh owning `lock_id`.
    pub fn lock(&self, key: impl Into<Key>) -> Lock {
        self.lock_with_id(key, uuid::Uuid::new_v4().to_string())
    }

    /// Mint a handle for `key` with a caller-supplied `lock_id`, e.g. to
    /// recreate a handle a different part of the process already owns.
    pub fn lock_with_id(&self, key: impl Into<Key>, lock_id: impl Into<String>) -> Lock {
        Lock {
            collaborators: self.collaborators.clone(),
            key: self.collaborators.namespace.create(key),
            lock_id: lock_id.into(),
            ttl: self.config.default_ttl_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
            name: self.name.clone(),
        }
    }
}

/// An immutable `{key, lock_id, ttl}` handle.
#[derive(Clone)]
pub struct Lock {
    collaborators: Arc<LockCollaborators>,
    key: EncodedKey,
    lock_id: String,
    ttl: Option<Duration>,
    name: String,
}

impl Lock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// Create iff absent or expired. Non-retriable at this level; callers
    /// compose their own retry via `ks_task::middleware::Retry`.
    pub async fn acquire(&self) -> Result<bool> {
        let ok = self
            .collaborators
            .adapter
            .acquire(&self.key, &self.lock_id, self.ttl)
            .await?;
        if ok {
            self.emit(LockEvent::Acquired {
                key: self.key.clone(),
                lock_id: self.lock_id.clone(),
            })
            .await;
        }
        Ok(ok)
    }

    pub async fn acquire_or_fail(&self) -> Result<()> {
        if self.acquire().await? {
            Ok(())
        } else {
            Err(Error::FailedAcquireLock { key: self.key.clone() })
        }
    }

    /// Retry `acquire` every `cfg.interval_ms` until success, `cfg.time_ms`
    /// elapses, or `cancel` fires.
    pub async fn acquire_blocking(&self, cfg: BlockingConfig, cancel: CancellationToken) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(cfg.time_ms);
        loop {
            if self.acquire().await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline || cancel.is_cancelled() {
                return Ok(false);
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(cfg.interval_ms)) => {}
                _ = cancel.cancelled() => return Ok(false),
            }
        }
    }

    /// Delete iff the stored owner matches `self.lock_id`.
    pub async fn release(&self) -> Result<bool> {
        let ok = self.collaborators.adapter.release(&self.key, &self.lock_id).await?;
        if ok {
            self.emit(LockEvent::Released {
                key: self.key.clone(),
                lock_id: self.lock_id.clone(),
            })
            .await;
        } else {
            self.emit_release_failure().await;
        }
        Ok(ok)
    }

    async fn emit_release_failure(&self) {
        let event = match self.collaborators.adapter.get_state(&self.key).await {
            Ok(Some(rec)) if rec.lock_id != self.lock_id => LockEvent::UnownedRelease {
                key: self.key.clone(),
                lock_id: self.lock_id.clone(),
            },
            _ => LockEvent::FailedRelease {
                key: self.key.clone(),
                lock_id: self.lock_id.clone(),
            },
        };
        self.emit(event).await;
    }

    /// Delete unconditionally, regardless of owner.
    pub async fn force_release(&self) -> Result<bool> {
        let ok = self.collaborators.adapter.force_release(&self.key).await?;
        if ok {
            self.emit(LockEvent::ForceReleased { key: self.key.clone() }).await;
        }
        Ok(ok)
    }

    /// Update `expiresAt = now + ttl`, only if the record is expiring and
    /// owned by `self.lock_id`.
    pub async fn refresh(&self, ttl: Duration) -> Result<bool> {
        let ok = self
            .collaborators
            .adapter
            .refresh(&self.key, &self.lock_id, ttl)
            .await?;
        if ok {
            self.emit(LockEvent::Refreshed {
                key: self.key.clone(),
                lock_id: self.lock_id.clone(),
                ttl_ms: Some(ttl.as_millis() as i64),
            })
            .await;
        } else {
            self.emit_refresh_failure().await;
        }
        Ok(ok)
    }

    async fn emit_refresh_failure(&self) {
        let event = match self.collaborators.adapter.get_state(&self.key).await {
            Ok(Some(rec)) if rec.lock_id != self.lock_id => LockEvent::UnownedRefresh {
                key: self.key.clone(),
                lock_id: self.lock_id.clone(),
            },
            _ => LockEvent::FailedRefresh {
                key: self.key.clone(),
                lock_id: self.lock_id.clone(),
            },
        };
        self.emit(event).await;
    }

    pub async fn get_state(&self) -> Result<LockState> {
        match self.collaborators.adapter.get_state(&self.key).await? {
            Some(rec) if rec.lock_id == self.lock_id => {
                let remaining_time_ms = rec
                    .expires_at
                    .map(|at| (at - self.collaborators.clock.now()).num_milliseconds());
                Ok(LockState::Acquired { remaining_time_ms })
            }
            Some(_) => Ok(LockState::Unavailable),
            None => Ok(LockState::Expired),
        }
    }

    /// Acquire, run `f`, and always release — including when `f` panics.
    /// Returns `None` without running `f` if acquisition failed.
    pub async fn run<F, Fut, T>(&self, f: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire().await? {
            return Ok(None);
        }
        let mut guard = ReleaseGuard::armed(self.clone());
        let result = f().await;
        guard.disarm();
        self.release().await?;
        Ok(Some(result))
    }

    pub async fn run_or_fail<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.run(f)
            .await?
            .ok_or_else(|| Error::FailedAcquireLock { key: self.key.clone() })
    }

    pub async fn run_blocking_or_fail<F, Fut, T>(
        &self,
        cfg: BlockingConfig,
        cancel: CancellationToken,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire_blocking(cfg, cancel).await? {
            return Err(Error::FailedAcquireLock { key: self.key.clone() });
        }
        let mut guard = ReleaseGuard::armed(self.clone());
        let result = f().await;
        guard.disarm();
        self.release().await?;
        Ok(result)
    }

    async fn emit(&self, event: LockEvent) {
        let payload = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
        let topic = format!("lock:{}", self.collaborators.namespace.prefix());
        self.collaborators.events.dispatch(&topic, payload).await;
    }

    pub fn serialize(&self) -> SerializedLock {
        SerializedLock {
            version: HANDLE_FORMAT_VERSION,
            name: self.name.clone(),
            key: self.key.clone(),
            lock_id: self.lock_id.clone(),
            ttl_ms: self.ttl.map(|d| d.as_millis() as i64),
        }
    }

    pub fn deserialize(record: &SerializedLock) -> Result<Lock> {
        let collaborators = SerdeRegistry::global()
            .get::<LockCollaborators>(&record.name)
            .ok_or_else(|| Error::UnregisteredAdapter(record.name.clone()))?;
        Ok(Lock {
            collaborators,
            key: record.key.clone(),
            lock_id: record.lock_id.clone(),
            ttl: record.ttl_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
            name: record.name.clone(),
        })
    }
}

/// Releases the lock on drop unless disarmed. Exists so `run`'s contract
/// ("always releases, including on panic") holds even though Rust can't
/// await inside a synchronous `Drop`: the panic path spawns a detached
/// best-effort release rather than blocking the unwind.
struct ReleaseGuard {
    lock: Lock,
    armed: bool,
}

impl ReleaseGuard {
    fn armed(lock: Lock) -> Self {
        Self { lock, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if self.armed {
            let lock = self.lock.clone();
            tokio::spawn(async move {
                if let Err(err) = lock.release().await {
                    tracing::warn!(error = %err, "panic-path lock release failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ks_domain::config::LockConfig;
    use ks_domain::ManualClock;
    use ks_events::InProcessEventBus;
    use ks_storage::InMemoryAdapter;

    fn provider(config: LockConfig) -> (LockProvider, ManualClock) {
        let clock = ManualClock::epoch();
        let adapter = InMemoryAdapter::new(Arc::new(clock.clone()));
        let events: Arc<dyn EventBus> = Arc::new(InProcessEventBus::new(Arc::new(clock.clone())));
        let provider = LockProvider::new(
            adapter,
            Namespace::new(vec!["lock".into()], "test"),
            events,
            Arc::new(clock.clone()),
            config,
            "in_memory",
        );
        (provider, clock)
    }

    #[tokio::test]
    async fn acquire_excludes_other_owner() {
        let (provider, _clock) = provider(LockConfig::default());
        let a = provider.lock("k");
        let b = provider.lock("k");
        assert!(a.acquire().await.unwrap());
        assert!(!b.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn refresh_extends_ttl_for_owner_only() {
        let (provider, clock) = provider(LockConfig {
            default_ttl_ms: Some(200),
            ..Default::default()
        });
        let a = provider.lock("k");
        assert!(a.acquire().await.unwrap());
        clock.advance(chrono::Duration::milliseconds(150));
        assert!(a.refresh(Duration::from_millis(200)).await.unwrap());

        let b = provider.lock("k");
        assert!(!b.refresh(Duration::from_millis(200)).await.unwrap());
    }

    #[tokio::test]
    async fn release_requires_ownership_and_reports_state() {
        let (provider, _clock) = provider(LockConfig::default());
        let a = provider.lock("k");
        let b = provider.lock("k");
        a.acquire().await.unwrap();
        assert!(!b.release().await.unwrap());
        assert!(a.release().await.unwrap());
        assert_eq!(a.get_state().await.unwrap(), LockState::Expired);
    }

    #[tokio::test]
    async fn get_state_reports_unavailable_for_other_owner() {
        let (provider, _clock) = provider(LockConfig::default());
        let a = provider.lock("k");
        let b = provider.lock("k");
        a.acquire().await.unwrap();
        assert_eq!(b.get_state().await.unwrap(), LockState::Unavailable);
    }

    #[tokio::test]
    async fn run_always_releases_after_success() {
        let (provider, _clock) = provider(LockConfig::default());
        let lock = provider.lock("k");
        let ran = lock.run(|| async { 42 }).await.unwrap();
        assert_eq!(ran, Some(42));
        assert_eq!(lock.get_state().await.unwrap(), LockState::Expired);
    }

    #[tokio::test]
    async fn run_returns_none_when_already_held() {
        let (provider, _clock) = provider(LockConfig::default());
        let a = provider.lock("k");
        let b = provider.lock("k");
        a.acquire().await.unwrap();
        let ran = b.run(|| async { 1 }).await.unwrap();
        assert_eq!(ran, None);
    }

    #[tokio::test]
    async fn acquire_blocking_retries_until_available() {
        let (provider, _clock) = provider(LockConfig::default());
        let holder = provider.lock("k");
        holder.acquire().await.unwrap();

        let waiter = provider.lock("k");
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            holder.release().await.unwrap();
        });

        let acquired = waiter
            .acquire_blocking(
                BlockingConfig {
                    time_ms: 500,
                    interval_ms: 5,
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(acquired);
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn acquire_blocking_times_out() {
        let (provider, _clock) = provider(LockConfig::default());
        let holder = provider.lock("k");
        holder.acquire().await.unwrap();
        let waiter = provider.lock("k");
        let ok = waiter
            .acquire_blocking(
                BlockingConfig {
                    time_ms: 20,
                    interval_ms: 5,
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn serialize_deserialize_round_trips() {
        let (provider, _clock) = provider(LockConfig {
            default_ttl_ms: None,
            ..Default::default()
        });
        let lock = provider.lock("k");
        lock.acquire().await.unwrap();

        let record = lock.serialize();
        let rehydrated = Lock::deserialize(&record).unwrap();
        assert_eq!(rehydrated.key(), lock.key());
        assert_eq!(rehydrated.lock_id(), lock.lock_id());
        assert_eq!(rehydrated.get_state().await.unwrap(), LockState::Acquired { remaining_time_ms: None });
    }
}
