//! Request throttling over a pluggable storage adapter.
//!
//! A [`RateLimiterProvider`] owns an adapter, a namespace, an event bus,
//! a window [`Policy`], and a backoff shape; it mints [`RateLimiter`]
//! handles keyed by a caller-chosen key. Each call to `run_or_fail`
//! drives one atomic read-compute-write against the adapter (via
//! [`ks_storage::RateLimiterStorageAdapter::transact`]) before deciding
//! whether the wrapped `fn` gets to run at all.

pub mod policy;

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ks_domain::config::{BackoffKind, PolicyKind, RateLimiterConfig};
use ks_domain::{Error, RateLimiterEvent, Result, SharedClock};
use ks_events::EventBus;
use ks_namespace::{EncodedKey, Key, Namespace};
use ks_serde::{transformer_name, SerdeRegistry, HANDLE_FORMAT_VERSION};
use ks_storage::{RateLimiterRecord, RateLimiterStorageAdapter};
use ks_task::middleware::{
    constant_backoff, exponential_backoff, linear_backoff, polynomial_backoff, with_jitter, BackoffFn,
};

use policy::{FixedWindow, Policy, SlidingWindow};

/// The minimal record a `RateLimiter` serializes to. Rehydrated via
/// `RateLimiter::deserialize`, which looks `name` up in the process-local
/// `SerdeRegistry` to rebind the adapter/namespace/event bus/policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedRateLimiter {
    pub version: u8,
    pub name: String,
    pub key: EncodedKey,
}

/// Read-only view of a limiter's state, as reported by `RateLimiter::get_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RateLimiterState {
    Allowed { attempt: u64 },
    Blocked { attempt: u64, reset_ms: u64 },
}

/// The internal record persisted via the adapter: either still counting
/// attempts inside a policy window, or serving out a backoff penalty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase")]
enum PersistedState {
    Allowed { metrics: serde_json::Value },
    Blocked { started_at: DateTime<Utc>, attempt: u64 },
}

/// What `transact`'s transition closure reports back, encoded as JSON at
/// the adapter boundary (see [`ks_storage::RateLimiterTransition`]).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Outcome {
    Allowed { attempt: u64 },
    Blocked { attempt: u64, reset_ms: u64 },
}

struct RateLimiterCollaborators {
    adapter: Arc<dyn RateLimiterStorageAdapter>,
    namespace: Namespace,
    events: Arc<dyn EventBus>,
    clock: SharedClock,
    policy: Arc<dyn Policy>,
    backoff: BackoffFn,
    limit: u64,
}

/// Owns an adapter, namespace, event bus and policy; mints [`RateLimiter`] handles.
pub struct RateLimiterProvider {
    collaborators: Arc<RateLimiterCollaborators>,
    name: String,
}

impl RateLimiterProvider {
    pub fn new(
        adapter: Arc<dyn RateLimiterStorageAdapter>,
        namespace: Namespace,
        events: Arc<dyn EventBus>,
        clock: SharedClock,
        config: RateLimiterConfig,
        adapter_class: &str,
    ) -> Self {
        let policy: Arc<dyn Policy> = match config.policy {
            PolicyKind::FixedWindow => Arc::new(FixedWindow {
                window: std::time::Duration::from_millis(config.window_ms.max(0) as u64),
            }),
            PolicyKind::SlidingWindow => Arc::new(SlidingWindow {
                window_ms: config.window_ms.max(1),
            }),
        };
        let backoff = build_backoff(&config.backoff, config.jitter);
        let name = transformer_name("ratelimiter", adapter_class, &namespace.prefix());
        let collaborators = Arc::new(RateLimiterCollaborators {
            adapter,
            namespace,
            events,
            clock,
            policy,
            backoff,
            limit: config.limit,
        });
        SerdeRegistry::global().register_custom(name.clone(), collaborators.clone());
        Self { collaborators, name }
    }

    pub fn limiter(&self, key: impl Into<Key>) -> RateLimiter {
        RateLimiter {
            collaborators: self.collaborators.clone(),
            key: self.collaborators.namespace.create(key),
            name: self.name.clone(),
        }
    }
}

fn build_backoff(kind: &BackoffKind, jitter: f64) -> BackoffFn {
    let base = match *kind {
        BackoffKind::Constant { wait_ms } => constant_backoff(std::time::Duration::from_millis(wait_ms)),
        BackoffKind::Linear { base_ms } => linear_backoff(std::time::Duration::from_millis(base_ms)),
        BackoffKind::Exponential { base_ms, max_ms } => exponential_backoff(
            std::time::Duration::from_millis(base_ms),
            std::time::Duration::from_millis(max_ms),
        ),
        BackoffKind::Polynomial { base_ms, exponent, max_ms } => polynomial_backoff(
            std::time::Duration::from_millis(base_ms),
            exponent,
            std::time::Duration::from_millis(max_ms),
        ),
    };
    if jitter > 0.0 {
        with_jitter(base, jitter)
    } else {
        base
    }
}

/// A handle bound to one key. Cheap to clone; every method reads the
/// current persisted record through the provider's adapter.
#[derive(Clone)]
pub struct RateLimiter {
    collaborators: Arc<RateLimiterCollaborators>,
    key: EncodedKey,
    name: String,
}

impl RateLimiter {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn serialize(&self) -> SerializedRateLimiter {
        SerializedRateLimiter {
            version: HANDLE_FORMAT_VERSION,
            name: self.name.clone(),
            key: self.key.clone(),
        }
    }

    pub fn deserialize(record: &SerializedRateLimiter) -> Result<RateLimiter> {
        let collaborators = SerdeRegistry::global()
            .get::<RateLimiterCollaborators>(&record.name)
            .ok_or_else(|| Error::UnregisteredAdapter(record.name.clone()))?;
        Ok(RateLimiter {
            collaborators,
            key: record.key.clone(),
            name: record.name.clone(),
        })
    }

    /// Gate on the limiter, then run `f` if allowed.
    ///
    /// When `only_error` is `false` (the default mode), every call
    /// consumes one attempt regardless of outcome. When `only_error` is
    /// `true`, a successful `f` consumes nothing; a failing `f` consumes
    /// an attempt only if `error_policy` matches it (an unmatched
    /// failure is reported as [`RateLimiterEvent::UntrackedFailure`] and
    /// left uncounted).
    pub async fn run_or_fail<F, Fut, T>(
        &self,
        only_error: bool,
        error_policy: impl Fn(&anyhow::Error) -> bool,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, anyhow::Error>>,
    {
        if !only_error {
            self.gate().await?;
            return f().await.map_err(Error::Adapter);
        }

        match f().await {
            Ok(value) => Ok(value),
            Err(err) => {
                if error_policy(&err) {
                    self.emit(RateLimiterEvent::TrackedFailure { key: self.key.clone() }).await;
                    self.gate().await?;
                    Err(Error::Adapter(err))
                } else {
                    self.emit(RateLimiterEvent::UntrackedFailure { key: self.key.clone() }).await;
                    Err(Error::Adapter(err))
                }
            }
        }
    }

    /// Consume one attempt and fail with `BlockedRateLimiter` if that
    /// pushes the limiter into the `Blocked` state; otherwise return `Ok`.
    async fn gate(&self) -> Result<()> {
        match self.update_state().await? {
            Outcome::Allowed { attempt } => {
                self.emit(RateLimiterEvent::Allowed { key: self.key.clone(), attempt }).await;
                Ok(())
            }
            Outcome::Blocked { attempt, reset_ms } => {
                self.emit(RateLimiterEvent::Blocked { key: self.key.clone(), attempt, reset_ms }).await;
                Err(Error::BlockedRateLimiter { key: self.key.clone(), reset_ms })
            }
        }
    }

    /// Read the limiter's current state without consuming an attempt.
    pub async fn get_state(&self) -> Result<RateLimiterState> {
        let now = self.collaborators.clock.now();
        match self.collaborators.adapter.find(&self.key).await? {
            None => Ok(RateLimiterState::Allowed { attempt: 0 }),
            Some(record) if record.expires_at <= now => Ok(RateLimiterState::Allowed { attempt: 0 }),
            Some(record) => {
                let persisted: PersistedState = serde_json::from_value(record.state)?;
                Ok(match persisted {
                    PersistedState::Allowed { metrics } => RateLimiterState::Allowed {
                        attempt: self.collaborators.policy.get_attempts(&metrics, now),
                    },
                    PersistedState::Blocked { attempt, .. } => RateLimiterState::Blocked {
                        attempt,
                        reset_ms: (record.expires_at - now).num_milliseconds().max(0) as u64,
                    },
                })
            }
        }
    }

    /// Drop all tracked attempts for this key.
    pub async fn reset(&self) -> Result<()> {
        self.collaborators.adapter.remove(&self.key).await?;
        self.emit(RateLimiterEvent::Reseted { key: self.key.clone() }).await;
        Ok(())
    }

    async fn update_state(&self) -> Result<Outcome> {
        let policy = self.collaborators.policy.clone();
        let backoff = self.collaborators.backoff.clone();
        let limit = self.collaborators.limit;
        let now = self.collaborators.clock.now();
        let value = self
            .collaborators
            .adapter
            .transact(
                &self.key,
                Box::new(move |current| compute_transition(policy, backoff, limit, now, current)),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn emit(&self, event: RateLimiterEvent) {
        let payload = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
        let topic = format!("ratelimiter:{}", self.collaborators.namespace.prefix());
        self.collaborators.events.dispatch(&topic, payload).await;
    }
}

/// The pure state-machine step driving one `transact` call: decode the
/// persisted record (or start fresh if absent/expired), step it forward
/// one attempt, and compute what to persist plus what to report.
fn compute_transition(
    policy: Arc<dyn Policy>,
    backoff: BackoffFn,
    limit: u64,
    now: DateTime<Utc>,
    current: Option<RateLimiterRecord>,
) -> (RateLimiterRecord, serde_json::Value) {
    let persisted = match current {
        Some(record) if record.expires_at > now => {
            serde_json::from_value(record.state).unwrap_or(PersistedState::Allowed {
                metrics: policy.initial_metrics(now),
            })
        }
        _ => PersistedState::Allowed { metrics: policy.initial_metrics(now) },
    };

    let next = match persisted {
        PersistedState::Allowed { metrics } => {
            let updated = policy.update_metrics(&metrics, now);
            if policy.should_block(&updated, limit, now) {
                PersistedState::Blocked { started_at: now, attempt: 1 }
            } else {
                PersistedState::Allowed { metrics: updated }
            }
        }
        PersistedState::Blocked { started_at, attempt } => {
            let ends_at = started_at + chrono_duration(backoff(attempt as u32));
            if now >= ends_at {
                PersistedState::Allowed { metrics: policy.initial_metrics(now) }
            } else {
                PersistedState::Blocked { started_at, attempt: attempt + 1 }
            }
        }
    };

    let expires_at = match &next {
        PersistedState::Allowed { metrics } => policy.get_expiration(metrics, now),
        PersistedState::Blocked { started_at, attempt } => *started_at + chrono_duration(backoff(*attempt as u32)),
    };

    let outcome = match &next {
        PersistedState::Allowed { metrics } => Outcome::Allowed { attempt: policy.get_attempts(metrics, now) },
        PersistedState::Blocked { attempt, .. } => Outcome::Blocked {
            attempt: *attempt,
            reset_ms: (expires_at - now).num_milliseconds().max(0) as u64,
        },
    };

    let record = RateLimiterRecord {
        state: serde_json::to_value(&next).expect("PersistedState always serializes"),
        expires_at,
    };
    (record, serde_json::to_value(outcome).expect("Outcome always serializes"))
}

fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ks_domain::config::RateLimiterConfig;
    use ks_domain::ManualClock;
    use ks_events::InProcessEventBus;
    use ks_storage::InMemoryAdapter;

    fn provider(config: RateLimiterConfig) -> (RateLimiterProvider, ManualClock) {
        let clock = ManualClock::epoch();
        let adapter = InMemoryAdapter::new(Arc::new(clock.clone()));
        let events: Arc<dyn EventBus> = Arc::new(InProcessEventBus::new(Arc::new(clock.clone())));
        let provider = RateLimiterProvider::new(
            adapter,
            Namespace::new(vec!["ratelimiter".into()], "test"),
            events,
            Arc::new(clock.clone()),
            config,
            "in_memory",
        );
        (provider, clock)
    }

    fn default_config(limit: u64, window_ms: i64) -> RateLimiterConfig {
        RateLimiterConfig {
            limit,
            window_ms,
            policy: PolicyKind::FixedWindow,
            backoff: BackoffKind::Constant { wait_ms: 1000 },
            jitter: 0.0,
            namespace_root: Vec::new(),
        }
    }

    async fn ok(limiter: &RateLimiter) -> Result<u32> {
        limiter
            .run_or_fail(false, |_| true, || async { Ok(1u32) })
            .await
    }

    #[tokio::test]
    async fn allows_calls_under_the_limit() {
        let (provider, _clock) = provider(default_config(3, 1000));
        let limiter = provider.limiter("user1");
        for _ in 0..3 {
            assert!(ok(&limiter).await.is_ok());
        }
    }

    #[tokio::test]
    async fn blocks_once_limit_exceeded() {
        let (provider, _clock) = provider(default_config(2, 1000));
        let limiter = provider.limiter("user1");
        assert!(ok(&limiter).await.is_ok());
        assert!(ok(&limiter).await.is_ok());
        let err = ok(&limiter).await.unwrap_err();
        assert!(matches!(err, Error::BlockedRateLimiter { .. }));
    }

    #[tokio::test]
    async fn blocked_state_clears_after_backoff_elapses() {
        let (provider, clock) = provider(default_config(1, 1000));
        let limiter = provider.limiter("user1");
        assert!(ok(&limiter).await.is_ok());
        assert!(ok(&limiter).await.is_err());

        clock.advance(chrono::Duration::milliseconds(1500));
        assert!(ok(&limiter).await.is_ok());
    }

    #[tokio::test]
    async fn get_state_does_not_consume_an_attempt() {
        let (provider, _clock) = provider(default_config(1, 1000));
        let limiter = provider.limiter("user1");
        assert!(ok(&limiter).await.is_ok());
        assert_eq!(limiter.get_state().await.unwrap(), RateLimiterState::Allowed { attempt: 1 });
        assert_eq!(limiter.get_state().await.unwrap(), RateLimiterState::Allowed { attempt: 1 });
    }

    #[tokio::test]
    async fn reset_clears_tracked_attempts() {
        let (provider, _clock) = provider(default_config(1, 1000));
        let limiter = provider.limiter("user1");
        assert!(ok(&limiter).await.is_ok());
        assert!(ok(&limiter).await.is_err());
        limiter.reset().await.unwrap();
        assert!(ok(&limiter).await.is_ok());
    }

    #[tokio::test]
    async fn different_keys_are_independent() {
        let (provider, _clock) = provider(default_config(1, 1000));
        let a = provider.limiter("a");
        let b = provider.limiter("b");
        assert!(ok(&a).await.is_ok());
        assert!(ok(&a).await.is_err());
        assert!(ok(&b).await.is_ok());
    }

    #[tokio::test]
    async fn only_error_mode_does_not_consume_attempts_on_success() {
        let (provider, _clock) = provider(default_config(1, 1000));
        let limiter = provider.limiter("user1");
        for _ in 0..5 {
            let result = limiter
                .run_or_fail(true, |_| true, || async { Ok::<_, anyhow::Error>(1u32) })
                .await;
            assert!(result.is_ok());
        }
        assert_eq!(limiter.get_state().await.unwrap(), RateLimiterState::Allowed { attempt: 0 });
    }

    #[tokio::test]
    async fn only_error_mode_tracks_matched_failures() {
        let (provider, _clock) = provider(default_config(1, 1000));
        let limiter = provider.limiter("user1");
        let first = limiter
            .run_or_fail(true, |_| true, || async { Err::<u32, _>(anyhow::anyhow!("boom")) })
            .await;
        assert!(matches!(first, Err(Error::Adapter(_))));

        let second = limiter
            .run_or_fail(true, |_| true, || async { Err::<u32, _>(anyhow::anyhow!("boom again")) })
            .await;
        assert!(matches!(second, Err(Error::BlockedRateLimiter { .. })));
    }

    #[tokio::test]
    async fn only_error_mode_leaves_unmatched_failures_untracked() {
        let (provider, _clock) = provider(default_config(1, 1000));
        let limiter = provider.limiter("user1");
        for _ in 0..5 {
            let result = limiter
                .run_or_fail(true, |_| false, || async { Err::<u32, _>(anyhow::anyhow!("ignored")) })
                .await;
            assert!(matches!(result, Err(Error::Adapter(_))));
        }
        assert_eq!(limiter.get_state().await.unwrap(), RateLimiterState::Allowed { attempt: 0 });
    }

    #[tokio::test]
    async fn sliding_window_policy_blocks_then_recovers_after_backoff() {
        let (provider, clock) = provider(RateLimiterConfig {
            limit: 2,
            window_ms: 1000,
            policy: PolicyKind::SlidingWindow,
            backoff: BackoffKind::Constant { wait_ms: 100 },
            jitter: 0.0,
            namespace_root: Vec::new(),
        });
        let limiter = provider.limiter("user1");
        assert!(ok(&limiter).await.is_ok());
        assert!(ok(&limiter).await.is_ok());
        assert!(ok(&limiter).await.is_err());

        // The backoff window has elapsed: entering Blocked starts a fresh
        // window, so the next call is allowed again.
        clock.advance(chrono::Duration::milliseconds(150));
        assert!(ok(&limiter).await.is_ok());
    }

    #[tokio::test]
    async fn serialize_deserialize_round_trips() {
        let (provider, _clock) = provider(default_config(5, 1000));
        let limiter = provider.limiter("user1");
        assert!(ok(&limiter).await.is_ok());

        let record = limiter.serialize();
        let rehydrated = RateLimiter::deserialize(&record).unwrap();
        assert_eq!(rehydrated.key(), limiter.key());
        assert_eq!(
            rehydrated.get_state().await.unwrap(),
            RateLimiterState::Allowed { attempt: 1 }
        );
    }
}
