//! Domain event envelope shared by every engine's event bus topics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event dispatched by a provider, namespaced under its component.
///
/// `topic` is the fully-qualified topic string (component + namespace
/// prefix + event name); `payload` is the JSON-encoded event body so the
/// in-process bus and the cross-process (pub/sub) bus share one wire
/// shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub topic: String,
    pub payload: serde_json::Value,
    pub dispatched_at: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            dispatched_at: now,
        }
    }
}

/// Lock lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum LockEvent {
    Acquired { key: String, lock_id: String },
    Released { key: String, lock_id: String },
    Refreshed { key: String, lock_id: String, ttl_ms: Option<i64> },
    ForceReleased { key: String },
    FailedRelease { key: String, lock_id: String },
    FailedRefresh { key: String, lock_id: String },
    UnownedRelease { key: String, lock_id: String },
    UnownedRefresh { key: String, lock_id: String },
}

/// Rate-limiter lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum RateLimiterEvent {
    Allowed { key: String, attempt: u64 },
    Blocked { key: String, attempt: u64, reset_ms: u64 },
    Reseted { key: String },
    TrackedFailure { key: String },
    UntrackedFailure { key: String },
}

/// Cache lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum CacheEvent {
    Added { key: String },
    Updated { key: String },
    Removed { key: String },
    Incremented { key: String, delta: f64 },
    Decremented { key: String, delta: f64 },
    Found { key: String },
    NotFound { key: String },
    Cleared { prefix: String },
}
