/// Shared error type used across all keystone crates.
///
/// Engines never wrap adapter errors in a generic variant — an adapter's
/// own failure propagates through `Adapter` so middleware can match on
/// it. Business-logic failures (`FailedAcquireLock`, `KeyExists`, ...)
/// are their own variants so callers can match them in an `ErrorPolicy`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("adapter error: {0}")]
    Adapter(#[from] anyhow::Error),

    #[error("unregistered adapter: {0}")]
    UnregisteredAdapter(String),

    #[error("no default adapter defined for {0}")]
    DefaultAdapterNotDefined(String),

    #[error("failed to acquire lock for key {key}")]
    FailedAcquireLock { key: String },

    #[error("failed to release lock for key {key}")]
    FailedReleaseLock { key: String },

    #[error("failed to refresh lock for key {key}")]
    FailedRefreshLock { key: String },

    #[error("key not found: {0}")]
    KeyNotFoundCache(String),

    #[error("key already exists: {0}")]
    KeyExistsCache(String),

    #[error("value at key {key} is not of the expected type")]
    TypeCache { key: String },

    #[error("rate limiter blocked key {key}, resets in {reset_ms}ms")]
    BlockedRateLimiter { key: String, reset_ms: u64 },

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("task timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
