use serde::{Deserialize, Serialize};

/// Configuration for a `LockProvider`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Default TTL used when `acquire` callers omit one. `None` = non-expiring.
    #[serde(default)]
    pub default_ttl_ms: Option<i64>,
    #[serde(default)]
    pub namespace_root: Vec<String>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: Some(30_000),
            namespace_root: Vec::new(),
        }
    }
}

/// Parameters for `acquireBlocking` / `acquire_blocking`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlockingConfig {
    pub time_ms: u64,
    pub interval_ms: u64,
}

impl Default for BlockingConfig {
    fn default() -> Self {
        Self {
            time_ms: 10_000,
            interval_ms: 200,
        }
    }
}
