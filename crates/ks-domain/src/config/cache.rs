use serde::{Deserialize, Serialize};

/// Configuration for a `CacheProvider`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Default TTL applied when a caller omits one. `None` = never expires.
    #[serde(default)]
    pub default_ttl_ms: Option<i64>,
    /// Namespace root segments, e.g. `["cache", "user"]`.
    #[serde(default)]
    pub namespace_root: Vec<String>,
    /// Interval at which adapters without native TTL sweep expired rows.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: None,
            namespace_root: Vec::new(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}
