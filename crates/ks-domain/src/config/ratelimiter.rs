use serde::{Deserialize, Serialize};

/// Which policy a `RateLimiterProvider` drives its state machine with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    FixedWindow,
    SlidingWindow,
}

/// Which backoff shape governs time spent in the `Blocked` state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BackoffKind {
    Constant { wait_ms: u64 },
    Linear { base_ms: u64 },
    Exponential { base_ms: u64, max_ms: u64 },
    Polynomial { base_ms: u64, exponent: f64, max_ms: u64 },
}

impl Default for BackoffKind {
    fn default() -> Self {
        BackoffKind::Constant { wait_ms: 0 }
    }
}

/// Configuration for a `RateLimiterProvider`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub limit: u64,
    pub window_ms: i64,
    #[serde(default)]
    pub policy: PolicyKind,
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Add jitter (0.0-1.0 fraction of the computed wait) to the backoff.
    #[serde(default)]
    pub jitter: f64,
    #[serde(default)]
    pub namespace_root: Vec<String>,
}
