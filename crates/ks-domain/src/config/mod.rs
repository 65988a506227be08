mod cache;
mod lock;
mod ratelimiter;

pub use cache::CacheConfig;
pub use lock::{BlockingConfig, LockConfig};
pub use ratelimiter::{BackoffKind, PolicyKind, RateLimiterConfig};
