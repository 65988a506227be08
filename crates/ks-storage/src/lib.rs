//! Storage adapter contracts and the default in-memory backend.
//!
//! Every engine (`ks-lock`, `ks-ratelimiter`, `ks-cache`) is generic over
//! an adapter implementing the relevant trait in [`contracts`]; this
//! crate supplies the contracts themselves plus [`in_memory`], the
//! backend used when no external store is configured.

pub mod contracts;
pub mod in_memory;

pub use contracts::{
    CacheAdapter, CacheRecord, LockAdapter, LockRecord, RateLimiterRecord,
    RateLimiterStorageAdapter, RateLimiterTransition,
};
pub use in_memory::InMemoryAdapter;
