//! Window policies: each owns the shape of its persisted `metrics` value
//! and the pure functions the engine drives it through. Metrics are
//! opaque `serde_json::Value` at the [`Policy`] boundary so the engine
//! never needs to know which policy produced a given record.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Pure window-accounting rules driving the rate-limiter state machine.
/// All methods take `metrics` by reference and return a fresh value
/// rather than mutating in place, matching how the engine threads state
/// through an adapter's `transact`.
pub trait Policy: Send + Sync {
    fn initial_metrics(&self, now: DateTime<Utc>) -> serde_json::Value;
    fn should_block(&self, metrics: &serde_json::Value, limit: u64, now: DateTime<Utc>) -> bool;
    fn get_attempts(&self, metrics: &serde_json::Value, now: DateTime<Utc>) -> u64;
    fn get_expiration(&self, metrics: &serde_json::Value, now: DateTime<Utc>) -> DateTime<Utc>;
    fn update_metrics(&self, metrics: &serde_json::Value, now: DateTime<Utc>) -> serde_json::Value;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fixed window
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Serialize, Deserialize)]
struct FixedWindowMetrics {
    attempt: u64,
    last_attempt_at: DateTime<Utc>,
}

fn parse_fixed(metrics: &serde_json::Value, now: DateTime<Utc>) -> FixedWindowMetrics {
    serde_json::from_value(metrics.clone()).unwrap_or(FixedWindowMetrics {
        attempt: 0,
        last_attempt_at: now,
    })
}

/// Counts attempts since the most recent one; a record older than
/// `window` is evicted entirely by the adapter's TTL (the engine treats
/// an expired/absent record as a fresh start), so this policy itself
/// never resets `attempt` back to zero.
pub struct FixedWindow {
    pub window: Duration,
}

impl Policy for FixedWindow {
    /// The neutral zero-attempts state. The engine always routes a fresh
    /// key through one `update_metrics` call before this value is ever
    /// persisted, so `attempt` here is 0, not 1.
    fn initial_metrics(&self, now: DateTime<Utc>) -> serde_json::Value {
        serde_json::to_value(FixedWindowMetrics {
            attempt: 0,
            last_attempt_at: now,
        })
        .expect("FixedWindowMetrics always serializes")
    }

    fn should_block(&self, metrics: &serde_json::Value, limit: u64, now: DateTime<Utc>) -> bool {
        let m = parse_fixed(metrics, now);
        (now - m.last_attempt_at) < to_chrono(self.window) && m.attempt > limit
    }

    fn get_attempts(&self, metrics: &serde_json::Value, now: DateTime<Utc>) -> u64 {
        parse_fixed(metrics, now).attempt
    }

    fn get_expiration(&self, metrics: &serde_json::Value, now: DateTime<Utc>) -> DateTime<Utc> {
        parse_fixed(metrics, now).last_attempt_at + to_chrono(self.window)
    }

    fn update_metrics(&self, metrics: &serde_json::Value, now: DateTime<Utc>) -> serde_json::Value {
        let m = parse_fixed(metrics, now);
        serde_json::to_value(FixedWindowMetrics {
            attempt: m.attempt + 1,
            last_attempt_at: now,
        })
        .expect("FixedWindowMetrics always serializes")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sliding window
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `windows[windowStart] = attempts`, keyed by the window's start instant
/// in epoch milliseconds. Only the current and immediately preceding
/// window ever matter for weighting, so older entries are pruned on
/// every update.
#[derive(Serialize, Deserialize)]
struct SlidingWindowMetrics {
    windows: BTreeMap<i64, u64>,
}

fn parse_sliding(metrics: &serde_json::Value) -> SlidingWindowMetrics {
    serde_json::from_value(metrics.clone()).unwrap_or(SlidingWindowMetrics {
        windows: BTreeMap::new(),
    })
}

/// Weights the previous window's attempts by how much of it still
/// overlaps the current instant, so a burst right at a window boundary
/// can't double the effective limit. Weighted attempt counts are always
/// floored, never rounded up, so the limiter can never admit more than
/// `limit` requests inside any rolling window.
pub struct SlidingWindow {
    pub window_ms: i64,
}

impl SlidingWindow {
    fn window_start(&self, now: DateTime<Utc>) -> i64 {
        let millis = now.timestamp_millis();
        millis.div_euclid(self.window_ms) * self.window_ms
    }

    fn weighted_attempts(&self, metrics: &SlidingWindowMetrics, now: DateTime<Utc>) -> f64 {
        let start = self.window_start(now);
        let prev_start = start - self.window_ms;
        let current = *metrics.windows.get(&start).unwrap_or(&0) as f64;
        let previous = *metrics.windows.get(&prev_start).unwrap_or(&0) as f64;
        let elapsed = (now.timestamp_millis() - start) as f64;
        let weight = (1.0 - elapsed / self.window_ms as f64).clamp(0.0, 1.0);
        current + previous * weight
    }
}

impl Policy for SlidingWindow {
    /// The neutral zero-attempts state (see [`FixedWindow::initial_metrics`]).
    fn initial_metrics(&self, _now: DateTime<Utc>) -> serde_json::Value {
        serde_json::to_value(SlidingWindowMetrics { windows: BTreeMap::new() })
            .expect("SlidingWindowMetrics always serializes")
    }

    fn should_block(&self, metrics: &serde_json::Value, limit: u64, now: DateTime<Utc>) -> bool {
        self.get_attempts(metrics, now) > limit
    }

    fn get_attempts(&self, metrics: &serde_json::Value, now: DateTime<Utc>) -> u64 {
        let m = parse_sliding(metrics);
        self.weighted_attempts(&m, now).floor() as u64
    }

    fn get_expiration(&self, metrics: &serde_json::Value, now: DateTime<Utc>) -> DateTime<Utc> {
        let _ = metrics;
        let start = self.window_start(now);
        DateTime::<Utc>::from_timestamp_millis(start + 2 * self.window_ms)
            .unwrap_or(now + to_chrono(Duration::from_millis(2 * self.window_ms.max(0) as u64)))
    }

    fn update_metrics(&self, metrics: &serde_json::Value, now: DateTime<Utc>) -> serde_json::Value {
        let mut m = parse_sliding(metrics);
        let start = self.window_start(now);
        *m.windows.entry(start).or_insert(0) += 1;
        let prev_start = start - self.window_ms;
        m.windows.retain(|&k, _| k >= prev_start);
        serde_json::to_value(m).expect("SlidingWindowMetrics always serializes")
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_ms(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn fixed_window_blocks_after_limit_within_window() {
        let policy = FixedWindow { window: Duration::from_millis(1000) };
        let mut metrics = policy.initial_metrics(at_ms(0));
        for t in [0, 100, 200, 300] {
            metrics = policy.update_metrics(&metrics, at_ms(t));
        }
        assert_eq!(policy.get_attempts(&metrics, at_ms(300)), 4);
        assert!(policy.should_block(&metrics, 3, at_ms(300)));
        assert!(!policy.should_block(&metrics, 10, at_ms(300)));
    }

    #[test]
    fn fixed_window_does_not_block_once_window_elapses() {
        let policy = FixedWindow { window: Duration::from_millis(100) };
        let metrics = policy.update_metrics(&policy.initial_metrics(at_ms(0)), at_ms(50));
        assert!(!policy.should_block(&metrics, 1, at_ms(500)));
    }

    #[test]
    fn sliding_window_weights_previous_window_down_over_time() {
        let policy = SlidingWindow { window_ms: 1000 };
        let mut metrics = policy.initial_metrics(at_ms(0));
        for _ in 0..4 {
            metrics = policy.update_metrics(&metrics, at_ms(500));
        }
        // 4 attempts in window [0, 1000): right at the boundary the next
        // window sees the full weight of those attempts.
        assert_eq!(policy.get_attempts(&metrics, at_ms(1000)), 4);
        // Halfway through the following window only half of them still count.
        assert_eq!(policy.get_attempts(&metrics, at_ms(1500)), 2);
        // Two windows later they have aged out entirely.
        assert_eq!(policy.get_attempts(&metrics, at_ms(2100)), 0);
    }

    #[test]
    fn sliding_window_floors_rather_than_rounds() {
        let policy = SlidingWindow { window_ms: 1000 };
        let mut metrics = policy.initial_metrics(at_ms(0));
        metrics = policy.update_metrics(&metrics, at_ms(0));
        // 1 attempt in the first window, 60% of the way into the next:
        // weighted = 1 * 0.4 = 0.4, which floors to 0.
        assert_eq!(policy.get_attempts(&metrics, at_ms(1600)), 0);
    }
}
