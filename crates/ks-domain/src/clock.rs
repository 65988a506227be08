//! Injectable source of current wall time.
//!
//! Every engine reads "now" through a `Clock` rather than calling
//! `Utc::now()` directly, so the timing scenarios in the acceptance
//! tests (lock expiry, rate-limiter windows) can run without sleeping
//! on wall-clock time.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

/// Injectable source of current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock a test can advance deterministically.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn epoch() -> Self {
        Self::new(DateTime::UNIX_EPOCH)
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// A shared, type-erased clock handle, the form engines actually store.
pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::epoch();
        let t0 = clock.now();
        clock.advance(Duration::milliseconds(200));
        assert_eq!(clock.now(), t0 + Duration::milliseconds(200));
    }

    #[test]
    fn manual_clock_set() {
        let clock = ManualClock::epoch();
        let target = Utc::now();
        clock.set(target);
        assert_eq!(clock.now(), target);
    }
}
