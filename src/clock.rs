// =============================================================================
// Clock — injectable wall + monotonic time source
// =============================================================================
//
// Every component that needs the current time receives a `Clock` handle
// instead of calling `Utc::now()` directly. Tests drive a `SimClock` to make
// cadence, circuit-breaker cooldowns, and SAFE_MODE expiry deterministic.
// =============================================================================

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Wall-clock plus monotonic time, injectable for tests.
pub trait Clock: Send + Sync {
    /// Current wall-clock time (UTC).
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic time elapsed since the clock was created. Never goes
    /// backwards, unaffected by wall-clock adjustments.
    fn monotonic(&self) -> Duration;
}

/// Production clock backed by the OS.
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Manually advanced clock for tests. Wall and monotonic time move together.
pub struct SimClock {
    inner: RwLock<SimInner>,
}

struct SimInner {
    now: DateTime<Utc>,
    elapsed: Duration,
}

impl SimClock {
    /// Create a sim clock pinned at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: RwLock::new(SimInner {
                now: start,
                elapsed: Duration::ZERO,
            }),
        }
    }

    /// Advance both wall and monotonic time by `d`.
    pub fn advance(&self, d: Duration) {
        let mut inner = self.inner.write();
        inner.now += chrono::Duration::from_std(d).expect("duration in range");
        inner.elapsed += d;
    }
}

impl Clock for SimClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.read().now
    }

    fn monotonic(&self) -> Duration {
        self.inner.read().elapsed
    }
}
