// =============================================================================
// Circuit breaker — guards one failing dependency
// =============================================================================
//
// State machine:
//   CLOSED    --F failures within W-->  OPEN
//   OPEN      --cooldown elapsed----->  HALF_OPEN (one probe allowed)
//   HALF_OPEN --probe succeeds------->  CLOSED
//   HALF_OPEN --probe fails---------->  OPEN with cooldown doubled (capped)
//
// Timing uses the injected monotonic clock so tests can step time.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::Clock;

/// Breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures within `window` that trip the breaker.
    pub failure_threshold: u32,
    /// Failure-counting window.
    pub window: Duration,
    /// Initial OPEN cooldown before a probe is allowed.
    pub cooldown: Duration,
    /// Ceiling for the doubled cooldown.
    pub cooldown_cap: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            cooldown_cap: Duration::from_secs(300),
        }
    }
}

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

enum Inner {
    Closed {
        failures: u32,
        window_start: Duration,
    },
    Open {
        until: Duration,
        cooldown: Duration,
    },
    HalfOpen {
        probe_in_flight: bool,
        cooldown: Duration,
    },
}

/// One breaker per guarded dependency (analyst or venue).
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.monotonic();
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(Inner::Closed {
                failures: 0,
                window_start: now,
            }),
        }
    }

    /// Whether a call may proceed right now. An OPEN breaker whose cooldown
    /// has elapsed transitions to HALF_OPEN and admits exactly one probe.
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.monotonic();
        let mut inner = self.inner.lock();
        match &mut *inner {
            Inner::Closed { .. } => true,
            Inner::Open { until, cooldown } => {
                if now >= *until {
                    let cooldown = *cooldown;
                    debug!(breaker = %self.name, "cooldown elapsed — HALF_OPEN probe");
                    *inner = Inner::HalfOpen {
                        probe_in_flight: true,
                        cooldown,
                    };
                    true
                } else {
                    false
                }
            }
            Inner::HalfOpen { probe_in_flight, .. } => {
                if *probe_in_flight {
                    false
                } else {
                    *probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful call.
    pub fn on_success(&self) {
        let now = self.clock.monotonic();
        let mut inner = self.inner.lock();
        match &*inner {
            Inner::HalfOpen { .. } => {
                debug!(breaker = %self.name, "probe succeeded — CLOSED");
            }
            Inner::Open { .. } => {} // late success from a stale call; ignore
            Inner::Closed { .. } => {}
        }
        *inner = Inner::Closed {
            failures: 0,
            window_start: now,
        };
    }

    /// Record a failed call (timeouts included).
    pub fn on_failure(&self) {
        let now = self.clock.monotonic();
        let mut inner = self.inner.lock();
        match &mut *inner {
            Inner::Closed {
                failures,
                window_start,
            } => {
                if now.saturating_sub(*window_start) > self.config.window {
                    *failures = 0;
                    *window_start = now;
                }
                *failures += 1;
                if *failures >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = *failures,
                        cooldown_s = self.config.cooldown.as_secs(),
                        "breaker tripped — OPEN"
                    );
                    *inner = Inner::Open {
                        until: now + self.config.cooldown,
                        cooldown: self.config.cooldown,
                    };
                }
            }
            Inner::HalfOpen { cooldown, .. } => {
                let doubled = (*cooldown * 2).min(self.config.cooldown_cap);
                warn!(
                    breaker = %self.name,
                    cooldown_s = doubled.as_secs(),
                    "probe failed — OPEN with doubled cooldown"
                );
                *inner = Inner::Open {
                    until: now + doubled,
                    cooldown: doubled,
                };
            }
            Inner::Open { .. } => {}
        }
    }

    /// Non-mutating admission check: would a call be allowed right now?
    /// An OPEN breaker past its cooldown reports callable so the caller can
    /// reach `try_acquire` and start the probe.
    pub fn is_callable(&self) -> bool {
        let now = self.clock.monotonic();
        match &*self.inner.lock() {
            Inner::Closed { .. } => true,
            Inner::Open { until, .. } => now >= *until,
            Inner::HalfOpen { probe_in_flight, .. } => !probe_in_flight,
        }
    }

    pub fn state(&self) -> CircuitState {
        match &*self.inner.lock() {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;
    use chrono::TimeZone;

    fn setup(config: CircuitConfig) -> (Arc<SimClock>, CircuitBreaker) {
        let clock = Arc::new(SimClock::new(
            chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let breaker = CircuitBreaker::new("test", config, clock.clone());
        (clock, breaker)
    }

    #[test]
    fn opens_after_threshold_failures() {
        let (_clock, b) = setup(CircuitConfig::default());
        assert_eq!(b.state(), CircuitState::Closed);
        b.on_failure();
        b.on_failure();
        assert_eq!(b.state(), CircuitState::Closed);
        b.on_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.try_acquire());
    }

    #[test]
    fn failures_outside_window_reset() {
        let (clock, b) = setup(CircuitConfig {
            failure_threshold: 3,
            window: Duration::from_secs(10),
            ..CircuitConfig::default()
        });
        b.on_failure();
        b.on_failure();
        clock.advance(Duration::from_secs(11));
        b.on_failure(); // window rolled — count restarts at 1
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn probe_after_cooldown_then_close() {
        let (clock, b) = setup(CircuitConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(30),
            ..CircuitConfig::default()
        });
        b.on_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.try_acquire());

        clock.advance(Duration::from_secs(31));
        assert!(b.try_acquire()); // the single probe
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(!b.try_acquire()); // second caller refused while probing

        b.on_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.try_acquire());
    }

    #[test]
    fn failed_probe_doubles_cooldown_with_cap() {
        let (clock, b) = setup(CircuitConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(30),
            cooldown_cap: Duration::from_secs(100),
            ..CircuitConfig::default()
        });
        b.on_failure();

        // First probe fails -> cooldown 60s.
        clock.advance(Duration::from_secs(31));
        assert!(b.try_acquire());
        b.on_failure();
        assert_eq!(b.state(), CircuitState::Open);
        clock.advance(Duration::from_secs(59));
        assert!(!b.try_acquire());
        clock.advance(Duration::from_secs(2));
        assert!(b.try_acquire());

        // Second probe fails -> cooldown would be 120s, capped at 100s.
        b.on_failure();
        clock.advance(Duration::from_secs(99));
        assert!(!b.try_acquire());
        clock.advance(Duration::from_secs(2));
        assert!(b.try_acquire());
    }
}
