//! Process-wide circuit breaker for the broker connection pool.
//!
//! Two states only: enabled and disabled, with no half-open state. The
//! broker's next ready event closes the circuit again. Every transition
//! bumps a generation counter, and readiness results obtained for an older
//! generation are ignored in both directions.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Snapshot of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitState {
    pub enabled: bool,
    pub generation: u64,
}

/// Explicit enabled/disabled state machine shared by `Arc` between the
/// registry, dispatcher, waiter and recovery service.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// `false` when no broker is configured: the circuit can never enable.
    configured: bool,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    /// Creates a breaker that starts enabled when a broker is configured.
    #[must_use]
    pub fn new(configured: bool) -> Self {
        Self {
            configured,
            state: Mutex::new(CircuitState {
                enabled: configured,
                generation: 0,
            }),
        }
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        *self.state.lock()
    }

    /// Disables the circuit after a connection or readiness error.
    ///
    /// Always starts a new generation, so readiness checks still in flight are
    /// invalidated. Returns `true` if this call turned the circuit off.
    pub fn trip(&self, reason: &str) -> bool {
        Self::trip_locked(&mut self.state.lock(), reason)
    }

    fn trip_locked(state: &mut CircuitState, reason: &str) -> bool {
        state.generation += 1;
        if state.enabled {
            state.enabled = false;
            warn!(
                reason = reason,
                generation = state.generation,
                "queue circuit disabled, falling back to synchronous computation"
            );
            true
        } else {
            debug!(reason = reason, "queue circuit already disabled");
            false
        }
    }

    /// Re-enables the circuit on a pool-level ready signal.
    ///
    /// Returns `true` if this call turned the circuit on.
    pub fn reset(&self) -> bool {
        if !self.configured {
            return false;
        }
        let mut state = self.state.lock();
        if state.enabled {
            return false;
        }
        state.enabled = true;
        state.generation += 1;
        info!(generation = state.generation, "queue circuit re-enabled");
        true
    }

    /// Trips the circuit for a readiness failure of handles opened at
    /// `generation`.
    ///
    /// Failures of handles from an older generation were already accounted
    /// for by the transition that retired them, so they are ignored and
    /// `false` is returned.
    pub fn trip_if_current(&self, generation: u64, reason: &str) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            debug!(
                stale = generation,
                current = state.generation,
                reason = reason,
                "ignoring stale readiness failure"
            );
            return false;
        }
        Self::trip_locked(&mut state, reason);
        true
    }

    /// Checks a successful readiness result for handles opened at
    /// `generation`.
    ///
    /// Handles are only opened while the circuit is enabled and every
    /// transition moves the generation on, so a current result always finds
    /// the circuit enabled. Returns `false` for stale results.
    pub fn confirm_ready(&self, generation: u64) -> bool {
        let state = self.state.lock();
        if state.generation != generation {
            debug!(
                stale = generation,
                current = state.generation,
                "ignoring stale readiness signal"
            );
            return false;
        }
        state.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_breaker_never_enables() {
        let breaker = CircuitBreaker::new(false);
        assert!(!breaker.is_enabled());
        assert!(!breaker.reset());
        assert!(!breaker.confirm_ready(0));
        assert!(!breaker.is_enabled());
    }

    #[test]
    fn configured_breaker_starts_enabled() {
        let breaker = CircuitBreaker::new(true);
        assert_eq!(
            breaker.state(),
            CircuitState {
                enabled: true,
                generation: 0
            }
        );
    }

    #[test]
    fn trip_disables_and_bumps_generation() {
        let breaker = CircuitBreaker::new(true);
        assert!(breaker.trip("ECONNREFUSED"));
        assert!(!breaker.is_enabled());
        assert_eq!(breaker.state().generation, 1);

        // A second error is not a transition but still invalidates readiness.
        assert!(!breaker.trip("Connection is closed"));
        assert_eq!(breaker.state().generation, 2);
    }

    #[test]
    fn reset_re_enables_after_trip() {
        let breaker = CircuitBreaker::new(true);
        breaker.trip("boom");
        assert!(breaker.reset());
        assert!(breaker.is_enabled());
        assert!(!breaker.reset());
    }

    #[test]
    fn stale_readiness_is_ignored_after_newer_trip() {
        let breaker = CircuitBreaker::new(true);
        let opened_at = breaker.state().generation;

        breaker.trip("connection lost");
        assert!(!breaker.confirm_ready(opened_at));
        assert!(!breaker.is_enabled());
    }

    #[test]
    fn stale_readiness_failure_is_ignored() {
        let breaker = CircuitBreaker::new(true);
        let opened_at = breaker.state().generation;
        breaker.trip("Connection is closed");
        breaker.reset();

        assert!(!breaker.trip_if_current(opened_at, "Connection is closed"));
        assert!(breaker.is_enabled());
    }

    #[test]
    fn current_readiness_failure_trips() {
        let breaker = CircuitBreaker::new(true);
        let generation = breaker.state().generation;
        assert!(breaker.trip_if_current(generation, "ECONNREFUSED"));
        assert!(!breaker.is_enabled());
        assert_eq!(breaker.state().generation, generation + 1);
    }

    #[test]
    fn readiness_never_enables_a_tripped_circuit() {
        let breaker = CircuitBreaker::new(true);
        breaker.trip("ECONNREFUSED");
        let tripped = breaker.state();

        assert!(!breaker.confirm_ready(tripped.generation));
        assert_eq!(breaker.state(), tripped);
    }

    #[test]
    fn current_readiness_is_accepted() {
        let breaker = CircuitBreaker::new(true);
        breaker.trip("connection lost");
        breaker.reset();
        let generation = breaker.state().generation;
        assert!(breaker.confirm_ready(generation));
        assert!(breaker.is_enabled());
    }
}
