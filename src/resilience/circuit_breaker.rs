//! Circuit breaker FSM for the Broker Stream Client.
//!
//! Grounded on `binance_session::EndpointRotator`'s consecutive-failure
//! counter and cool-down, generalized from per-endpoint to a single
//! CLOSED/OPEN/HALF_OPEN state machine as spec §4.3/§3 describe.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    fn maybe_half_open(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    info!("circuit_breaker_half_open");
                }
            }
        }
    }

    /// Returns true if the caller may proceed with the guarded operation.
    /// A HALF_OPEN circuit allows exactly one probe through; subsequent
    /// calls fail fast until that probe resolves via `record_success` or
    /// `record_failure`.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                // Admit the probe, then immediately fence further callers
                // by re-opening until the probe settles.
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now() - self.cooldown + Duration::from_millis(1));
                true
            }
            CircuitState::Open => false,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!("circuit_breaker_closed_after_probe");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Instant::now());

        if inner.consecutive_failures >= self.threshold || inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                failures = inner.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit_breaker_opened"
            );
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let cb = CircuitBreaker::new(5, Duration::from_millis(50));
        for _ in 0..4 {
            assert!(cb.allow());
            cb.record_failure();
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert!(cb.allow());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn fails_fast_while_open_then_half_opens_after_cooldown() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(20));
        cb.allow();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());

        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn successful_probe_closes_circuit() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(10));
        cb.allow();
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow()); // admits the single probe
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }
}
