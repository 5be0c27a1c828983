//! Degraded-mode controller.
//!
//! When the stream is unavailable the system tightens REST polling and
//! keeps attempting reconnection on the circuit breaker's cool-down, per
//! spec §4.3. Grounded on `binance_session::SessionManager`'s role as the
//! single coordinator of reconnect/resync state, narrowed here to just the
//! polling-cadence decision the Resilience Layer exposes to callers.

use std::time::Duration;

use super::circuit_breaker::{CircuitBreaker, CircuitState};

pub struct DegradedModeController {
    normal_interval: Duration,
    degraded_interval: Duration,
}

impl DegradedModeController {
    pub fn new(normal_interval: Duration, degraded_interval: Duration) -> Self {
        Self {
            normal_interval,
            degraded_interval,
        }
    }

    /// REST poll interval to use, given the stream circuit's current state.
    pub fn poll_interval(&self, circuit: &CircuitBreaker) -> Duration {
        match circuit.state() {
            CircuitState::Closed => self.normal_interval,
            CircuitState::Open | CircuitState::HalfOpen => self.degraded_interval,
        }
    }

    pub fn is_degraded(&self, circuit: &CircuitBreaker) -> bool {
        circuit.state() != CircuitState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tightens_interval_when_circuit_open() {
        let controller = DegradedModeController::new(
            Duration::from_secs(5),
            Duration::from_secs(1),
        );
        let cb = CircuitBreaker::new(1, Duration::from_secs(30));
        assert_eq!(controller.poll_interval(&cb), Duration::from_secs(5));
        assert!(!controller.is_degraded(&cb));

        cb.allow();
        cb.record_failure();
        assert_eq!(controller.poll_interval(&cb), Duration::from_secs(1));
        assert!(controller.is_degraded(&cb));
    }
}
