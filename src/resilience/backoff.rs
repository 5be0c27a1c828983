//! Exponential backoff with jitter.
//!
//! Carried over near-verbatim from `binance_session::BackoffCalculator`:
//! same xorshift64 PRNG for jitter (no extra `rand` dependency on the
//! reconnect hot path), same attempt-indexed exponential growth capped at
//! a configurable ceiling.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.3,
        }
    }
}

#[derive(Debug)]
pub struct BackoffCalculator {
    config: BackoffConfig,
    attempt: u32,
    rng_state: u64,
}

impl BackoffCalculator {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x9E3779B97F4A7C15),
        }
    }

    #[inline]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    pub fn next_backoff(&mut self) -> Duration {
        let base_ms = self.config.base.as_millis() as f64;
        let cap_ms = self.config.cap.as_millis() as f64;
        let raw = base_ms * self.config.multiplier.powi(self.attempt as i32);
        let capped = raw.min(cap_ms);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = (self.next_random() * 2.0 - 1.0) * jitter_range;
        let final_ms = (capped + jitter).max(base_ms);

        self.attempt += 1;
        Duration::from_millis(final_ms as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_within_jitter_band() {
        let config = BackoffConfig::default();
        let mut backoff = BackoffCalculator::new(config);

        let d1 = backoff.next_backoff();
        assert!(d1.as_millis() >= 700 && d1.as_millis() <= 1300);

        let d2 = backoff.next_backoff();
        assert!(d2.as_millis() >= 1400 && d2.as_millis() <= 2600);
    }

    #[test]
    fn never_exceeds_cap_plus_jitter() {
        let config = BackoffConfig::default();
        let mut backoff = BackoffCalculator::new(config);
        for _ in 0..30 {
            let d = backoff.next_backoff();
            assert!(d.as_millis() <= 78_000); // 60_000 * 1.3
        }
    }

    #[test]
    fn reset_returns_to_first_attempt() {
        let config = BackoffConfig::default();
        let mut backoff = BackoffCalculator::new(config);
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        let d = backoff.next_backoff();
        assert!(d.as_millis() >= 700 && d.as_millis() <= 1300);
    }
}
