//! Process-wide token bucket.
//!
//! Adapted from `middleware::rate_limit`'s per-IP sliding-window limiter:
//! same `parking_lot::Mutex`-guarded check-and-update shape, but a single
//! shared bucket with continuous refill rather than a fixed window per key.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::time::sleep;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket sized to a requests-per-second quota. `acquire` blocks
/// (async) until a token is available rather than rejecting outright,
/// matching spec §4.1: "requests beyond budget block until tokens accrue."
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    /// Time until at least one token is available, without mutating state.
    fn wait_hint(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            None
        } else {
            let deficit = 1.0 - state.tokens;
            Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }

    /// Acquire a single token, sleeping in small steps until one is free.
    pub async fn acquire(&self) {
        loop {
            {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
            }
            let wait = self.wait_hint().unwrap_or(Duration::from_millis(10));
            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Non-blocking attempt; returns false if no token is currently free.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_drains_then_refuses() {
        let bucket = TokenBucket::new(2, 1.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test]
    async fn acquire_blocks_until_refill() {
        let bucket = TokenBucket::new(1, 50.0); // refills ~20ms/token
        bucket.acquire().await;
        assert!(!bucket.try_acquire());
        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
