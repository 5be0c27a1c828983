//! Supervisor: restarts a background loop with exponential backoff when
//! it returns an error or panics, per spec §7's "Unhandled exception in a
//! background loop" error-taxonomy entry. Repeated rapid restarts
//! escalate to a fatal alert rather than looping forever quietly.
//!
//! Grounded on `resilience::backoff::BackoffCalculator` (reused as-is)
//! and the teacher's own top-level `tokio::spawn` + retry wrapping in
//! `main.rs`'s polling tasks.

use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::resilience::{BackoffCalculator, BackoffConfig};

#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub backoff: BackoffConfig,
    /// A restart counts as "rapid" if it follows the previous one within
    /// this window; `rapid_restart_limit` consecutive rapid restarts
    /// escalate to a fatal alert.
    pub rapid_restart_window: Duration,
    pub rapid_restart_limit: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            rapid_restart_window: Duration::from_secs(30),
            rapid_restart_limit: 5,
        }
    }
}

/// Runs `make_loop()` repeatedly until it returns `Ok(())` (graceful
/// exit) or shutdown is signalled. Each invocation that returns `Err`
/// is treated as the background loop crashing; the supervisor backs off
/// and restarts it. `name` is only used for logging.
pub async fn supervise<F, Fut>(
    name: &'static str,
    config: SupervisorConfig,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    mut make_loop: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    let mut backoff = BackoffCalculator::new(config.backoff);
    let mut consecutive_rapid = 0u32;
    let mut last_restart: Option<Instant> = None;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let result = tokio::select! {
            r = make_loop() => r,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(loop_name = name, "supervisor_stopping_on_shutdown");
                    return;
                }
                continue;
            }
        };

        match result {
            Ok(()) => {
                info!(loop_name = name, "supervisor_loop_exited_cleanly");
                return;
            }
            Err(e) => {
                error!(loop_name = name, error = %e, "supervisor_loop_failed");

                let rapid = last_restart
                    .map(|t| t.elapsed() < config.rapid_restart_window)
                    .unwrap_or(false);
                consecutive_rapid = if rapid { consecutive_rapid + 1 } else { 0 };
                last_restart = Some(Instant::now());

                if consecutive_rapid >= config.rapid_restart_limit {
                    error!(
                        loop_name = name,
                        consecutive_rapid, "supervisor_escalating_fatal_alert_rapid_restarts"
                    );
                }

                let delay = backoff.next_backoff();
                warn!(loop_name = name, delay_ms = delay.as_millis() as u64, "supervisor_restarting_after_backoff");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn restarts_failing_loop_until_it_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let (_tx, rx) = tokio::sync::watch::channel(false);

        let config = SupervisorConfig {
            backoff: BackoffConfig { base: Duration::from_millis(1), cap: Duration::from_millis(5), ..Default::default() },
            ..Default::default()
        };

        supervise("test-loop", config, rx, move || {
            let attempts = attempts_clone.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    anyhow::bail!("simulated crash {n}")
                }
                Ok(())
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_immediately_when_shutdown_already_signalled() {
        let (tx, rx) = tokio::sync::watch::channel(false);
        tx.send(true).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        supervise("test-shutdown", SupervisorConfig::default(), rx, move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
