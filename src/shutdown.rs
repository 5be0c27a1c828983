//! Graceful shutdown coordination: a single cancellation signal fanned
//! out to every background loop, with a bounded grace period before
//! forceful termination, per spec §5 ("root context is cancelled,
//! causing all loops to unwind within a bounded grace period").
//!
//! A `tokio::sync::watch<bool>` plays the role the teacher has no direct
//! analogue for — this is new ambient-stack plumbing the spec's
//! concurrency section requires, built with the same `tokio::sync`
//! primitives the teacher already depends on.

use std::time::Duration;

use tokio::signal;
use tracing::{info, warn};

pub struct ShutdownController {
    tx: tokio::sync::watch::Sender<bool>,
    grace_period: Duration,
}

impl ShutdownController {
    pub fn new(grace_period: Duration) -> Self {
        let (tx, _rx) = tokio::sync::watch::channel(false);
        Self { tx, grace_period }
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        info!("shutdown_triggered");
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits for Ctrl+C (or SIGTERM on unix) and triggers shutdown.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("shutdown_signal_ctrl_c"),
            _ = terminate => info!("shutdown_signal_sigterm"),
        }

        self.trigger();
    }

    /// Awaits `tasks` up to the configured grace period, logging (not
    /// panicking) on whatever hasn't unwound in time — forceful
    /// termination at that point is the process exiting, not this code's
    /// job to enact.
    pub async fn await_grace_period<F>(&self, tasks: F)
    where
        F: std::future::Future<Output = ()>,
    {
        match tokio::time::timeout(self.grace_period, tasks).await {
            Ok(()) => info!("shutdown_all_loops_unwound"),
            Err(_) => warn!(grace_period = ?self.grace_period, "shutdown_grace_period_exceeded_forcing_exit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_observe_trigger() {
        let controller = ShutdownController::new(Duration::from_secs(1));
        let mut rx = controller.subscribe();
        assert!(!*rx.borrow());

        controller.trigger();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(controller.is_triggered());
    }

    #[tokio::test]
    async fn grace_period_logs_but_does_not_panic_on_timeout() {
        let controller = ShutdownController::new(Duration::from_millis(10));
        controller.await_grace_period(tokio::time::sleep(Duration::from_millis(100))).await;
    }

    #[tokio::test]
    async fn grace_period_completes_when_tasks_finish_in_time() {
        let controller = ShutdownController::new(Duration::from_secs(1));
        controller.await_grace_period(async {}).await;
    }
}
