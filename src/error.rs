//! Typed errors at component boundaries.
//!
//! Per the re-architecture note in the spec: broker/session errors are
//! typed results, not exceptions. Orchestration code (main, scheduler jobs)
//! still works in `anyhow::Result` the way the teacher's `main.rs` does.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("transient network error: {0}")]
    Network(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("auth failure: {0}")]
    AuthFailure(String),

    #[error("subscription cap exceeded: {current}/{cap} slots in use")]
    SubscriptionCapExceeded { current: usize, cap: usize },

    #[error("request deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),

    #[error("retry budget exhausted after {attempts} attempts: {last_error}")]
    RetryBudgetExhausted { attempts: u32, last_error: String },

    #[error("circuit breaker open, fast-failing stream operation")]
    CircuitOpen,

    #[error("stream not connected (state={0})")]
    NotConnected(String),
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("feature schema mismatch: artifact expects v{expected}, pipeline produced v{actual}")]
    SchemaMismatch { expected: u32, actual: u32 },

    #[error("no active model artifact loaded")]
    NoArtifact,

    #[error("ticker {0} exceeded soft inference deadline")]
    DeadlineExceeded(String),
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("insufficient labelled history: {available} records, need at least {required}")]
    InsufficientData { available: usize, required: usize },

    #[error("validation AUC {achieved:.4} below sanity floor {floor:.4}")]
    ValidationBelowFloor { achieved: f64, floor: f64 },

    #[error("validation AUC {new:.4} regressed more than {tolerance:.4} below prior {prior:.4}")]
    ValidationRegressed { new: f64, prior: f64, tolerance: f64 },

    #[error("training run exceeded wall-clock cap of {0:?}")]
    WallClockExceeded(std::time::Duration),
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("io error writing partition {partition}: {source}")]
    Io {
        partition: String,
        #[source]
        source: std::io::Error,
    },

    #[error("logger queue overflow: {dropped} samples dropped")]
    QueueOverflow { dropped: u64 },
}
