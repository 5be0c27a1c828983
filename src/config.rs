//! Process configuration.
//!
//! Typed settings with per-field environment overrides, mirroring
//! `SessionConfig::from_env`'s pattern in the teacher's Binance session
//! module. Defaults match the values spec.md §6 lists.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Total number of tickers polled over REST each cycle.
    pub universe_size: usize,
    /// Top-K symbols kept on the stream, per channel.
    pub top_k_stream: usize,
    /// REST polling interval under normal operation.
    pub rest_poll_interval: Duration,
    /// REST polling interval while DEGRADED (stream unavailable).
    pub degraded_poll_interval: Duration,
    /// Broker-imposed session-wide subscription cap.
    pub subscription_cap: usize,
    /// Labelling threshold theta (forward-return ratio).
    pub label_theta: f64,
    /// Forward look-ahead window for labelling.
    pub forward_window: Duration,
    /// Training window in days.
    pub training_window_days: u32,
    /// Hyperparameter search trials per base learner.
    pub training_trials_per_learner: u32,
    /// Threshold selection strategy.
    pub threshold_strategy: ThresholdStrategy,
    /// Circuit breaker consecutive-failure threshold.
    pub circuit_breaker_threshold: u32,
    /// Circuit breaker cool-down.
    pub circuit_breaker_cooldown: Duration,
    /// Backoff base delay.
    pub backoff_base: Duration,
    /// Backoff cap.
    pub backoff_cap: Duration,
    /// Backoff jitter fraction (e.g. 0.3 == +/-30%).
    pub backoff_jitter: f64,
    /// History retention window in days.
    pub history_retention_days: u32,
    /// REST request deadline.
    pub rest_deadline: Duration,
    /// Stream send deadline.
    pub stream_send_deadline: Duration,
    /// Token-refresh deadline.
    pub token_refresh_deadline: Duration,
    /// Soft per-cycle inference deadline.
    pub inference_cycle_deadline: Duration,
    /// Trainer hard wall-clock cap.
    pub trainer_wall_clock_cap: Duration,
    /// Subscription planner rotation interval.
    pub planner_rotation_interval: Duration,
    /// Pause between unsubscribe and subscribe phases.
    pub planner_unsub_settle: Duration,
    /// Graceful shutdown grace period.
    pub shutdown_grace: Duration,
    /// Multiplier applied to `rest_poll_interval` to derive the staleness
    /// bound at which a feature input is masked (Open Question in spec §9).
    pub staleness_multiplier: u32,
    /// Channels reserved per symbol that count against the subscription cap.
    pub channels_per_symbol: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdStrategy {
    F1Max,
    PrecisionTarget(f64),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            universe_size: 300,
            top_k_stream: 20,
            rest_poll_interval: Duration::from_secs(5),
            degraded_poll_interval: Duration::from_secs(1),
            subscription_cap: 41,
            label_theta: 0.05,
            forward_window: Duration::from_secs(60 * 60),
            training_window_days: 30,
            training_trials_per_learner: 25,
            threshold_strategy: ThresholdStrategy::F1Max,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            backoff_jitter: 0.3,
            history_retention_days: 30,
            rest_deadline: Duration::from_secs(5),
            stream_send_deadline: Duration::from_secs(2),
            token_refresh_deadline: Duration::from_secs(10),
            inference_cycle_deadline: Duration::from_secs(2),
            trainer_wall_clock_cap: Duration::from_secs(60 * 60),
            planner_rotation_interval: Duration::from_secs(5 * 60),
            planner_unsub_settle: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(10),
            staleness_multiplier: 5,
            channels_per_symbol: 2,
        }
    }
}

impl Config {
    /// Load from environment, falling back to defaults field-by-field.
    pub fn from_env() -> Self {
        let mut c = Self::default();

        if let Ok(v) = env::var("SENTINEL_UNIVERSE_SIZE") {
            c.universe_size = v.parse().unwrap_or(c.universe_size);
        }
        if let Ok(v) = env::var("SENTINEL_TOP_K_STREAM") {
            c.top_k_stream = v.parse().unwrap_or(c.top_k_stream);
        }
        if let Ok(v) = env::var("SENTINEL_REST_POLL_INTERVAL_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                c.rest_poll_interval = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = env::var("SENTINEL_DEGRADED_POLL_INTERVAL_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                c.degraded_poll_interval = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = env::var("SENTINEL_SUBSCRIPTION_CAP") {
            c.subscription_cap = v.parse().unwrap_or(c.subscription_cap);
        }
        if let Ok(v) = env::var("SENTINEL_LABEL_THETA") {
            c.label_theta = v.parse().unwrap_or(c.label_theta);
        }
        if let Ok(v) = env::var("SENTINEL_FORWARD_WINDOW_MIN") {
            if let Ok(min) = v.parse::<u64>() {
                c.forward_window = Duration::from_secs(min * 60);
            }
        }
        if let Ok(v) = env::var("SENTINEL_TRAINING_WINDOW_DAYS") {
            c.training_window_days = v.parse().unwrap_or(c.training_window_days);
        }
        if let Ok(v) = env::var("SENTINEL_TRAINING_TRIALS") {
            c.training_trials_per_learner = v.parse().unwrap_or(c.training_trials_per_learner);
        }
        if let Ok(v) = env::var("SENTINEL_THRESHOLD_STRATEGY") {
            c.threshold_strategy = parse_threshold_strategy(&v).unwrap_or(c.threshold_strategy);
        }
        if let Ok(v) = env::var("SENTINEL_CIRCUIT_BREAKER_THRESHOLD") {
            c.circuit_breaker_threshold = v.parse().unwrap_or(c.circuit_breaker_threshold);
        }
        if let Ok(v) = env::var("SENTINEL_CIRCUIT_BREAKER_COOLDOWN_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                c.circuit_breaker_cooldown = Duration::from_secs(s);
            }
        }
        if let Ok(v) = env::var("SENTINEL_HISTORY_RETENTION_DAYS") {
            c.history_retention_days = v.parse().unwrap_or(c.history_retention_days);
        }

        c
    }

    /// Reject an obviously-inconsistent configuration before any network
    /// I/O starts (supplemental operation #1, SPEC_FULL.md §4).
    pub fn validate(&self) -> Result<(), String> {
        let wanted = self.top_k_stream * self.channels_per_symbol;
        if wanted > self.subscription_cap {
            return Err(format!(
                "top_k_stream ({}) * channels_per_symbol ({}) = {} exceeds subscription_cap ({})",
                self.top_k_stream, self.channels_per_symbol, wanted, self.subscription_cap
            ));
        }
        if self.label_theta <= 0.0 || self.label_theta >= 1.0 {
            return Err(format!("label_theta must be in (0, 1), got {}", self.label_theta));
        }
        if self.universe_size == 0 {
            return Err("universe_size must be > 0".to_string());
        }
        if let ThresholdStrategy::PrecisionTarget(p) = self.threshold_strategy {
            if !(0.0..=1.0).contains(&p) {
                return Err(format!("precision_target must be in [0, 1], got {}", p));
            }
        }
        Ok(())
    }

    /// Staleness bound beyond which a feature input is masked (Open
    /// Question in spec §9, resolved as 5x the poll interval by default).
    pub fn staleness_bound(&self) -> Duration {
        self.rest_poll_interval * self.staleness_multiplier
    }
}

fn parse_threshold_strategy(v: &str) -> Option<ThresholdStrategy> {
    if v == "f1_max" {
        return Some(ThresholdStrategy::F1Max);
    }
    if let Some(rest) = v.strip_prefix("precision_target@") {
        return rest.parse::<f64>().ok().map(ThresholdStrategy::PrecisionTarget);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_oversubscribed_top_k() {
        let mut c = Config::default();
        c.top_k_stream = 30;
        c.channels_per_symbol = 2;
        c.subscription_cap = 41;
        assert!(c.validate().is_err());
    }

    #[test]
    fn parses_precision_target_strategy() {
        assert_eq!(
            parse_threshold_strategy("precision_target@0.7"),
            Some(ThresholdStrategy::PrecisionTarget(0.7))
        );
        assert_eq!(parse_threshold_strategy("f1_max"), Some(ThresholdStrategy::F1Max));
        assert_eq!(parse_threshold_strategy("garbage"), None);
    }
}
