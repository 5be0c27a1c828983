//! Trainer: daily retraining pipeline for the three-learner ensemble, per
//! spec §4.10.
//!
//! The per-learner hyperparameter search is grounded directly on the
//! teacher's own `rayon` dependency (`main.rs` parallelises scan work with
//! `rayon::prelude::*`); AUC/F1/threshold scoring is hand-rolled rather
//! than pinned to a specific `smartcore` metrics signature, for the same
//! reason `models::ensemble` keeps its own tree primitive (see
//! DESIGN.md).

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::config::ThresholdStrategy;
use crate::error::TrainingError;
use crate::models::{
    ensemble::{BaggedTrees, GradientBoostedTrees, TreeFitConfig},
    ActiveArtifact, BaseLearner, ModelArtifact, TrainingMetadata,
};

#[derive(Debug, Clone, Copy)]
pub struct TrainingSample {
    pub features: [f64; 9],
    pub label: u8,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub lookback_days: u32,
    pub validation_fraction: f64,
    pub target_minority_ratio: f64,
    pub hyperparam_trials: usize,
    pub weight_grid_resolution: f64,
    pub threshold_strategy: ThresholdStrategy,
    pub time_decay_per_day: f64,
    pub wall_clock_cap: Duration,
    pub validation_auc_floor: f64,
    pub regression_tolerance: f64,
    pub drift_threshold: f64,
    pub min_samples: usize,
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            validation_fraction: 0.2,
            target_minority_ratio: 0.3,
            hyperparam_trials: 25,
            weight_grid_resolution: 0.1,
            threshold_strategy: ThresholdStrategy::F1Max,
            time_decay_per_day: 0.95,
            wall_clock_cap: Duration::from_secs(3600),
            validation_auc_floor: 0.55,
            regression_tolerance: 0.1,
            drift_threshold: 0.05,
            min_samples: 200,
            seed: 1,
        }
    }
}

pub struct TrainingOutcome {
    pub artifact: ModelArtifact,
    pub drift_alert: bool,
    pub validation_auc: f64,
}

pub struct Trainer {
    config: TrainerConfig,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Self {
        Self { config }
    }

    pub fn run(
        &self,
        samples: &[TrainingSample],
        previous_version: u64,
        prior_validation_auc: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<TrainingOutcome, TrainingError> {
        let started = Instant::now();
        if samples.len() < self.config.min_samples {
            return Err(TrainingError::InsufficientData {
                available: samples.len(),
                required: self.config.min_samples,
            });
        }

        // Step 1: time-ordered split, no shuffling across the boundary.
        let mut ordered: Vec<&TrainingSample> = samples.iter().collect();
        ordered.sort_by_key(|s| s.timestamp);
        let split_at = ((1.0 - self.config.validation_fraction) * ordered.len() as f64) as usize;
        let (train_slice, val_slice) = ordered.split_at(split_at.min(ordered.len()));

        // Step 2: class-imbalance resampling, train fold only.
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let resampled = resample_imbalance(train_slice, self.config.target_minority_ratio, &mut rng);

        // Exponential time-decay sample weights, baked in via weighted bootstrap.
        let weights: Vec<f64> = resampled
            .iter()
            .map(|s| decay_weight(s.timestamp, now, self.config.time_decay_per_day))
            .collect();
        let weighted_train = weighted_bootstrap(&resampled, &weights, &mut rng);

        let (x_train, y_train) = to_arrays(&weighted_train);
        let (x_val, y_val) = to_arrays_refs(val_slice);

        check_wall_clock(started, self.config.wall_clock_cap)?;

        // Step 3: per-learner bounded hyperparameter search, parallelised.
        let (gbm_standard, auc_a) = search_gbm(&x_train, &y_train, &x_val, &y_val, self.config.hyperparam_trials, self.config.seed, false);
        let (gbm_stochastic, auc_b) = search_gbm(&x_train, &y_train, &x_val, &y_val, self.config.hyperparam_trials, self.config.seed.wrapping_add(1), true);
        let (bagged, auc_c) = search_bagged(&x_train, &y_train, &x_val, &y_val, self.config.hyperparam_trials, self.config.seed.wrapping_add(2));

        info!(auc_a, auc_b, auc_c, "trainer_base_learner_search_complete");
        check_wall_clock(started, self.config.wall_clock_cap)?;

        let p_a = gbm_standard.predict_proba(&x_val);
        let p_b = gbm_stochastic.predict_proba(&x_val);
        let p_c = bagged.predict_proba(&x_val);

        // Step 4: ensemble weight grid search.
        let (weights3, ensemble_auc) = search_ensemble_weights(&y_val, &p_a, &p_b, &p_c, self.config.weight_grid_resolution);

        if ensemble_auc < self.config.validation_auc_floor {
            return Err(TrainingError::ValidationBelowFloor {
                achieved: ensemble_auc,
                floor: self.config.validation_auc_floor,
            });
        }
        if let Some(prior) = prior_validation_auc {
            if ensemble_auc < prior - self.config.regression_tolerance {
                return Err(TrainingError::ValidationRegressed {
                    new: ensemble_auc,
                    prior,
                    tolerance: self.config.regression_tolerance,
                });
            }
        }

        // Step 5: threshold optimisation.
        let combined: Array1<f64> = &p_a * weights3[0] + &p_b * weights3[1] + &p_c * weights3[2];
        let threshold = optimize_threshold(&y_val, &combined, self.config.threshold_strategy);

        check_wall_clock(started, self.config.wall_clock_cap)?;

        // Drift check: recent-7-day AUC vs. 30-day baseline within the validation fold.
        let (auc_7day, auc_30day) = drift_aucs(val_slice, &combined, now);
        let drift_alert = match (auc_7day, auc_30day) {
            (Some(recent), Some(baseline)) => recent < baseline - self.config.drift_threshold,
            _ => false,
        };
        if drift_alert {
            warn!(auc_7day = ?auc_7day, auc_30day = ?auc_30day, "trainer_drift_alert");
        }

        let class_ratio_positive = {
            let positives = samples.iter().filter(|s| s.label == 1).count();
            positives as f64 / samples.len() as f64
        };

        let learners = [
            BaseLearner::GbmStandard(gbm_standard),
            BaseLearner::GbmStochastic(gbm_stochastic),
            BaseLearner::Bagged(bagged),
        ];

        let metadata = TrainingMetadata {
            training_window_start: train_slice.first().map(|s| s.timestamp).unwrap_or(now),
            training_window_end: val_slice.last().map(|s| s.timestamp).unwrap_or(now),
            class_ratio_positive,
            validation_auc: ensemble_auc,
            validation_auc_7day: auc_7day,
            validation_auc_30day: auc_30day,
        };

        let artifact = ModelArtifact::new(
            previous_version + 1,
            crate::feature_pipeline::SCHEMA_VERSION,
            learners,
            weights3,
            threshold,
            metadata,
            now,
        )
        .expect("weight grid search only emits normalised, non-negative triples");

        Ok(TrainingOutcome { artifact, drift_alert, validation_auc: ensemble_auc })
    }

    /// Publishes the outcome's artifact and, on drift, leaves the caller
    /// to raise whatever alerting channel it wires up (spec §4.10 only
    /// requires the alert be emitted, not a specific transport).
    pub fn publish(&self, active: &ActiveArtifact, outcome: TrainingOutcome) {
        active.publish(outcome.artifact);
    }
}

fn check_wall_clock(started: Instant, cap: Duration) -> Result<(), TrainingError> {
    if started.elapsed() > cap {
        return Err(TrainingError::WallClockExceeded(cap));
    }
    Ok(())
}

fn decay_weight(timestamp: DateTime<Utc>, now: DateTime<Utc>, decay_per_day: f64) -> f64 {
    let days_ago = (now - timestamp).num_seconds().max(0) as f64 / 86_400.0;
    decay_per_day.powf(days_ago)
}

fn resample_imbalance(train: &[&TrainingSample], target_minority_ratio: f64, rng: &mut StdRng) -> Vec<TrainingSample> {
    let (minority, majority): (Vec<&&TrainingSample>, Vec<&&TrainingSample>) =
        train.iter().partition(|s| s.label == 1);
    if minority.is_empty() || majority.is_empty() {
        return train.iter().map(|&&s| s).collect();
    }

    // Solve for counts (min_n, maj_n) hitting target_minority_ratio while
    // oversampling the minority and lightly undersampling the majority,
    // rather than only ever inflating one side.
    let total = train.len() as f64;
    let target_min_n = (target_minority_ratio * total).round() as usize;
    let target_maj_n = train.len().saturating_sub(target_min_n).max(1);

    let mut out = Vec::with_capacity(target_min_n + target_maj_n);
    for _ in 0..target_min_n {
        let idx = rng.gen_range(0..minority.len());
        out.push(**minority[idx]);
    }
    for _ in 0..target_maj_n.min(majority.len() * 2) {
        let idx = rng.gen_range(0..majority.len());
        out.push(**majority[idx]);
    }
    out
}

fn weighted_bootstrap(samples: &[TrainingSample], weights: &[f64], rng: &mut StdRng) -> Vec<TrainingSample> {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 || samples.is_empty() {
        return samples.to_vec();
    }
    let cumulative: Vec<f64> = weights
        .iter()
        .scan(0.0, |acc, &w| {
            *acc += w / total;
            Some(*acc)
        })
        .collect();

    (0..samples.len())
        .map(|_| {
            let r: f64 = rng.gen::<f64>();
            let idx = cumulative.partition_point(|&c| c < r).min(samples.len() - 1);
            samples[idx]
        })
        .collect()
}

fn to_arrays(samples: &[TrainingSample]) -> (Array2<f64>, Array1<f64>) {
    let n = samples.len();
    let mut x = Array2::zeros((n, 9));
    let mut y = Array1::zeros(n);
    for (i, s) in samples.iter().enumerate() {
        for j in 0..9 {
            x[[i, j]] = s.features[j];
        }
        y[i] = s.label as f64;
    }
    (x, y)
}

fn to_arrays_refs(samples: &[&TrainingSample]) -> (Array2<f64>, Array1<f64>) {
    let owned: Vec<TrainingSample> = samples.iter().map(|&&s| s).collect();
    to_arrays(&owned)
}

#[derive(Debug, Clone, Copy)]
struct GbmTrial {
    n_estimators: usize,
    learning_rate: f64,
    max_depth: usize,
    subsample: f64,
}

fn random_gbm_trial(rng: &mut StdRng, stochastic: bool) -> GbmTrial {
    GbmTrial {
        n_estimators: rng.gen_range(20..=120),
        learning_rate: rng.gen_range(0.02..=0.3),
        max_depth: rng.gen_range(2..=5),
        subsample: if stochastic { rng.gen_range(0.5..=0.9) } else { 1.0 },
    }
}

fn search_gbm(
    x_train: &Array2<f64>,
    y_train: &Array1<f64>,
    x_val: &Array2<f64>,
    y_val: &Array1<f64>,
    n_trials: usize,
    seed: u64,
    stochastic: bool,
) -> (GradientBoostedTrees, f64) {
    let trials: Vec<(GbmTrial, u64)> = (0..n_trials)
        .map(|i| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
            (random_gbm_trial(&mut rng, stochastic), seed.wrapping_add(i as u64))
        })
        .collect();

    let results: Vec<(GradientBoostedTrees, f64)> = trials
        .into_par_iter()
        .map(|(trial, trial_seed)| {
            let cfg = TreeFitConfig { max_depth: trial.max_depth, min_leaf_size: 5, feature_subsample: None };
            let model = GradientBoostedTrees::fit(
                x_train,
                y_train,
                trial.n_estimators,
                trial.learning_rate,
                trial.subsample,
                cfg,
                trial_seed,
            );
            let proba = model.predict_proba(x_val);
            let score = auc(y_val, &proba);
            (model, score)
        })
        .collect();

    results
        .into_iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .expect("at least one trial runs")
}

#[derive(Debug, Clone, Copy)]
struct BaggedTrial {
    n_estimators: usize,
    max_depth: usize,
    feature_subsample: Option<usize>,
}

fn random_bagged_trial(rng: &mut StdRng) -> BaggedTrial {
    BaggedTrial {
        n_estimators: rng.gen_range(20..=150),
        max_depth: rng.gen_range(2..=6),
        feature_subsample: Some(rng.gen_range(3..=8)),
    }
}

fn search_bagged(
    x_train: &Array2<f64>,
    y_train: &Array1<f64>,
    x_val: &Array2<f64>,
    y_val: &Array1<f64>,
    n_trials: usize,
    seed: u64,
) -> (BaggedTrees, f64) {
    let trials: Vec<(BaggedTrial, u64)> = (0..n_trials)
        .map(|i| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
            (random_bagged_trial(&mut rng), seed.wrapping_add(i as u64))
        })
        .collect();

    let results: Vec<(BaggedTrees, f64)> = trials
        .into_par_iter()
        .map(|(trial, trial_seed)| {
            let cfg = TreeFitConfig {
                max_depth: trial.max_depth,
                min_leaf_size: 5,
                feature_subsample: trial.feature_subsample,
            };
            let model = BaggedTrees::fit(x_train, y_train, trial.n_estimators, cfg, trial_seed);
            let proba = model.predict_proba(x_val);
            let score = auc(y_val, &proba);
            (model, score)
        })
        .collect();

    results
        .into_iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .expect("at least one trial runs")
}

/// Grid search over non-negative weights summing to 1 at `resolution`.
fn search_ensemble_weights(
    y_val: &Array1<f64>,
    p_a: &Array1<f64>,
    p_b: &Array1<f64>,
    p_c: &Array1<f64>,
    resolution: f64,
) -> ([f64; 3], f64) {
    let steps = (1.0 / resolution).round() as i64;
    let mut best = ([1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0], f64::NEG_INFINITY);

    for i in 0..=steps {
        for j in 0..=(steps - i) {
            let k = steps - i - j;
            let w = [i as f64 / steps as f64, j as f64 / steps as f64, k as f64 / steps as f64];
            let combined: Array1<f64> = p_a * w[0] + p_b * w[1] + p_c * w[2];
            let score = auc(y_val, &combined);
            if score > best.1 {
                best = (w, score);
            }
        }
    }
    best
}

/// Rank-based AUC (Mann-Whitney U / c-statistic), tie-aware via mid-ranks.
fn auc(y_true: &Array1<f64>, y_score: &Array1<f64>) -> f64 {
    let n = y_true.len();
    let positives = y_true.iter().filter(|&&y| y > 0.5).count();
    let negatives = n - positives;
    if positives == 0 || negatives == 0 {
        return 0.5;
    }

    let mut indices: Vec<usize> = (0..n).collect();
    indices.sort_by(|&a, &b| y_score[a].partial_cmp(&y_score[b]).unwrap_or(std::cmp::Ordering::Equal));

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && (y_score[indices[j + 1]] - y_score[indices[i]]).abs() < 1e-12 {
            j += 1;
        }
        let avg_rank = ((i + 1) + (j + 1)) as f64 / 2.0;
        for idx in indices.iter().take(j + 1).skip(i) {
            ranks[*idx] = avg_rank;
        }
        i = j + 1;
    }

    let rank_sum_positive: f64 = (0..n).filter(|&idx| y_true[idx] > 0.5).map(|idx| ranks[idx]).sum();
    let u = rank_sum_positive - (positives as f64 * (positives as f64 + 1.0)) / 2.0;
    u / (positives as f64 * negatives as f64)
}

fn f1_at_threshold(y_true: &Array1<f64>, y_score: &Array1<f64>, threshold: f64) -> f64 {
    let (mut tp, mut fp, mut fn_) = (0.0, 0.0, 0.0);
    for i in 0..y_true.len() {
        let predicted = y_score[i] >= threshold;
        let actual = y_true[i] > 0.5;
        match (predicted, actual) {
            (true, true) => tp += 1.0,
            (true, false) => fp += 1.0,
            (false, true) => fn_ += 1.0,
            (false, false) => {}
        }
    }
    if tp == 0.0 {
        return 0.0;
    }
    let precision = tp / (tp + fp);
    let recall = tp / (tp + fn_);
    2.0 * precision * recall / (precision + recall)
}

fn precision_at_threshold(y_true: &Array1<f64>, y_score: &Array1<f64>, threshold: f64) -> f64 {
    let (mut tp, mut fp) = (0.0, 0.0);
    for i in 0..y_true.len() {
        if y_score[i] >= threshold {
            if y_true[i] > 0.5 {
                tp += 1.0;
            } else {
                fp += 1.0;
            }
        }
    }
    if tp + fp == 0.0 {
        0.0
    } else {
        tp / (tp + fp)
    }
}

fn optimize_threshold(y_true: &Array1<f64>, y_score: &Array1<f64>, strategy: ThresholdStrategy) -> f64 {
    let mut candidates: Vec<f64> = y_score.iter().cloned().collect();
    candidates.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    candidates.dedup();

    match strategy {
        ThresholdStrategy::F1Max => candidates
            .iter()
            .cloned()
            .max_by(|&a, &b| {
                f1_at_threshold(y_true, y_score, a)
                    .partial_cmp(&f1_at_threshold(y_true, y_score, b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(0.5),
        ThresholdStrategy::PrecisionTarget(target) => {
            let min_qualifying = candidates
                .iter()
                .cloned()
                .filter(|&t| precision_at_threshold(y_true, y_score, t) >= target)
                .fold(f64::INFINITY, f64::min);
            if min_qualifying.is_finite() {
                min_qualifying
            } else {
                // Nothing clears the precision target: fail safe to the
                // highest threshold so the model detects nothing rather
                // than over-fires below the required precision.
                candidates.last().cloned().unwrap_or(1.0)
            }
        }
    }
}

/// Recent-7-day vs. 30-day-baseline AUC within the validation fold,
/// relative to `now`. `None` when there isn't enough of either window to
/// score meaningfully.
fn drift_aucs(val_slice: &[&TrainingSample], combined: &Array1<f64>, now: DateTime<Utc>) -> (Option<f64>, Option<f64>) {
    let seven_days = chrono::Duration::days(7);
    let thirty_days = chrono::Duration::days(30);

    let recent_idx: Vec<usize> = val_slice
        .iter()
        .enumerate()
        .filter(|(_, s)| now - s.timestamp <= seven_days)
        .map(|(i, _)| i)
        .collect();
    let baseline_idx: Vec<usize> = val_slice
        .iter()
        .enumerate()
        .filter(|(_, s)| now - s.timestamp <= thirty_days)
        .map(|(i, _)| i)
        .collect();

    let slice_auc = |idx: &[usize]| -> Option<f64> {
        if idx.len() < 10 {
            return None;
        }
        let y = Array1::from_iter(idx.iter().map(|&i| val_slice[i].label as f64));
        let p = Array1::from_iter(idx.iter().map(|&i| combined[i]));
        Some(auc(&y, &p))
    };

    (slice_auc(&recent_idx), slice_auc(&baseline_idx))
}

#[path = "trainer_tests.rs"]
#[cfg(test)]
mod trainer_tests;
