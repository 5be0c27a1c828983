use super::*;
use chrono::TimeZone;

fn at(days_ago: i64) -> DateTime<Utc> {
    let now = Utc.with_ymd_and_hms(2026, 7, 26, 0, 0, 0).unwrap();
    now - chrono::Duration::days(days_ago)
}

/// Deterministic separable dataset: feature 0 carries the signal, label is
/// a noisy-but-learnable function of it, spread across the lookback window
/// so the time-ordered split and decay weighting both have something to do.
fn synthetic_samples(n: usize) -> Vec<TrainingSample> {
    let mut samples = Vec::with_capacity(n);
    for i in 0..n {
        let days_ago = 30 - (i * 30 / n) as i64;
        let positive = i % 3 == 0;
        let mut features = [0.0; 9];
        features[0] = if positive { 1.0 } else { 0.0 };
        features[1] = (i % 5) as f64 * 0.1;
        samples.push(TrainingSample {
            features,
            label: if positive { 1 } else { 0 },
            timestamp: at(days_ago),
        });
    }
    samples
}

#[test]
fn rejects_when_below_minimum_sample_count() {
    let trainer = Trainer::new(TrainerConfig { min_samples: 200, ..Default::default() });
    let samples = synthetic_samples(10);
    let result = trainer.run(&samples, 0, None, at(0));
    assert!(matches!(result, Err(TrainingError::InsufficientData { available: 10, required: 200 })));
}

#[test]
fn end_to_end_run_produces_a_valid_artifact() {
    let config = TrainerConfig {
        min_samples: 60,
        hyperparam_trials: 4,
        weight_grid_resolution: 0.5,
        validation_auc_floor: 0.0,
        ..Default::default()
    };
    let trainer = Trainer::new(config);
    let samples = synthetic_samples(300);

    let outcome = trainer.run(&samples, 5, None, at(0)).expect("synthetic separable data should train");
    assert_eq!(outcome.artifact.version, 6);
    let weight_sum: f64 = outcome.artifact.weights.iter().sum();
    assert!((weight_sum - 1.0).abs() < 1e-6);
    assert!(outcome.artifact.weights.iter().all(|&w| w >= 0.0));
    assert!(outcome.validation_auc >= 0.0 && outcome.validation_auc <= 1.0);
    assert!(outcome.artifact.threshold.is_finite());
}

#[test]
fn rejects_when_validation_auc_below_floor() {
    let config = TrainerConfig {
        min_samples: 60,
        hyperparam_trials: 2,
        weight_grid_resolution: 0.5,
        validation_auc_floor: 0.999,
        ..Default::default()
    };
    let trainer = Trainer::new(config);
    let samples = synthetic_samples(300);

    let result = trainer.run(&samples, 0, None, at(0));
    assert!(matches!(result, Err(TrainingError::ValidationBelowFloor { .. })));
}

#[test]
fn rejects_when_validation_regressed_past_tolerance() {
    let config = TrainerConfig {
        min_samples: 60,
        hyperparam_trials: 2,
        weight_grid_resolution: 0.5,
        validation_auc_floor: 0.0,
        regression_tolerance: 0.01,
        ..Default::default()
    };
    let trainer = Trainer::new(config);
    let samples = synthetic_samples(300);

    let result = trainer.run(&samples, 0, Some(0.999), at(0));
    assert!(matches!(result, Err(TrainingError::ValidationRegressed { .. })));
}

#[test]
fn wall_clock_cap_of_zero_aborts_immediately() {
    let config = TrainerConfig { min_samples: 60, wall_clock_cap: Duration::from_secs(0), ..Default::default() };
    let trainer = Trainer::new(config);
    let samples = synthetic_samples(300);

    let result = trainer.run(&samples, 0, None, at(0));
    assert!(matches!(result, Err(TrainingError::WallClockExceeded(_))));
}

#[test]
fn auc_of_perfect_separation_is_one() {
    let y = Array1::from(vec![0.0, 0.0, 1.0, 1.0]);
    let scores = Array1::from(vec![0.1, 0.2, 0.8, 0.9]);
    assert!((auc(&y, &scores) - 1.0).abs() < 1e-9);
}

#[test]
fn auc_of_inverted_ranking_is_zero() {
    let y = Array1::from(vec![0.0, 0.0, 1.0, 1.0]);
    let scores = Array1::from(vec![0.9, 0.8, 0.2, 0.1]);
    assert!((auc(&y, &scores) - 0.0).abs() < 1e-9);
}

#[test]
fn auc_with_no_positives_defaults_to_half() {
    let y = Array1::from(vec![0.0, 0.0, 0.0]);
    let scores = Array1::from(vec![0.1, 0.5, 0.9]);
    assert_eq!(auc(&y, &scores), 0.5);
}

#[test]
fn f1_max_threshold_prefers_perfect_separation_boundary() {
    let y = Array1::from(vec![0.0, 0.0, 1.0, 1.0]);
    let scores = Array1::from(vec![0.1, 0.2, 0.8, 0.9]);
    let threshold = optimize_threshold(&y, &scores, ThresholdStrategy::F1Max);
    assert!(f1_at_threshold(&y, &scores, threshold) > 0.99);
}

#[test]
fn precision_target_picks_lowest_qualifying_threshold() {
    let y = Array1::from(vec![0.0, 1.0, 1.0, 1.0]);
    let scores = Array1::from(vec![0.1, 0.4, 0.6, 0.9]);
    // at 0.4 precision is 1.0 (only true positives above it), so the
    // lowest qualifying threshold for a 0.9 target should be 0.4.
    let threshold = optimize_threshold(&y, &scores, ThresholdStrategy::PrecisionTarget(0.9));
    assert!((threshold - 0.4).abs() < 1e-9);
}

#[test]
fn precision_target_falls_back_to_highest_threshold_when_unreachable() {
    let y = Array1::from(vec![0.0, 1.0, 0.0, 1.0]);
    let scores = Array1::from(vec![0.1, 0.2, 0.3, 0.4]);
    let threshold = optimize_threshold(&y, &scores, ThresholdStrategy::PrecisionTarget(1.1));
    assert!((threshold - 0.4).abs() < 1e-9);
}

#[test]
fn decay_weight_is_one_at_zero_days_and_shrinks_with_age() {
    let now = at(0);
    assert!((decay_weight(now, now, 0.95) - 1.0).abs() < 1e-9);
    let older = decay_weight(at(10), now, 0.95);
    assert!(older < 1.0 && older > 0.0);
}
