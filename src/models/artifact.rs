//! The immutable, versioned bundle the Inference Engine swaps atomically,
//! per spec §3/§4.7/§4.10.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::ensemble::BaseLearner;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingMetadata {
    pub training_window_start: DateTime<Utc>,
    pub training_window_end: DateTime<Utc>,
    pub class_ratio_positive: f64,
    pub validation_auc: f64,
    pub validation_auc_7day: Option<f64>,
    pub validation_auc_30day: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version: u64,
    pub schema_version: u32,
    pub learners: [BaseLearner; 3],
    pub weights: [f64; 3],
    pub threshold: f64,
    pub metadata: TrainingMetadata,
    pub published_at: DateTime<Utc>,
}

const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

impl ModelArtifact {
    /// Per spec §3: "the ensemble weight triple summing to 1". Constructed
    /// only through this constructor so the invariant can't be bypassed.
    pub fn new(
        version: u64,
        schema_version: u32,
        learners: [BaseLearner; 3],
        weights: [f64; 3],
        threshold: f64,
        metadata: TrainingMetadata,
        now: DateTime<Utc>,
    ) -> Result<Self, String> {
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(format!("ensemble weights must sum to 1, got {sum}"));
        }
        if weights.iter().any(|&w| w < 0.0) {
            return Err("ensemble weights must be non-negative".to_string());
        }
        Ok(Self {
            version,
            schema_version,
            learners,
            weights,
            threshold,
            metadata,
            published_at: now,
        })
    }
}

/// Atomic active-artifact pointer: inference reads never observe a
/// half-swapped state, per spec §5's shared-resource policy. Grounded
/// directly on the teacher's own `arc-swap` dependency.
#[derive(Default)]
pub struct ActiveArtifact {
    current: ArcSwap<Option<ModelArtifact>>,
    previous: ArcSwap<Option<ModelArtifact>>,
}

impl ActiveArtifact {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(None),
            previous: ArcSwap::from_pointee(None),
        }
    }

    pub fn load(&self) -> Option<Arc<ModelArtifact>> {
        let guard = self.current.load();
        match &**guard {
            Some(artifact) => Some(Arc::new(artifact.clone())),
            None => None,
        }
    }

    /// Publishes a new artifact, retaining the outgoing one for rollback
    /// per spec §4.10 step 6.
    pub fn publish(&self, artifact: ModelArtifact) {
        let outgoing = self.current.swap(Arc::new(Some(artifact)));
        self.previous.store(outgoing);
    }

    /// Rolls back to the previously active artifact, if any.
    pub fn rollback(&self) -> bool {
        let prior = self.previous.load_full();
        if prior.is_some() {
            self.current.store(prior);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ensemble::{BaggedTrees, GradientBoostedTrees, TreeNode};

    fn stub_learners() -> [BaseLearner; 3] {
        [
            BaseLearner::GbmStandard(GradientBoostedTrees { init_raw: 0.0, learning_rate: 0.1, trees: vec![] }),
            BaseLearner::GbmStochastic(GradientBoostedTrees { init_raw: 0.0, learning_rate: 0.1, trees: vec![] }),
            BaseLearner::Bagged(BaggedTrees { trees: vec![TreeNode::Leaf(0.5)] }),
        ]
    }

    fn stub_metadata() -> TrainingMetadata {
        TrainingMetadata {
            training_window_start: Utc::now(),
            training_window_end: Utc::now(),
            class_ratio_positive: 0.05,
            validation_auc: 0.7,
            validation_auc_7day: None,
            validation_auc_30day: None,
        }
    }

    #[test]
    fn rejects_weights_not_summing_to_one() {
        let err = ModelArtifact::new(1, 1, stub_learners(), [0.5, 0.5, 0.5], 0.5, stub_metadata(), Utc::now())
            .unwrap_err();
        assert!(err.contains("sum"));
    }

    #[test]
    fn accepts_weights_within_tolerance() {
        let artifact = ModelArtifact::new(1, 1, stub_learners(), [0.34, 0.33, 0.33], 0.5, stub_metadata(), Utc::now());
        assert!(artifact.is_ok());
    }

    #[test]
    fn publish_retains_prior_version_for_rollback() {
        let active = ActiveArtifact::new();
        assert!(active.load().is_none());

        let first = ModelArtifact::new(1, 1, stub_learners(), [0.34, 0.33, 0.33], 0.5, stub_metadata(), Utc::now()).unwrap();
        active.publish(first);
        assert_eq!(active.load().unwrap().version, 1);

        let second = ModelArtifact::new(2, 1, stub_learners(), [0.34, 0.33, 0.33], 0.5, stub_metadata(), Utc::now()).unwrap();
        active.publish(second);
        assert_eq!(active.load().unwrap().version, 2);

        assert!(active.rollback());
        assert_eq!(active.load().unwrap().version, 1);
    }
}
