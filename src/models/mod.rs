//! Model artifacts and the base-learner ensemble they bundle.

pub mod artifact;
pub mod ensemble;

pub use artifact::{ActiveArtifact, ModelArtifact, TrainingMetadata};
pub use ensemble::{BaseLearner, BaggedTrees, GradientBoostedTrees, TreeFitConfig, TreeNode, ensemble_probability};
