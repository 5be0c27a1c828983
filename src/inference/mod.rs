//! Scores the live feature vector per ticker against the active model
//! artifact every polling cycle, per spec §4.7.

pub mod engine;

pub use engine::{Detection, InferenceEngine, InferenceEngineConfig};
