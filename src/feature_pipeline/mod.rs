//! Pure derivation of the feature vector consumed by the Inference Engine
//! and archived by the History Logger, per spec §4.5.

pub mod compute;
pub mod indicators;

pub use compute::{compute, CalendarContext, FeatureVector, Masked, SCHEMA_VERSION};
