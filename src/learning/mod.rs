//! Forward-looking labelling and the daily retraining pipeline.

pub mod labeller;
pub mod trainer;

pub use labeller::{label_records, LabelRecord, LabellerConfig, PricePoint};
pub use trainer::{Trainer, TrainerConfig, TrainingOutcome, TrainingSample};
