//! Append-only, date-partitioned archive of every inference tick.

pub mod logger;

pub use logger::{prune_retention, HistoricalRecord, HistoryLogger};
