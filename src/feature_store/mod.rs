//! Ticker-keyed store that both ingestion paths funnel into, and that the
//! Feature Pipeline reads a consistent per-ticker snapshot from.

pub mod rolling_window;
pub mod store;
pub mod ticker_state;

pub use rolling_window::{RollingWindow, Sample};
pub use store::FeatureStore;
pub use ticker_state::{Channel, SessionMetadata, TickerState};
