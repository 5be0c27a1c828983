//! Ranks the universe and reconciles the stream registry against a
//! capacity-bounded target set, per spec §4.6.

pub mod planner;

pub use planner::{PlannerConfig, RankedSymbol, Reconciliation, SubscriptionPlanner};
