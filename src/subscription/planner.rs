//! Subscription Planner: decides the top-K symbols to keep on the stream
//! and reconciles that target against the live registry, per spec §4.6.
//!
//! Grounded on `scrapers::binance_session`'s `ResyncCoordinator` delta
//! computation (current-vs-target set diffing) generalized from a fixed
//! watchlist to a ranked, capacity-bounded universe.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::warn;

use crate::broker::registry::{Channel, Subscription, SubscriptionRegistry};
use crate::error::BrokerError;

/// One candidate in the ranking pass: enough to rank and break ties.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedSymbol {
    pub symbol: String,
    pub volume_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub to_drop: Vec<Subscription>,
    pub to_add: Vec<Subscription>,
}

pub struct PlannerConfig {
    /// Channels every selected symbol subscribes to.
    pub channels: Vec<Channel>,
    /// Slots reserved for non-market channels that also count against cap.
    pub reserved_slots: usize,
    pub unsub_settle_delay: Duration,
    pub retry_delay: Duration,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            channels: vec![Channel::Trades, Channel::Book],
            reserved_slots: 0,
            unsub_settle_delay: Duration::from_millis(100),
            retry_delay: Duration::from_millis(500),
        }
    }
}

pub struct SubscriptionPlanner {
    config: PlannerConfig,
}

impl SubscriptionPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Ranks by volume ratio descending, ties broken by subscription
    /// stickiness (currently-subscribed symbols sort first among equals),
    /// then truncates to what fits under `cap` given per-symbol channel
    /// count and reserved slots.
    pub fn select_top_k(
        &self,
        mut ranked: Vec<RankedSymbol>,
        currently_subscribed: &BTreeSet<String>,
        cap: usize,
    ) -> Vec<String> {
        ranked.sort_by(|a, b| {
            b.volume_ratio
                .partial_cmp(&a.volume_ratio)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let a_sticky = currently_subscribed.contains(&a.symbol);
                    let b_sticky = currently_subscribed.contains(&b.symbol);
                    b_sticky.cmp(&a_sticky)
                })
        });

        let channels_per_symbol = self.config.channels.len().max(1);
        let usable_slots = cap.saturating_sub(self.config.reserved_slots);
        let k = usable_slots / channels_per_symbol;

        ranked.into_iter().take(k).map(|r| r.symbol).collect()
    }

    /// `to_drop = current - target`, `to_add = target - current`, per
    /// spec §4.6.
    pub fn reconcile(&self, target: &[String], registry: &SubscriptionRegistry) -> Reconciliation {
        let current = registry.snapshot();
        let target_set: BTreeSet<&String> = target.iter().collect();
        let current_symbols: BTreeSet<String> = current.iter().map(|s| s.symbol.clone()).collect();

        let to_drop: Vec<Subscription> = current
            .into_iter()
            .filter(|s| !target_set.contains(&s.symbol))
            .collect();

        let to_add: Vec<Subscription> = target
            .iter()
            .filter(|symbol| !current_symbols.contains(*symbol))
            .flat_map(|symbol| {
                self.config
                    .channels
                    .iter()
                    .map(move |&channel| Subscription { symbol: symbol.clone(), channel })
            })
            .collect();

        Reconciliation { to_drop, to_add }
    }

    /// Applies a reconciliation: unsubscribes first, waits for the broker
    /// to free slots, then subscribes. Cap rejections retry once after a
    /// short delay and log a warning; the planner never exceeds the cap.
    pub async fn apply<F, Fut>(&self, reconciliation: Reconciliation, mut issue: F)
    where
        F: FnMut(Subscription, bool) -> Fut,
        Fut: std::future::Future<Output = Result<(), BrokerError>>,
    {
        for sub in reconciliation.to_drop {
            if let Err(e) = issue(sub.clone(), false).await {
                warn!(symbol = %sub.symbol, error = %e, "planner_unsubscribe_failed");
            }
        }

        tokio::time::sleep(self.config.unsub_settle_delay).await;

        for sub in reconciliation.to_add {
            match issue(sub.clone(), true).await {
                Ok(()) => {}
                Err(BrokerError::SubscriptionCapExceeded { current, cap }) => {
                    warn!(
                        symbol = %sub.symbol,
                        current,
                        cap,
                        "planner_subscribe_rejected_cap_exceeded_retrying_once"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                    if let Err(e) = issue(sub.clone(), true).await {
                        warn!(symbol = %sub.symbol, error = %e, "planner_subscribe_retry_failed");
                    }
                }
                Err(e) => warn!(symbol = %sub.symbol, error = %e, "planner_subscribe_failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(symbol: &str, ratio: f64) -> RankedSymbol {
        RankedSymbol { symbol: symbol.to_string(), volume_ratio: ratio }
    }

    #[test]
    fn select_top_k_truncates_to_fit_cap_with_two_channels_per_symbol() {
        let planner = SubscriptionPlanner::new(PlannerConfig::default());
        let candidates = vec![ranked("A", 5.0), ranked("B", 4.0), ranked("C", 3.0), ranked("D", 2.0)];
        // cap 6 / 2 channels per symbol = 3 symbols.
        let top = planner.select_top_k(candidates, &BTreeSet::new(), 6);
        assert_eq!(top, vec!["A", "B", "C"]);
    }

    #[test]
    fn ties_prefer_currently_subscribed_symbols() {
        let planner = SubscriptionPlanner::new(PlannerConfig::default());
        let candidates = vec![ranked("NEW", 3.0), ranked("OLD", 3.0)];
        let mut current = BTreeSet::new();
        current.insert("OLD".to_string());
        let top = planner.select_top_k(candidates, &current, 2);
        assert_eq!(top, vec!["OLD"]);
    }

    #[test]
    fn reconcile_computes_symmetric_difference() {
        let planner = SubscriptionPlanner::new(PlannerConfig::default());
        let registry = SubscriptionRegistry::new(100);
        registry.try_add(Subscription { symbol: "A".into(), channel: Channel::Trades }).unwrap();
        registry.try_add(Subscription { symbol: "A".into(), channel: Channel::Book }).unwrap();
        registry.try_add(Subscription { symbol: "B".into(), channel: Channel::Trades }).unwrap();

        let target = vec!["A".to_string(), "C".to_string()];
        let plan = planner.reconcile(&target, &registry);

        assert_eq!(plan.to_drop.len(), 1);
        assert_eq!(plan.to_drop[0].symbol, "B");
        assert_eq!(plan.to_add.len(), 2); // C on both channels
        assert!(plan.to_add.iter().all(|s| s.symbol == "C"));
    }

    #[test]
    fn never_reconciles_an_already_subscribed_symbol_as_new() {
        let planner = SubscriptionPlanner::new(PlannerConfig::default());
        let registry = SubscriptionRegistry::new(100);
        registry.try_add(Subscription { symbol: "A".into(), channel: Channel::Trades }).unwrap();
        registry.try_add(Subscription { symbol: "A".into(), channel: Channel::Book }).unwrap();

        let target = vec!["A".to_string()];
        let plan = planner.reconcile(&target, &registry);
        assert!(plan.to_add.is_empty());
        assert!(plan.to_drop.is_empty());
    }
}
