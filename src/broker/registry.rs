//! Subscription registry.
//!
//! The single source of truth for what is currently subscribed, owned by
//! the Stream Client per spec §9's re-architecture note ("subscription
//! tracked implicitly by the set of live tasks becomes an explicit
//! registry data structure"). Reconnects replay this registry in its
//! `(symbol, channel)` sorted order — not the order subscriptions were
//! originally acknowledged in — which still satisfies spec §4.2's
//! invariant that replay is deterministic and covers the full set.

use std::collections::BTreeSet;
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Trades,
    Book,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subscription {
    pub symbol: String,
    pub channel: Channel,
}

struct Inner {
    // Sorted by (symbol, channel), not insertion order: replay-on-reconnect
    // is deterministic and exhaustive per spec §4.2, but not chronological.
    live: BTreeSet<Subscription>,
    cap: usize,
}

pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
}

impl SubscriptionRegistry {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: RwLock::new(Inner { live: BTreeSet::new(), cap }),
        }
    }

    pub fn cap(&self) -> usize {
        self.inner.read().cap
    }

    pub fn len(&self) -> usize {
        self.inner.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, sub: &Subscription) -> bool {
        self.inner.read().live.contains(sub)
    }

    /// Returns Ok(true) if newly added, Ok(false) if already present
    /// (idempotent per spec §4.2), Err if the cap would be exceeded.
    pub fn try_add(&self, sub: Subscription) -> Result<bool, (usize, usize)> {
        let mut inner = self.inner.write();
        if inner.live.contains(&sub) {
            return Ok(false);
        }
        if inner.live.len() + 1 > inner.cap {
            return Err((inner.live.len(), inner.cap));
        }
        inner.live.insert(sub);
        Ok(true)
    }

    /// Idempotent: removing an absent subscription is a no-op success.
    pub fn remove(&self, sub: &Subscription) -> bool {
        self.inner.write().live.remove(sub)
    }

    pub fn snapshot(&self) -> Vec<Subscription> {
        self.inner.read().live.iter().cloned().collect()
    }

    pub fn symbols(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut seen = std::collections::BTreeSet::new();
        for sub in inner.live.iter() {
            seen.insert(sub.symbol.clone());
        }
        seen.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(symbol: &str, channel: Channel) -> Subscription {
        Subscription { symbol: symbol.to_string(), channel }
    }

    #[test]
    fn subscribe_then_unsubscribe_is_a_no_op_on_count() {
        let reg = SubscriptionRegistry::new(10);
        let s = sub("AAPL", Channel::Trades);
        assert!(reg.try_add(s.clone()).unwrap());
        assert_eq!(reg.len(), 1);
        assert!(reg.remove(&s));
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn re_adding_same_subscription_is_idempotent() {
        let reg = SubscriptionRegistry::new(10);
        let s = sub("AAPL", Channel::Trades);
        assert!(reg.try_add(s.clone()).unwrap());
        assert!(!reg.try_add(s).unwrap());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn never_exceeds_cap() {
        let reg = SubscriptionRegistry::new(2);
        assert!(reg.try_add(sub("A", Channel::Trades)).unwrap());
        assert!(reg.try_add(sub("B", Channel::Trades)).unwrap());
        let err = reg.try_add(sub("C", Channel::Trades)).unwrap_err();
        assert_eq!(err, (2, 2));
        assert_eq!(reg.len(), 2);
    }
}
