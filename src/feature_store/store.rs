//! The Feature Store: a ticker-keyed map with fine-grained per-ticker
//! locking (spec §4.4), bounded by an LRU eviction policy when the
//! universe exceeds the configured memory budget.
//!
//! Grounded on the teacher's sharded-lock pattern for per-symbol state in
//! `scrapers::binance_session` (`Arc<RwLock<...>>` per symbol, a coarser
//! lock only for the map's own shape).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::info;

use crate::broker::rest::QuoteSnapshot;
use crate::broker::stream::{BookFrame, TradeFrame};

use super::ticker_state::{Channel, TickerState};

struct Entry {
    state: Arc<RwLock<TickerState>>,
    last_touched: Instant,
}

struct Inner {
    entries: HashMap<String, Entry>,
    capacity: usize,
}

pub struct FeatureStore {
    inner: RwLock<Inner>,
}

impl FeatureStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                capacity,
            }),
        }
    }

    /// Returns the per-ticker lock, creating the entry on first
    /// observation of the symbol this session (spec §3).
    fn entry(&self, symbol: &str) -> Arc<RwLock<TickerState>> {
        {
            let mut inner = self.inner.write();
            if let Some(entry) = inner.entries.get_mut(symbol) {
                entry.last_touched = Instant::now();
                return entry.state.clone();
            }
        }

        let state = Arc::new(RwLock::new(TickerState::new(symbol)));
        let mut inner = self.inner.write();
        // Re-check: another writer may have inserted while we built `state`.
        if let Some(entry) = inner.entries.get_mut(symbol) {
            entry.last_touched = Instant::now();
            return entry.state.clone();
        }
        inner.entries.insert(
            symbol.to_string(),
            Entry { state: state.clone(), last_touched: Instant::now() },
        );
        Self::evict_if_over_capacity(&mut inner);
        state
    }

    fn evict_if_over_capacity(inner: &mut Inner) {
        if inner.capacity == 0 || inner.entries.len() <= inner.capacity {
            return;
        }
        let oldest = inner
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_touched)
            .map(|(symbol, _)| symbol.clone());
        if let Some(symbol) = oldest {
            inner.entries.remove(&symbol);
            info!(symbol = %symbol, "feature_store_evicted_lru");
        }
    }

    pub fn apply_rest_snapshot(&self, snapshot: &QuoteSnapshot, now: DateTime<Utc>) {
        let entry = self.entry(&snapshot.symbol);
        entry.write().apply_rest_snapshot(snapshot, now);
    }

    pub fn apply_trade_frame(&self, frame: &TradeFrame) {
        let entry = self.entry(&frame.symbol);
        entry.write().apply_trade_frame(frame);
    }

    pub fn apply_book_frame(&self, frame: &BookFrame) {
        let entry = self.entry(&frame.symbol);
        entry.write().apply_book_frame(frame);
    }

    pub fn preload_session_metadata(&self, symbol: &str, previous_close: f64, avg_volume_5session: f64) {
        let entry = self.entry(symbol);
        entry.write().preload_session_metadata(previous_close, avg_volume_5session);
    }

    /// A consistent point-in-time snapshot of the ticker's state, taken
    /// under the per-ticker read lock per spec §5's ordering guarantee.
    pub fn snapshot(&self, symbol: &str) -> Option<TickerState> {
        let inner = self.inner.read();
        inner.entries.get(symbol).map(|e| e.state.read().clone())
    }

    pub fn symbols(&self) -> Vec<String> {
        self.inner.read().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset_all_for_new_session(&self) {
        let inner = self.inner.read();
        for entry in inner.entries.values() {
            entry.state.write().reset_for_new_session();
        }
    }

    pub fn is_stale(&self, symbol: &str, channel: Channel, now: DateTime<Utc>, bound: std::time::Duration) -> bool {
        match self.snapshot(symbol) {
            Some(state) => state.is_stale(channel, now, bound),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn snap(symbol: &str, price: f64) -> QuoteSnapshot {
        QuoteSnapshot {
            symbol: symbol.into(),
            price,
            change_percent: 0.0,
            cum_volume: 100.0,
            cum_trade_value: 1000.0,
            open: price,
            high: price,
            low: price,
            best_bid: price - 0.01,
            best_ask: price + 0.01,
            bid_total: 10.0,
            ask_total: 10.0,
        }
    }

    #[test]
    fn creates_entry_on_first_observation() {
        let store = FeatureStore::new(10);
        assert!(store.snapshot("AAPL").is_none());
        store.apply_rest_snapshot(&snap("AAPL", 100.0), now());
        assert_eq!(store.snapshot("AAPL").unwrap().price, Some(100.0));
    }

    #[test]
    fn evicts_least_recently_touched_when_over_capacity() {
        let store = FeatureStore::new(2);
        store.apply_rest_snapshot(&snap("AAA", 1.0), now());
        store.apply_rest_snapshot(&snap("BBB", 2.0), now());
        store.apply_rest_snapshot(&snap("CCC", 3.0), now());
        assert_eq!(store.len(), 2);
        assert!(store.snapshot("AAA").is_none(), "AAA was least recently touched");
        assert!(store.snapshot("CCC").is_some());
    }

    #[test]
    fn partial_updates_are_tolerated_across_channels() {
        let store = FeatureStore::new(10);
        store.apply_rest_snapshot(&snap("AAPL", 100.0), now());
        store.apply_book_frame(&BookFrame {
            symbol: "AAPL".into(),
            bids10: vec![1.0; 10],
            asks10: vec![1.0; 10],
            bid_total: 50.0,
            ask_total: 40.0,
            timestamp: now(),
        });
        let state = store.snapshot("AAPL").unwrap();
        assert_eq!(state.price, Some(100.0)); // from REST
        assert!(state.bids10.is_some()); // from stream
    }
}
