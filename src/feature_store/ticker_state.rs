//! Per-symbol mutable state, the unit the Feature Store locks and the
//! Feature Pipeline reads a consistent snapshot of.
//!
//! Grounded on spec §3's Ticker State data model; the apply methods follow
//! the same "single apply function per update source" shape as
//! `scrapers::binance_session::SessionManager::apply_event`.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::broker::rest::QuoteSnapshot;
use crate::broker::stream::{BookFrame, TradeFrame};

use super::rolling_window::{RollingWindow, Sample};

const WINDOW_SPAN: std::time::Duration = std::time::Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Rest,
    StreamTrade,
    StreamBook,
}

/// Prior-session metadata, pre-loaded at warm-up and refreshed overnight.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionMetadata {
    pub previous_close: Option<f64>,
    pub avg_volume_5session: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TickerState {
    pub symbol: String,
    pub price: Option<f64>,
    pub change_percent: Option<f64>,
    pub cum_volume: Option<f64>,
    pub bid_total: Option<f64>,
    pub ask_total: Option<f64>,
    // Invariant: both present or both absent (spec §3).
    pub bids10: Option<Vec<f64>>,
    pub asks10: Option<Vec<f64>>,
    pub trade_intensity: Option<f64>,
    pub buy_ratio: Option<f64>,
    pub rest_updated_at: Option<DateTime<Utc>>,
    pub stream_trade_updated_at: Option<DateTime<Utc>>,
    pub stream_book_updated_at: Option<DateTime<Utc>>,
    pub window: RollingWindow,
    pub session: SessionMetadata,
}

impl TickerState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            price: None,
            change_percent: None,
            cum_volume: None,
            bid_total: None,
            ask_total: None,
            bids10: None,
            asks10: None,
            trade_intensity: None,
            buy_ratio: None,
            rest_updated_at: None,
            stream_trade_updated_at: None,
            stream_book_updated_at: None,
            window: RollingWindow::new(WINDOW_SPAN),
            session: SessionMetadata::default(),
        }
    }

    pub fn preload_session_metadata(&mut self, previous_close: f64, avg_volume_5session: f64) {
        self.session = SessionMetadata {
            previous_close: finite_or_none(previous_close),
            avg_volume_5session: finite_or_none(avg_volume_5session),
        };
    }

    /// REST snapshots set price/volume/depth totals, never the 10-level
    /// depth vectors (the stream is the only source for those).
    pub fn apply_rest_snapshot(&mut self, snapshot: &QuoteSnapshot, now: DateTime<Utc>) {
        self.price = finite_or_none(snapshot.price);
        self.change_percent = finite_or_none(snapshot.change_percent);
        self.set_cum_volume(snapshot.cum_volume);
        self.bid_total = finite_or_none(snapshot.bid_total);
        self.ask_total = finite_or_none(snapshot.ask_total);
        self.rest_updated_at = Some(now);

        if let Some(price) = self.price {
            self.window.push(Sample {
                at: now,
                price,
                volume: snapshot.cum_volume,
            });
        }
    }

    pub fn apply_trade_frame(&mut self, frame: &TradeFrame) {
        self.price = finite_or_none(frame.price);
        self.set_cum_volume(frame.cum_volume);
        self.trade_intensity = finite_or_none(frame.trade_intensity);
        self.buy_ratio = finite_or_none(frame.buy_ratio);
        self.stream_trade_updated_at = Some(frame.timestamp);

        if let Some(price) = self.price {
            self.window.push(Sample {
                at: frame.timestamp,
                price,
                volume: frame.cum_volume,
            });
        }
    }

    pub fn apply_book_frame(&mut self, frame: &BookFrame) {
        if frame.bids10.len() == 10 && frame.asks10.len() == 10 {
            self.bids10 = Some(frame.bids10.clone());
            self.asks10 = Some(frame.asks10.clone());
        } else {
            warn!(symbol = %self.symbol, "book_frame_depth_not_10_discarding_vectors");
            self.bids10 = None;
            self.asks10 = None;
        }
        self.bid_total = finite_or_none(frame.bid_total);
        self.ask_total = finite_or_none(frame.ask_total);
        self.stream_book_updated_at = Some(frame.timestamp);
    }

    /// Cumulative volume is non-decreasing within a session (spec §3);
    /// a smaller value is treated as a stale/out-of-order update and
    /// discarded rather than regressing the scalar.
    fn set_cum_volume(&mut self, candidate: f64) {
        let candidate = match finite_or_none(candidate) {
            Some(v) => v,
            None => return,
        };
        match self.cum_volume {
            Some(current) if candidate < current => {
                warn!(symbol = %self.symbol, current, candidate, "cum_volume_regression_discarded");
            }
            _ => self.cum_volume = Some(candidate),
        }
    }

    /// Resets session-scoped state at session open; prior-session metadata
    /// is retained.
    pub fn reset_for_new_session(&mut self) {
        let session = self.session;
        let symbol = self.symbol.clone();
        *self = TickerState::new(symbol);
        self.session = session;
    }

    pub fn last_update(&self, channel: Channel) -> Option<DateTime<Utc>> {
        match channel {
            Channel::Rest => self.rest_updated_at,
            Channel::StreamTrade => self.stream_trade_updated_at,
            Channel::StreamBook => self.stream_book_updated_at,
        }
    }

    pub fn is_stale(&self, channel: Channel, now: DateTime<Utc>, bound: std::time::Duration) -> bool {
        match self.last_update(channel) {
            None => true,
            Some(t) => {
                let bound = chrono::Duration::from_std(bound).unwrap_or(chrono::Duration::zero());
                now - t > bound
            }
        }
    }

    /// True only when every channel able to refresh this input is stale
    /// (or never updated) — some inputs (book depth totals, cumulative
    /// volume) can be refreshed by more than one channel, so the freshest
    /// of them governs whether the derived feature is masked.
    pub fn is_stale_all(&self, channels: &[Channel], now: DateTime<Utc>, bound: std::time::Duration) -> bool {
        channels.iter().all(|&c| self.is_stale(c, now, bound))
    }

    pub fn order_flow_imbalance(&self) -> Option<f64> {
        match (self.bid_total, self.ask_total) {
            (Some(b), Some(a)) if (b + a) != 0.0 => finite_or_none((b - a) / (b + a)),
            _ => None,
        }
    }
}

pub(crate) fn finite_or_none(v: f64) -> Option<f64> {
    if v.is_finite() {
        Some(v)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn rest_snapshot_populates_scalars_and_window() {
        let mut state = TickerState::new("AAPL");
        let snap = QuoteSnapshot {
            symbol: "AAPL".into(),
            price: 100.0,
            change_percent: 1.5,
            cum_volume: 1000.0,
            cum_trade_value: 100_000.0,
            open: 98.0,
            high: 101.0,
            low: 97.0,
            best_bid: 99.9,
            best_ask: 100.1,
            bid_total: 500.0,
            ask_total: 300.0,
        };
        state.apply_rest_snapshot(&snap, now());
        assert_eq!(state.price, Some(100.0));
        assert_eq!(state.window.len(), 1);
        assert!(state.order_flow_imbalance().unwrap() > 0.0);
    }

    #[test]
    fn cum_volume_never_regresses() {
        let mut state = TickerState::new("AAPL");
        state.set_cum_volume(1000.0);
        state.set_cum_volume(500.0); // stale/out-of-order, discarded
        assert_eq!(state.cum_volume, Some(1000.0));
        state.set_cum_volume(1200.0);
        assert_eq!(state.cum_volume, Some(1200.0));
    }

    #[test]
    fn nan_inputs_become_masked_not_propagated() {
        let mut state = TickerState::new("AAPL");
        state.apply_trade_frame(&TradeFrame {
            symbol: "AAPL".into(),
            price: f64::NAN,
            cum_volume: 100.0,
            trade_intensity: f64::INFINITY,
            buy_ratio: 0.6,
            timestamp: now(),
        });
        assert_eq!(state.price, None);
        assert_eq!(state.trade_intensity, None);
        assert_eq!(state.buy_ratio, Some(0.6));
    }

    #[test]
    fn malformed_book_depth_discards_vectors_rather_than_truncating() {
        let mut state = TickerState::new("AAPL");
        state.apply_book_frame(&BookFrame {
            symbol: "AAPL".into(),
            bids10: vec![1.0; 9],
            asks10: vec![1.0; 10],
            bid_total: 10.0,
            ask_total: 5.0,
            timestamp: now(),
        });
        assert!(state.bids10.is_none());
        assert!(state.asks10.is_none());
    }

    #[test]
    fn staleness_uses_the_relevant_channel_timestamp() {
        let mut state = TickerState::new("AAPL");
        assert!(state.is_stale(Channel::Rest, now(), std::time::Duration::from_secs(5)));
        state.rest_updated_at = Some(now());
        assert!(!state.is_stale(Channel::Rest, now(), std::time::Duration::from_secs(5)));
        let later = now() + chrono::Duration::seconds(10);
        assert!(state.is_stale(Channel::Rest, later, std::time::Duration::from_secs(5)));
    }
}
