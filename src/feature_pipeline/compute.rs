//! Pure feature computation: `compute(ticker_state, calendar_context) ->
//! feature_vector`, per spec §4.5. No I/O, no locks held beyond what the
//! caller already acquired to produce the `TickerState` snapshot.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::feature_store::{Channel, TickerState};

use super::indicators::{bollinger_percent_b, distance_to_ma, macd_histogram, rsi};

pub const SCHEMA_VERSION: u32 = 2;

const MOMENTUM_WINDOW: std::time::Duration = std::time::Duration::from_secs(300);
const VOLUME_WINDOW: std::time::Duration = std::time::Duration::from_secs(300);
const RSI_PERIOD: usize = 14;
const BOLLINGER_PERIOD: usize = 20;
const BOLLINGER_K: f64 = 2.0;
const MA_PERIOD: usize = 20;

/// Session/time context a pure feature computation may need beyond the
/// ticker's own state (e.g. for calendar-aware features, or the staleness
/// bound past which a stale input is masked per spec §4.4/§7). Extend
/// here rather than reaching back into wall-clock time or config from
/// within `compute`.
#[derive(Debug, Clone, Copy)]
pub struct CalendarContext {
    pub now: DateTime<Utc>,
    pub staleness_bound: std::time::Duration,
}

/// A value that is either a finite number or explicitly masked. Masked
/// values carry a `0.0` sentinel so the record stays fixed-width and
/// serializable without `Option`, per spec §3's "missing becomes a
/// sentinel value with an accompanying mask bit."
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Masked {
    pub value: f64,
    pub masked: bool,
}

impl Masked {
    pub fn some(value: f64) -> Self {
        if value.is_finite() {
            Self { value, masked: false }
        } else {
            Self { value: 0.0, masked: true }
        }
    }

    pub fn none() -> Self {
        Self { value: 0.0, masked: true }
    }

    fn from_option(v: Option<f64>) -> Self {
        match v {
            Some(x) => Masked::some(x),
            None => Masked::none(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub schema_version: u32,
    pub ticker: String,
    pub timestamp: DateTime<Utc>,
    pub ofi: Masked,
    pub trade_intensity: Masked,
    pub volume_ratio: Masked,
    pub momentum_5m: Masked,
    pub rsi14: Masked,
    pub macd_histogram: Masked,
    pub bollinger_percent_b: Masked,
    pub distance_to_ma20: Masked,
    pub volume_acceleration: Masked,
}

impl FeatureVector {
    /// Stable field ordering for training/inference, per spec §3. Must
    /// stay in sync with `inference::engine::FEATURE_NAMES`.
    pub fn as_ordered_values(&self) -> [f64; 9] {
        [
            self.ofi.value,
            self.trade_intensity.value,
            self.volume_ratio.value,
            self.momentum_5m.value,
            self.rsi14.value,
            self.macd_histogram.value,
            self.bollinger_percent_b.value,
            self.distance_to_ma20.value,
            self.volume_acceleration.value,
        ]
    }
}

pub fn compute(state: &TickerState, ctx: &CalendarContext) -> FeatureVector {
    let prices = state.window.prices();

    let momentum_5m = if state.window.is_full(MOMENTUM_WINDOW) {
        let cutoff = ctx.now - ChronoDuration::from_std(MOMENTUM_WINDOW).unwrap();
        state
            .window
            .sample_at_or_before(cutoff)
            .zip(state.price)
            .and_then(|(past, current)| {
                if past.price != 0.0 {
                    Some(current / past.price - 1.0)
                } else {
                    None
                }
            })
    } else {
        None
    };

    let volume_ratio = match state.session.avg_volume_5session {
        Some(baseline) if baseline != 0.0 => state.cum_volume.map(|v| (v / baseline).max(0.0)),
        _ => None,
    };

    let volume_acceleration = volume_acceleration(state, ctx.now);

    // Per spec §4.4/§7: an input not refreshed within the staleness bound
    // is masked even when a value is technically still held, not just
    // when it's absent. Several inputs can be refreshed by more than one
    // channel (book totals via REST or the book stream, price/volume via
    // REST or the trade stream), so the freshest of the contributing
    // channels governs masking.
    let gate = |m: Masked, channels: &[Channel]| -> Masked {
        if m.masked || state.is_stale_all(channels, ctx.now, ctx.staleness_bound) {
            Masked::none()
        } else {
            m
        }
    };
    const BOOK_CHANNELS: [Channel; 2] = [Channel::Rest, Channel::StreamBook];
    const PRICE_CHANNELS: [Channel; 2] = [Channel::Rest, Channel::StreamTrade];
    const TRADE_ONLY_CHANNELS: [Channel; 1] = [Channel::StreamTrade];

    FeatureVector {
        schema_version: SCHEMA_VERSION,
        ticker: state.symbol.clone(),
        timestamp: ctx.now,
        ofi: gate(Masked::from_option(state.order_flow_imbalance()), &BOOK_CHANNELS),
        trade_intensity: gate(Masked::from_option(state.trade_intensity), &TRADE_ONLY_CHANNELS),
        volume_ratio: gate(Masked::from_option(volume_ratio), &PRICE_CHANNELS),
        momentum_5m: gate(Masked::from_option(momentum_5m), &PRICE_CHANNELS),
        rsi14: gate(Masked::from_option(rsi(&prices, RSI_PERIOD)), &PRICE_CHANNELS),
        macd_histogram: gate(Masked::from_option(macd_histogram(&prices)), &PRICE_CHANNELS),
        bollinger_percent_b: gate(
            Masked::from_option(bollinger_percent_b(&prices, BOLLINGER_PERIOD, BOLLINGER_K)),
            &PRICE_CHANNELS,
        ),
        distance_to_ma20: gate(Masked::from_option(distance_to_ma(&prices, MA_PERIOD)), &PRICE_CHANNELS),
        volume_acceleration: gate(Masked::from_option(volume_acceleration), &PRICE_CHANNELS),
    }
}

/// The ticker-state window only retains the most recent five minutes
/// (spec §3), so "last five minutes vs prior five minutes" is computed by
/// splitting that single window at its midpoint rather than retaining a
/// second window — see DESIGN.md's Open Question resolution.
fn volume_acceleration(state: &TickerState, now: DateTime<Utc>) -> Option<f64> {
    if !state.window.is_full(VOLUME_WINDOW) {
        return None;
    }
    let half = ChronoDuration::from_std(VOLUME_WINDOW / 2).unwrap();
    let midpoint = now - half;
    let recent = state.window.volume_since(midpoint);
    let prior = state
        .window
        .iter()
        .filter(|s| s.at < midpoint)
        .map(|s| s.volume)
        .sum::<f64>();
    if prior == 0.0 {
        None
    } else {
        Some(recent / prior)
    }
}
