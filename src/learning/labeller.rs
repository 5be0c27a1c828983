//! Forward look-ahead labelling.
//!
//! Runs after session close once the look-ahead window has elapsed for a
//! given record, per spec §4.9's exact algorithm. Records whose window
//! extends beyond available data are deferred to the next run rather than
//! labelled on a truncated window.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::history::HistoricalRecord;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabellerConfig {
    pub lookahead: std::time::Duration,
    pub theta: f64,
}

impl Default for LabellerConfig {
    fn default() -> Self {
        Self {
            lookahead: std::time::Duration::from_secs(60 * 60),
            theta: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelRecord {
    pub timestamp: DateTime<Utc>,
    pub ticker: String,
    pub label: u8,
    pub realised_peak_return: f64,
}

/// A historical record together with every later same-ticker price point
/// available in storage, in ascending time order. The caller (the
/// Trainer's data access layer) is responsible for assembling this view;
/// the Labeller itself performs no I/O.
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

/// Labels every record in `records` whose look-ahead window has fully
/// elapsed against `series` (that ticker's subsequent prices, ascending).
/// Records still inside their window are returned in `deferred` for the
/// next run.
pub fn label_records<'a>(
    records: &'a [HistoricalRecord],
    series_for: impl Fn(&str) -> &'a [PricePoint],
    config: &LabellerConfig,
    now: DateTime<Utc>,
) -> (Vec<LabelRecord>, Vec<&'a HistoricalRecord>) {
    let window = ChronoDuration::from_std(config.lookahead).expect("lookahead fits chrono::Duration");
    let mut labelled = Vec::with_capacity(records.len());
    let mut deferred = Vec::new();

    for record in records {
        let window_end = record.timestamp + window;
        if window_end > now {
            deferred.push(record);
            continue;
        }

        let series = series_for(&record.ticker);
        let peak = series
            .iter()
            .filter(|p| p.timestamp > record.timestamp && p.timestamp <= window_end)
            .map(|p| p.price)
            .fold(f64::NEG_INFINITY, f64::max);

        let entry_price = record.price;
        if entry_price == 0.0 || !peak.is_finite() {
            deferred.push(record);
            continue;
        }

        let realised_peak_return = peak / entry_price - 1.0;
        let label = if realised_peak_return >= config.theta { 1 } else { 0 };

        labelled.push(LabelRecord {
            timestamp: record.timestamp,
            ticker: record.ticker.clone(),
            label,
            realised_peak_return,
        });
    }

    (labelled, deferred)
}

#[path = "labeller_tests.rs"]
#[cfg(test)]
mod labeller_tests;
