//! Fixed-duration rolling window of (timestamp, price, volume) samples.
//!
//! Grounded on `scrapers::binance_hardened_ingest`'s in-memory trade buffer
//! (a `VecDeque` trimmed by age on every push); generalized here to also
//! carry volume and to expose momentum/volume-acceleration lookups for the
//! feature pipeline.

use std::collections::VecDeque;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub at: DateTime<Utc>,
    pub price: f64,
    pub volume: f64,
}

/// Retains samples covering the most recent `span`. Writes are O(1)
/// amortized (push back, trim front); reads return a borrowed slice view
/// via `iter()` without cloning the buffer.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    span: ChronoDuration,
    samples: VecDeque<Sample>,
}

impl RollingWindow {
    pub fn new(span: std::time::Duration) -> Self {
        Self {
            span: ChronoDuration::from_std(span).expect("span fits chrono::Duration"),
            samples: VecDeque::new(),
        }
    }

    /// Appends a sample and evicts everything older than `span` relative
    /// to it. Invariant: the window stays monotonic in time — callers must
    /// push in non-decreasing `at` order, matching spec §3 ("windows are
    /// monotonic in time").
    pub fn push(&mut self, sample: Sample) {
        if let Some(last) = self.samples.back() {
            debug_assert!(sample.at >= last.at, "rolling window samples must be non-decreasing in time");
        }
        let cutoff = sample.at - self.span;
        self.samples.push_back(sample);
        while let Some(front) = self.samples.front() {
            if front.at < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.back()
    }

    /// First sample at or before `cutoff`, scanning from the oldest end.
    /// Used for momentum (`price N minutes ago`) lookups.
    pub fn sample_at_or_before(&self, cutoff: DateTime<Utc>) -> Option<&Sample> {
        self.samples.iter().rev().find(|s| s.at <= cutoff)
    }

    /// True once the window spans at least `span`, i.e. warm-up elapsed.
    pub fn is_full(&self, required_span: std::time::Duration) -> bool {
        match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) => {
                (last.at - first.at)
                    >= ChronoDuration::from_std(required_span).unwrap_or(ChronoDuration::zero())
            }
            _ => false,
        }
    }

    pub fn volume_since(&self, cutoff: DateTime<Utc>) -> f64 {
        self.samples.iter().filter(|s| s.at >= cutoff).map(|s| s.volume).sum()
    }

    pub fn prices(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.price).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn evicts_samples_older_than_span() {
        let mut w = RollingWindow::new(std::time::Duration::from_secs(300));
        w.push(Sample { at: at(0), price: 1.0, volume: 10.0 });
        w.push(Sample { at: at(100), price: 2.0, volume: 10.0 });
        w.push(Sample { at: at(400), price: 3.0, volume: 10.0 });
        // at(0) is now 400s behind the latest sample, older than the 300s span.
        assert_eq!(w.len(), 2);
        assert_eq!(w.iter().next().unwrap().price, 2.0);
    }

    #[test]
    fn is_full_requires_full_span_coverage() {
        let mut w = RollingWindow::new(std::time::Duration::from_secs(300));
        w.push(Sample { at: at(0), price: 1.0, volume: 1.0 });
        assert!(!w.is_full(std::time::Duration::from_secs(300)));
        w.push(Sample { at: at(300), price: 2.0, volume: 1.0 });
        assert!(w.is_full(std::time::Duration::from_secs(300)));
    }

    #[test]
    fn sample_at_or_before_finds_nearest_prior() {
        let mut w = RollingWindow::new(std::time::Duration::from_secs(600));
        w.push(Sample { at: at(0), price: 1.0, volume: 1.0 });
        w.push(Sample { at: at(60), price: 2.0, volume: 1.0 });
        w.push(Sample { at: at(120), price: 3.0, volume: 1.0 });
        let found = w.sample_at_or_before(at(90)).unwrap();
        assert_eq!(found.price, 2.0);
    }
}
