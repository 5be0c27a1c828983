use super::*;
use crate::feature_pipeline::{FeatureVector, Masked};
use chrono::TimeZone;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn historical(ticker: &str, secs: i64, price: f64) -> HistoricalRecord {
    HistoricalRecord {
        timestamp: at(secs),
        ticker: ticker.to_string(),
        price,
        feature_vector: FeatureVector {
            schema_version: 1,
            ticker: ticker.to_string(),
            timestamp: at(secs),
            ofi: Masked::none(),
            trade_intensity: Masked::none(),
            volume_ratio: Masked::none(),
            momentum_5m: Masked::none(),
            rsi14: Masked::none(),
            macd_histogram: Masked::none(),
            bollinger_percent_b: Masked::none(),
            distance_to_ma20: Masked::none(),
            volume_acceleration: Masked::none(),
        },
    }
}

fn price_series(points: &[(i64, f64)]) -> Vec<PricePoint> {
    points.iter().map(|&(s, p)| PricePoint { timestamp: at(s), price: p }).collect()
}

#[test]
fn labels_positive_when_forward_peak_clears_theta() {
    let records = vec![historical("AAPL", 0, 100.0)];
    let series = price_series(&[(0, 100.0), (1800, 106.0), (3600, 102.0)]);
    let config = LabellerConfig { lookahead: std::time::Duration::from_secs(3600), theta: 0.05 };
    let now = at(3600);

    let (labelled, deferred) = label_records(&records, |_| &series, &config, now);
    assert!(deferred.is_empty());
    assert_eq!(labelled.len(), 1);
    assert_eq!(labelled[0].label, 1);
    assert!((labelled[0].realised_peak_return - 0.06).abs() < 1e-9);
}

#[test]
fn labels_negative_when_forward_peak_misses_theta() {
    let records = vec![historical("AAPL", 0, 100.0)];
    let series = price_series(&[(0, 100.0), (1800, 102.0), (3600, 101.0)]);
    let config = LabellerConfig::default();
    let now = at(3600);

    let (labelled, _deferred) = label_records(&records, |_| &series, &config, now);
    assert_eq!(labelled[0].label, 0);
}

#[test]
fn defers_records_whose_window_has_not_elapsed() {
    let records = vec![historical("AAPL", 3000, 100.0)];
    let series = price_series(&[(3000, 100.0)]);
    let config = LabellerConfig { lookahead: std::time::Duration::from_secs(3600), theta: 0.05 };
    let now = at(3600); // window_end = 3000+3600 = 6600, which is > now

    let (labelled, deferred) = label_records(&records, |_| &series, &config, now);
    assert!(labelled.is_empty());
    assert_eq!(deferred.len(), 1);
}

#[test]
fn exact_theta_boundary_is_inclusive() {
    let records = vec![historical("AAPL", 0, 100.0)];
    let series = price_series(&[(0, 100.0), (1800, 105.0)]); // exactly +5%
    let config = LabellerConfig { lookahead: std::time::Duration::from_secs(3600), theta: 0.05 };
    let now = at(3600);

    let (labelled, _) = label_records(&records, |_| &series, &config, now);
    assert_eq!(labelled[0].label, 1);
}
