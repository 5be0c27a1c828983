//! Standard intraday technical indicators over a price series.
//!
//! No teacher module computes these; the small-pure-function-per-signal
//! layout follows `signals::detector`'s style even though the formulas
//! themselves are textbook.

/// Wilder's RSI over the last `period + 1` prices. `None` until warmed up.
pub fn rsi(prices: &[f64], period: usize) -> Option<f64> {
    if prices.len() < period + 1 {
        return None;
    }
    let window = &prices[prices.len() - period - 1..];
    let mut gain_sum = 0.0;
    let mut loss_sum = 0.0;
    for pair in window.windows(2) {
        let change = pair[1] - pair[0];
        if change > 0.0 {
            gain_sum += change;
        } else {
            loss_sum += -change;
        }
    }
    let avg_gain = gain_sum / period as f64;
    let avg_loss = loss_sum / period as f64;
    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

fn ema_series(prices: &[f64], period: usize) -> Vec<f64> {
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(prices.len());
    let mut prev = prices[0];
    out.push(prev);
    for &p in &prices[1..] {
        prev = alpha * p + (1.0 - alpha) * prev;
        out.push(prev);
    }
    out
}

/// MACD histogram: (EMA12 - EMA26) minus its own EMA9 signal line.
/// `None` until there are enough samples to seed the slow EMA.
pub fn macd_histogram(prices: &[f64]) -> Option<f64> {
    const FAST: usize = 12;
    const SLOW: usize = 26;
    const SIGNAL: usize = 9;
    if prices.len() < SLOW + SIGNAL {
        return None;
    }
    let fast = ema_series(prices, FAST);
    let slow = ema_series(prices, SLOW);
    let macd_line: Vec<f64> = fast.iter().zip(slow.iter()).map(|(f, s)| f - s).collect();
    let signal_line = ema_series(&macd_line, SIGNAL);
    let macd = *macd_line.last().unwrap();
    let signal = *signal_line.last().unwrap();
    Some(macd - signal)
}

/// Bollinger %B: (price - lower band) / (upper - lower), over `period`
/// samples and `k` standard deviations. `None` until warmed up or the
/// band has zero width.
pub fn bollinger_percent_b(prices: &[f64], period: usize, k: f64) -> Option<f64> {
    if prices.len() < period {
        return None;
    }
    let window = &prices[prices.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / period as f64;
    let stddev = variance.sqrt();
    let upper = mean + k * stddev;
    let lower = mean - k * stddev;
    let width = upper - lower;
    if width == 0.0 {
        return None;
    }
    let price = *prices.last().unwrap();
    Some((price - lower) / width)
}

/// Distance of the latest price from its `period`-length simple moving
/// average, expressed as a fraction of the MA.
pub fn distance_to_ma(prices: &[f64], period: usize) -> Option<f64> {
    if prices.len() < period {
        return None;
    }
    let window = &prices[prices.len() - period..];
    let ma = window.iter().sum::<f64>() / period as f64;
    if ma == 0.0 {
        return None;
    }
    let price = *prices.last().unwrap();
    Some((price - ma) / ma)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_is_100_when_all_gains() {
        let prices: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let value = rsi(&prices, 14).unwrap();
        assert!((value - 100.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_masked_before_warmup() {
        let prices = vec![100.0, 101.0, 102.0];
        assert_eq!(rsi(&prices, 14), None);
    }

    #[test]
    fn bollinger_percent_b_is_half_at_the_mean() {
        let prices = vec![100.0; 20];
        // Zero variance -> zero-width band -> masked, not a divide-by-zero.
        assert_eq!(bollinger_percent_b(&prices, 20, 2.0), None);
    }

    #[test]
    fn distance_to_ma_is_zero_when_flat() {
        let prices = vec![50.0; 20];
        let d = distance_to_ma(&prices, 20).unwrap();
        assert!(d.abs() < 1e-9);
    }

    #[test]
    fn macd_histogram_masked_until_slow_window_plus_signal() {
        let prices: Vec<f64> = (0..30).map(|i| 100.0 + i as f64 * 0.1).collect();
        assert_eq!(macd_histogram(&prices), None);
        let prices: Vec<f64> = (0..40).map(|i| 100.0 + i as f64 * 0.1).collect();
        assert!(macd_histogram(&prices).is_some());
    }
}
