// =============================================================================
// MACD — Moving Average Convergence / Divergence
// =============================================================================
//
//   macd      = EMA(fast) - EMA(slow)
//   signal    = EMA(signal_period) of macd
//   histogram = macd - signal
// =============================================================================

use super::ema::ema_series;

/// Latest MACD reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the latest MACD(fast, slow, signal) value for `closes`.
///
/// Returns `None` until `slow + signal_period - 1` closes are available.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> Option<Macd> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return None;
    }
    if closes.len() < slow + signal_period - 1 {
        return None;
    }

    let fast_series = ema_series(closes, fast);
    let slow_series = ema_series(closes, slow);
    if slow_series.is_empty() {
        return None;
    }

    // Align the two series on their tails: both end at the final close.
    let offset = fast_series.len() - slow_series.len();
    let macd_line: Vec<f64> = slow_series
        .iter()
        .enumerate()
        .map(|(i, s)| fast_series[i + offset] - s)
        .collect();

    let signal_series = ema_series(&macd_line, signal_period);
    let signal = *signal_series.last()?;
    let macd = *macd_line.last()?;

    Some(Macd {
        macd,
        signal,
        histogram: macd - signal,
    })
}

/// Standard MACD(12, 26, 9).
pub fn macd_standard(closes: &[f64]) -> Option<Macd> {
    macd(closes, 12, 26, 9)
}
