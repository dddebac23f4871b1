// =============================================================================
// Commodity Channel Index (CCI)
// =============================================================================
//
//   TP  = (high + low + close) / 3
//   CCI = (TP - SMA(TP)) / (0.015 * mean_deviation)
// =============================================================================

/// Compute the latest CCI(period). Unbounded but typically within ±300.
pub fn cci(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
    let n = closes.len();
    if period == 0 || n < period || n != highs.len() || n != lows.len() {
        return None;
    }

    let typical: Vec<f64> = (n - period..n)
        .map(|i| (highs[i] + lows[i] + closes[i]) / 3.0)
        .collect();

    let mean: f64 = typical.iter().sum::<f64>() / period as f64;
    let mean_dev: f64 = typical.iter().map(|tp| (tp - mean).abs()).sum::<f64>() / period as f64;

    if mean_dev <= f64::EPSILON {
        return Some(0.0); // flat window — no deviation to measure
    }

    let last_tp = *typical.last()?;
    let value = (last_tp - mean) / (0.015 * mean_dev);
    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_is_none() {
        let v = vec![1.0; 10];
        assert!(cci(&v, &v, &v, 20).is_none());
    }

    #[test]
    fn flat_window_is_zero() {
        let v = vec![100.0; 25];
        assert_eq!(cci(&v, &v, &v, 20), Some(0.0));
    }

    #[test]
    fn rising_prices_positive() {
        let closes: Vec<f64> = (1..=30).map(f64::from).collect();
        let highs: Vec<f64> = closes.iter().map(|c| c + 0.5).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.5).collect();
        let v = cci(&highs, &lows, &closes, 20).unwrap();
        assert!(v > 0.0);
    }

    #[test]
    fn falling_prices_negative() {
        let closes: Vec<f64> = (1..=30).rev().map(f64::from).collect();
        let highs: Vec<f64> = closes.iter().map(|c| c + 0.5).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.5).collect();
        let v = cci(&highs, &lows, &closes, 20).unwrap();
        assert!(v < 0.0);
    }
}
