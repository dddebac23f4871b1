// =============================================================================
// Average True Range (ATR) — Wilder smoothing over true range
// =============================================================================
//
//   TR  = max(high - low, |high - prev_close|, |low - prev_close|)
//   ATR = (prev_ATR * (period - 1) + TR) / period, seeded with SMA of TR
// =============================================================================

/// Compute the full ATR series. Inputs must have equal length; the first bar
/// has no previous close, so `len - 1` true ranges feed the smoothing.
pub fn atr_series(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let n = highs.len();
    if period == 0 || n != lows.len() || n != closes.len() || n < period + 1 {
        return Vec::new();
    }

    let true_ranges: Vec<f64> = (1..n)
        .map(|i| {
            let hl = highs[i] - lows[i];
            let hc = (highs[i] - closes[i - 1]).abs();
            let lc = (lows[i] - closes[i - 1]).abs();
            hl.max(hc).max(lc)
        })
        .collect();

    let seed: f64 = true_ranges[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(true_ranges.len() - period + 1);
    out.push(seed);

    let period_f = period as f64;
    let mut prev = seed;
    for &tr in &true_ranges[period..] {
        let next = (prev * (period_f - 1.0) + tr) / period_f;
        if !next.is_finite() {
            break;
        }
        out.push(next);
        prev = next;
    }
    out
}

/// Latest ATR value, or `None` before warmup completes.
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
    atr_series(highs, lows, closes, period).last().copied()
}

/// Percentile rank of the latest ATR within its own series, in [0, 100].
/// Used as the volatility-context input to scoring and cadence adaptation.
pub fn atr_percentile(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
    let series = atr_series(highs, lows, closes, period);
    let last = *series.last()?;
    if series.len() < 2 {
        return Some(50.0);
    }
    let below = series.iter().filter(|&&v| v < last).count();
    Some(below as f64 / (series.len() - 1) as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(n: usize, spread: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let closes = vec![100.0; n];
        let highs = vec![100.0 + spread; n];
        let lows = vec![100.0 - spread; n];
        (highs, lows, closes)
    }

    #[test]
    fn insufficient_data() {
        let (h, l, c) = flat(10, 1.0);
        assert!(atr(&h, &l, &c, 14).is_none());
    }

    #[test]
    fn mismatched_lengths() {
        assert!(atr(&[1.0, 2.0], &[1.0], &[1.0, 2.0], 1).is_none());
    }

    #[test]
    fn constant_range_atr_equals_range() {
        let (h, l, c) = flat(40, 0.5);
        let v = atr(&h, &l, &c, 14).unwrap();
        assert!((v - 1.0).abs() < 1e-10); // high-low spread = 1.0 everywhere
    }

    #[test]
    fn gap_widens_true_range() {
        // A large gap between prev close and next low dominates high-low.
        let closes = vec![100.0, 100.0, 120.0, 120.0];
        let highs = vec![101.0, 101.0, 121.0, 121.0];
        let lows = vec![99.0, 99.0, 119.0, 119.0];
        let series = atr_series(&highs, &lows, &closes, 2);
        // TR values: [2, 21, 2] -> seed (2+21)/2 = 11.5, then (11.5+2)/2 = 6.75
        assert_eq!(series.len(), 2);
        assert!((series[0] - 11.5).abs() < 1e-10);
        assert!((series[1] - 6.75).abs() < 1e-10);
    }

    #[test]
    fn percentile_bounds() {
        let (h, l, c) = flat(60, 0.5);
        let p = atr_percentile(&h, &l, &c, 14).unwrap();
        assert!((0.0..=100.0).contains(&p));
    }
}
