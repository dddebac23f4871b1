// =============================================================================
// Stochastic Oscillator (%K / %D)
// =============================================================================
//
//   raw %K = 100 * (close - lowest_low) / (highest_high - lowest_low)
//   %K     = SMA(k_smooth) of raw %K
//   %D     = SMA(d_period) of %K
//
// A window where highest == lowest (no range) yields the neutral midpoint.
// =============================================================================

/// Latest stochastic reading. Both values lie in [0, 100].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stochastic {
    pub k: f64,
    pub d: f64,
}

/// Compute Stochastic(k_period, k_smooth, d_period) for the given window.
pub fn stochastic(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    k_period: usize,
    k_smooth: usize,
    d_period: usize,
) -> Option<Stochastic> {
    let n = closes.len();
    if k_period == 0 || k_smooth == 0 || d_period == 0 {
        return None;
    }
    if n != highs.len() || n != lows.len() {
        return None;
    }
    // Need enough closes for raw %K plus both smoothing passes.
    let needed = k_period + k_smooth + d_period - 2;
    if n < needed {
        return None;
    }

    let raw_k: Vec<f64> = (k_period - 1..n)
        .map(|i| {
            let lo = lows[i + 1 - k_period..=i]
                .iter()
                .cloned()
                .fold(f64::INFINITY, f64::min);
            let hi = highs[i + 1 - k_period..=i]
                .iter()
                .cloned()
                .fold(f64::NEG_INFINITY, f64::max);
            if hi - lo <= f64::EPSILON {
                50.0 // no range — neutral
            } else {
                ((closes[i] - lo) / (hi - lo) * 100.0).clamp(0.0, 100.0)
            }
        })
        .collect();

    let smoothed_k = sma_series(&raw_k, k_smooth);
    let d_series = sma_series(&smoothed_k, d_period);

    let k = *smoothed_k.last()?;
    let d = *d_series.last()?;
    (k.is_finite() && d.is_finite()).then_some(Stochastic { k, d })
}

/// Standard Stochastic(14, 3, 3).
pub fn stochastic_standard(highs: &[f64], lows: &[f64], closes: &[f64]) -> Option<Stochastic> {
    stochastic(highs, lows, closes, 14, 3, 3)
}

fn sma_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    values
        .windows(period)
        .map(|w| w.iter().sum::<f64>() / period as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_short_is_none() {
        let v = vec![1.0; 10];
        assert!(stochastic_standard(&v, &v, &v).is_none());
    }

    #[test]
    fn close_at_high_saturates() {
        // Closes always at the top of the range -> %K pinned at 100.
        let n = 30;
        let highs: Vec<f64> = (1..=n).map(|i| i as f64 + 1.0).collect();
        let lows: Vec<f64> = (1..=n).map(|i| i as f64 - 1.0).collect();
        let closes: Vec<f64> = (1..=n).map(|i| i as f64 + 1.0).collect();
        let s = stochastic_standard(&highs, &lows, &closes).unwrap();
        assert!(s.k > 95.0);
        assert!((0.0..=100.0).contains(&s.d));
    }

    #[test]
    fn flat_market_is_midpoint() {
        let v = vec![50.0; 30];
        let s = stochastic_standard(&v, &v, &v).unwrap();
        assert!((s.k - 50.0).abs() < 1e-10);
        assert!((s.d - 50.0).abs() < 1e-10);
    }

    #[test]
    fn bounded() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + (i as f64).sin() * 3.0).collect();
        let highs: Vec<f64> = closes.iter().map(|c| c + 1.0).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 1.0).collect();
        let s = stochastic_standard(&highs, &lows, &closes).unwrap();
        assert!((0.0..=100.0).contains(&s.k));
        assert!((0.0..=100.0).contains(&s.d));
    }
}
