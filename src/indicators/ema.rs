// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Recursive EMA seeded with the SMA of the first `period` closes:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// No value is emitted before the warmup window is complete.
// =============================================================================

/// Compute the EMA series for `closes` with look-back `period`.
///
/// Returns an empty `Vec` when the input is shorter than the warmup window or
/// the period is zero. Output element `i` corresponds to close `period-1+i`.
pub fn ema_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);

    let seed: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(closes.len() - period + 1);
    out.push(seed);

    let mut prev = seed;
    for &close in &closes[period..] {
        let next = close * multiplier + prev * (1.0 - multiplier);
        if !next.is_finite() {
            // Broken input — stop rather than emit garbage downstream.
            break;
        }
        out.push(next);
        prev = next;
    }
    out
}

/// Latest EMA value, or `None` before warmup completes.
pub fn ema(closes: &[f64], period: usize) -> Option<f64> {
    ema_series(closes, period).last().copied()
}

/// Alignment of the 20/50/200 EMA stack.
///
/// `Some((bullish, spread))` when the stack is strictly ordered in either
/// direction; `spread = |ema20 - ema200| / ema200` measures separation.
pub fn ema_stack_alignment(closes: &[f64]) -> Option<(bool, f64)> {
    let e20 = ema(closes, 20)?;
    let e50 = ema(closes, 50)?;
    let e200 = ema(closes, 200)?;

    let bullish = e20 > e50 && e50 > e200;
    let bearish = e20 < e50 && e50 < e200;
    if !bullish && !bearish {
        return None;
    }
    if e200 == 0.0 {
        return None;
    }
    let spread = (e20 - e200).abs() / e200;
    spread.is_finite().then_some((bullish, spread))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_short_inputs() {
        assert!(ema_series(&[], 5).is_empty());
        assert!(ema_series(&[1.0, 2.0], 5).is_empty());
        assert!(ema_series(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn seed_is_sma() {
        let series = ema_series(&[2.0, 4.0, 6.0], 3);
        assert_eq!(series.len(), 1);
        assert!((series[0] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn recursive_values_match_formula() {
        let closes: Vec<f64> = (1..=10).map(f64::from).collect();
        let series = ema_series(&closes, 5);
        assert_eq!(series.len(), 6);

        let mult = 2.0 / 6.0;
        let mut expected = 3.0;
        for (i, &c) in closes[5..].iter().enumerate() {
            expected = c * mult + expected * (1.0 - mult);
            assert!((series[i + 1] - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn stack_alignment_rising_series() {
        let closes: Vec<f64> = (1..=400).map(f64::from).collect();
        let (bullish, spread) = ema_stack_alignment(&closes).unwrap();
        assert!(bullish);
        assert!(spread > 0.0);
    }

    #[test]
    fn stack_alignment_falling_series() {
        let closes: Vec<f64> = (1..=400).rev().map(f64::from).collect();
        let (bullish, _) = ema_stack_alignment(&closes).unwrap();
        assert!(!bullish);
    }

    #[test]
    fn stack_alignment_flat_is_none() {
        let closes = vec![100.0; 400];
        assert!(ema_stack_alignment(&closes).is_none());
    }

    #[test]
    fn nan_input_truncates_series() {
        let closes = vec![1.0, 2.0, 3.0, f64::NAN, 5.0];
        let series = ema_series(&closes, 3);
        assert_eq!(series.len(), 1);
    }
}
