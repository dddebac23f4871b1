// =============================================================================
// Relative Strength Index (RSI) — Wilder smoothing
// =============================================================================
//
//   avg_gain = (prev_avg_gain * (period - 1) + gain) / period
//   avg_loss = (prev_avg_loss * (period - 1) + loss) / period
//   RSI      = 100 - 100 / (1 + avg_gain / avg_loss)
//
// A window with no movement at all is undefined; this module reports the
// neutral midpoint 50 and the snapshot builder attaches a degenerate flag.
// =============================================================================

/// Compute the RSI series for `closes` with the given `period`.
///
/// One value per close starting at index `period` (the first `period` closes
/// seed the averages). Values are always within [0, 100].
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l - d)
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    let mut out = Vec::with_capacity(deltas.len() - period + 1);
    match from_averages(avg_gain, avg_loss) {
        Some(v) => out.push(v),
        None => return Vec::new(),
    }

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        match from_averages(avg_gain, avg_loss) {
            Some(v) => out.push(v),
            None => break,
        }
    }
    out
}

/// Latest RSI value, or `None` before warmup completes.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    rsi_series(closes, period).last().copied()
}

fn from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let value = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0 // no movement — neutral midpoint
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };
    value.is_finite().then_some(value)
}
