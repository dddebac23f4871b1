// =============================================================================
// Money Flow Index (MFI) — volume-weighted RSI analogue
// =============================================================================
//
//   TP        = (high + low + close) / 3
//   raw flow  = TP * volume
//   MFI       = 100 - 100 / (1 + positive_flow / negative_flow)
//
// A window with zero volume everywhere has no money flow; the indicator is
// undefined and `None` is returned (the snapshot builder substitutes the
// neutral midpoint and flags the reading).
// =============================================================================

/// Compute the latest MFI(period). Values lie in [0, 100].
pub fn mfi(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    volumes: &[f64],
    period: usize,
) -> Option<f64> {
    let n = closes.len();
    if period == 0
        || n < period + 1
        || n != highs.len()
        || n != lows.len()
        || n != volumes.len()
    {
        return None;
    }

    let typical: Vec<f64> = (0..n).map(|i| (highs[i] + lows[i] + closes[i]) / 3.0).collect();

    let total_volume: f64 = volumes[n - period..].iter().sum();
    if total_volume <= 0.0 {
        return None; // zero-volume window — undefined
    }

    let mut positive = 0.0_f64;
    let mut negative = 0.0_f64;
    for i in n - period..n {
        let flow = typical[i] * volumes[i];
        if typical[i] > typical[i - 1] {
            positive += flow;
        } else if typical[i] < typical[i - 1] {
            negative += flow;
        }
    }

    let value = if positive == 0.0 && negative == 0.0 {
        50.0 // volume present but no typical-price movement
    } else if negative == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + positive / negative)
    };

    value.is_finite().then(|| value.clamp(0.0, 100.0))
}
