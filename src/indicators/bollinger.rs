// =============================================================================
// Bollinger Bands — SMA(period) ± k·σ
// =============================================================================

/// A single Bollinger reading. Invariant: lower ≤ middle ≤ upper.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub lower: f64,
    pub middle: f64,
    pub upper: f64,
    /// Band width as a percentage of the middle band.
    pub width_pct: f64,
}

/// Compute the latest Bollinger(period, k) bands over `closes`.
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> Option<Bands> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let mean: f64 = window.iter().sum::<f64>() / period as f64;
    let variance: f64 =
        window.iter().map(|c| (c - mean) * (c - mean)).sum::<f64>() / period as f64;
    let sigma = variance.sqrt();

    if !mean.is_finite() || !sigma.is_finite() {
        return None;
    }

    let lower = mean - k * sigma;
    let upper = mean + k * sigma;
    let width_pct = if mean != 0.0 {
        (upper - lower) / mean * 100.0
    } else {
        0.0
    };

    Some(Bands {
        lower,
        middle: mean,
        upper,
        width_pct,
    })
}
