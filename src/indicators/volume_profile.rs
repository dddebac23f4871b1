// =============================================================================
// Volume Profile — volume distribution across price buckets
// =============================================================================

/// Volume histogram over a trailing window of bars.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeProfile {
    /// (bucket midpoint price, total volume) pairs, ascending by price.
    pub buckets: Vec<(f64, f64)>,
    /// Point of control — bucket midpoint with the highest traded volume.
    pub poc: f64,
    /// Latest bar volume divided by the window's average volume.
    pub volume_ratio: f64,
}

/// Build the volume profile over the last `window` bars using `bucket_count`
/// equal price buckets spanning the window's close range.
pub fn volume_profile(
    closes: &[f64],
    volumes: &[f64],
    window: usize,
    bucket_count: usize,
) -> Option<VolumeProfile> {
    let n = closes.len();
    if window == 0 || bucket_count == 0 || n < window || n != volumes.len() {
        return None;
    }

    let closes = &closes[n - window..];
    let volumes = &volumes[n - window..];

    let lo = closes.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = closes.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !lo.is_finite() || !hi.is_finite() {
        return None;
    }

    let avg_volume: f64 = volumes.iter().sum::<f64>() / window as f64;
    let volume_ratio = if avg_volume > 0.0 {
        volumes[window - 1] / avg_volume
    } else {
        1.0
    };

    // Degenerate single-price window: one bucket holds everything.
    if hi - lo <= f64::EPSILON {
        let total: f64 = volumes.iter().sum();
        return Some(VolumeProfile {
            buckets: vec![(lo, total)],
            poc: lo,
            volume_ratio,
        });
    }

    let step = (hi - lo) / bucket_count as f64;
    let mut totals = vec![0.0_f64; bucket_count];
    for (c, v) in closes.iter().zip(volumes) {
        let idx = (((c - lo) / step) as usize).min(bucket_count - 1);
        totals[idx] += v;
    }

    let buckets: Vec<(f64, f64)> = totals
        .iter()
        .enumerate()
        .map(|(i, &v)| (lo + (i as f64 + 0.5) * step, v))
        .collect();

    let poc = buckets
        .iter()
        .cloned()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(p, _)| p)?;

    Some(VolumeProfile {
        buckets,
        poc,
        volume_ratio,
    })
}
