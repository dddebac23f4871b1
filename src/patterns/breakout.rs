// =============================================================================
// Breakout — range-envelope exit with volume confirmation
// =============================================================================
//
// The envelope is the high/low range of the lookback window excluding the
// latest bar. A close beyond the envelope with above-average volume fires.
// =============================================================================

use chrono::{DateTime, Utc};

use crate::feed::Timeframe;

use super::{level, Pattern, PatternType, PatternWindow};

/// Bars forming the range envelope.
const LOOKBACK: usize = 20;
/// Latest volume must exceed this multiple of the window average.
const VOLUME_CONFIRM_RATIO: f64 = 1.3;

pub(crate) fn detect(
    w: &PatternWindow,
    symbol: &str,
    timeframe: Timeframe,
    detected_at: DateTime<Utc>,
) -> Vec<Pattern> {
    let n = w.len();
    if n < LOOKBACK + 1 {
        return Vec::new();
    }

    let env = &w.highs[n - 1 - LOOKBACK..n - 1];
    let range_high = env.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let env_lows = &w.lows[n - 1 - LOOKBACK..n - 1];
    let range_low = env_lows.iter().cloned().fold(f64::INFINITY, f64::min);
    if !range_high.is_finite() || !range_low.is_finite() || range_high <= range_low {
        return Vec::new();
    }

    let close = w.closes[n - 1];
    let avg_volume: f64 =
        w.volumes[n - 1 - LOOKBACK..n - 1].iter().sum::<f64>() / LOOKBACK as f64;
    let vol_ratio = if avg_volume > 0.0 {
        w.volumes[n - 1] / avg_volume
    } else {
        0.0
    };

    let (broke_up, broke_down) = (close > range_high, close < range_low);
    if !broke_up && !broke_down {
        return Vec::new();
    }
    if vol_ratio < VOLUME_CONFIRM_RATIO {
        return Vec::new(); // no volume confirmation — ignore the poke
    }

    let boundary = if broke_up { range_high } else { range_low };
    let margin = (close - boundary).abs() / boundary;
    let geometric = (margin / 0.01).min(1.0); // 1 % beyond the envelope saturates
    let vol_conf = ((vol_ratio - VOLUME_CONFIRM_RATIO) / 2.0).clamp(0.0, 0.25);

    let p = Pattern::new(
        PatternType::Breakout,
        symbol,
        timeframe,
        0.4 + 0.35 * geometric + vol_conf,
        4.0 + 4.0 * geometric,
        [level(range_low), level(range_high)]
            .into_iter()
            .flatten()
            .collect(),
        detected_at,
    )
    .with_meta("bias", if broke_up { "bullish" } else { "bearish" })
    .with_meta("volume_ratio", format!("{vol_ratio:.2}"));

    vec![p]
}
