// =============================================================================
// Candlestick patterns — pin bar, engulfing, doji
// =============================================================================
//
// All three work on body/wick ratios of the most recent one or two bars.
// =============================================================================

use chrono::{DateTime, Utc};

use crate::feed::Timeframe;

use super::{level, Pattern, PatternType, PatternWindow};

/// Body smaller than this fraction of the full range reads as a doji.
const DOJI_BODY_MAX: f64 = 0.10;
/// Dominant wick must be at least this multiple of the body for a pin bar.
const PIN_WICK_MIN_RATIO: f64 = 2.0;
/// The opposite wick must stay under this fraction of the range.
const PIN_OPPOSITE_WICK_MAX: f64 = 0.25;

pub(crate) fn detect(
    w: &PatternWindow,
    symbol: &str,
    timeframe: Timeframe,
    detected_at: DateTime<Utc>,
) -> Vec<Pattern> {
    let n = w.len();
    if n < 2 {
        return Vec::new();
    }
    let mut out = Vec::new();

    let open = w.opens[n - 1];
    let close = w.closes[n - 1];
    let high = w.highs[n - 1];
    let low = w.lows[n - 1];

    let range = high - low;
    if range <= 0.0 {
        return out;
    }
    let body = (close - open).abs();
    let upper_wick = high - open.max(close);
    let lower_wick = open.min(close) - low;

    // ── Doji ────────────────────────────────────────────────────────────
    if body / range < DOJI_BODY_MAX {
        let geometric = 1.0 - (body / range) / DOJI_BODY_MAX;
        let mut p = Pattern::new(
            PatternType::Doji,
            symbol,
            timeframe,
            0.4 + 0.3 * geometric,
            3.0,
            level(close).into_iter().collect(),
            detected_at,
        );
        p = p.with_meta("body_to_range", format!("{:.4}", body / range));
        out.push(p);
    }

    // ── Pin bar ─────────────────────────────────────────────────────────
    if body > 0.0 {
        let bullish_pin =
            lower_wick >= PIN_WICK_MIN_RATIO * body && upper_wick / range < PIN_OPPOSITE_WICK_MAX;
        let bearish_pin =
            upper_wick >= PIN_WICK_MIN_RATIO * body && lower_wick / range < PIN_OPPOSITE_WICK_MAX;

        if bullish_pin || bearish_pin {
            let wick = if bullish_pin { lower_wick } else { upper_wick };
            let geometric = ((wick / body) / 4.0).min(1.0);
            let extreme = if bullish_pin { low } else { high };
            let p = Pattern::new(
                PatternType::PinBar,
                symbol,
                timeframe,
                0.35 + 0.4 * geometric,
                4.0 + 2.0 * geometric,
                level(extreme).into_iter().collect(),
                detected_at,
            )
            .with_meta("bias", if bullish_pin { "bullish" } else { "bearish" });
            out.push(p);
        }
    }

    // ── Engulfing ───────────────────────────────────────────────────────
    let prev_open = w.opens[n - 2];
    let prev_close = w.closes[n - 2];
    let prev_body = (prev_close - prev_open).abs();
    if prev_body > 0.0 && body > prev_body {
        let curr_bullish = close > open;
        let prev_bullish = prev_close > prev_open;
        let engulfs = open.min(close) <= prev_open.min(prev_close)
            && open.max(close) >= prev_open.max(prev_close);
        if engulfs && curr_bullish != prev_bullish {
            let geometric = ((body / prev_body - 1.0) / 1.5).clamp(0.0, 1.0);
            let vol_conf = if w.volumes[n - 1] > w.volumes[n - 2] { 0.15 } else { 0.0 };
            let p = Pattern::new(
                PatternType::Engulfing,
                symbol,
                timeframe,
                0.4 + 0.35 * geometric + vol_conf,
                4.0 + 3.0 * geometric,
                level(close).into_iter().collect(),
                detected_at,
            )
            .with_meta("bias", if curr_bullish { "bullish" } else { "bearish" });
            out.push(p);
        }
    }

    out
}
