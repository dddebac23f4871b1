// =============================================================================
// Trend reversal — price/momentum divergence
// =============================================================================
//
// Bearish: price prints a higher high while RSI prints a lower high.
// Bullish: price prints a lower low while RSI prints a higher low.
// The MACD histogram is used as a secondary confirmation when available.
// =============================================================================

use chrono::{DateTime, Utc};

use crate::feed::Timeframe;
use crate::indicators::macd::macd_standard;
use crate::indicators::rsi::rsi_series;

use super::{find_pivots, level, Pattern, PatternType, PatternWindow};

/// RSI look-back for the divergence comparison.
const RSI_PERIOD: usize = 14;
/// Minimum relative distance between the two price extremes.
const MIN_EXTREME_SEPARATION: f64 = 0.002;

pub(crate) fn detect(
    w: &PatternWindow,
    symbol: &str,
    timeframe: Timeframe,
    detected_at: DateTime<Utc>,
) -> Vec<Pattern> {
    let n = w.len();
    if n < RSI_PERIOD + 12 {
        return Vec::new();
    }

    let rsi = rsi_series(&w.closes, RSI_PERIOD);
    if rsi.len() < 10 {
        return Vec::new();
    }
    // rsi[i] corresponds to closes[i + RSI_PERIOD].
    let offset = RSI_PERIOD;

    let pivots = find_pivots(&w.highs, &w.lows, 2);
    let highs: Vec<_> = pivots
        .iter()
        .filter(|p| p.is_high && p.index >= offset)
        .collect();
    let lows: Vec<_> = pivots
        .iter()
        .filter(|p| !p.is_high && p.index >= offset)
        .collect();

    let macd_hist = macd_standard(&w.closes).map(|m| m.histogram);
    let mut out = Vec::new();

    // ── Bearish divergence on the last two pivot highs ──────────────────
    if highs.len() >= 2 {
        let (a, b) = (highs[highs.len() - 2], highs[highs.len() - 1]);
        let price_higher = (b.price - a.price) / a.price > MIN_EXTREME_SEPARATION;
        let rsi_a = rsi[a.index - offset];
        let rsi_b = rsi[b.index - offset];
        if price_higher && rsi_b < rsi_a {
            let geometric = ((rsi_a - rsi_b) / 15.0).clamp(0.1, 1.0);
            let confirm = matches!(macd_hist, Some(h) if h < 0.0);
            let p = Pattern::new(
                PatternType::TrendReversal,
                symbol,
                timeframe,
                0.35 + 0.35 * geometric + if confirm { 0.1 } else { 0.0 },
                3.0 + 4.0 * geometric,
                level(b.price).into_iter().collect(),
                detected_at,
            )
            .with_meta("bias", "bearish")
            .with_meta("rsi_delta", format!("{:.2}", rsi_a - rsi_b));
            out.push(p);
        }
    }

    // ── Bullish divergence on the last two pivot lows ───────────────────
    if lows.len() >= 2 {
        let (a, b) = (lows[lows.len() - 2], lows[lows.len() - 1]);
        let price_lower = (a.price - b.price) / a.price > MIN_EXTREME_SEPARATION;
        let rsi_a = rsi[a.index - offset];
        let rsi_b = rsi[b.index - offset];
        if price_lower && rsi_b > rsi_a {
            let geometric = ((rsi_b - rsi_a) / 15.0).clamp(0.1, 1.0);
            let confirm = matches!(macd_hist, Some(h) if h > 0.0);
            let p = Pattern::new(
                PatternType::TrendReversal,
                symbol,
                timeframe,
                0.35 + 0.35 * geometric + if confirm { 0.1 } else { 0.0 },
                3.0 + 4.0 * geometric,
                level(b.price).into_iter().collect(),
                detected_at,
            )
            .with_meta("bias", "bullish")
            .with_meta("rsi_delta", format!("{:.2}", rsi_b - rsi_a));
            out.push(p);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn window_from_closes(closes: Vec<f64>) -> PatternWindow {
        let highs: Vec<f64> = closes.iter().map(|c| c + 0.4).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.4).collect();
        let opens = closes.clone();
        let volumes = vec![1.0; closes.len()];
        PatternWindow {
            opens,
            highs,
            lows,
            closes,
            volumes,
        }
    }

    #[test]
    fn bearish_divergence_on_weakening_rally() {
        // First leg: sharp rally to ~110. Pullback. Second leg: slightly
        // higher high reached with much smaller gains (momentum fading).
        let mut closes: Vec<f64> = Vec::new();
        closes.extend((0..12).map(|i| 100.0 + i as f64)); // strong leg to 111
        closes.extend((0..6).map(|i| 110.0 - i as f64)); // pullback to 105
        closes.extend((0..14).map(|i| 105.0 + i as f64 * 0.55)); // weak leg to ~112.2
        closes.extend([111.6, 111.2]); // roll over so the high pivots out

        let w = window_from_closes(closes);
        let found = detect(&w, "BTCUSD", Timeframe::H4, at());
        assert!(
            found.iter().any(|p| {
                p.pattern_type == PatternType::TrendReversal
                    && p.metadata.get("bias").map(String::as_str) == Some("bearish")
            }),
            "expected bearish reversal, got {found:?}"
        );
    }

    #[test]
    fn steady_trend_has_no_divergence() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64 * 0.5).collect();
        let w = window_from_closes(closes);
        assert!(detect(&w, "BTCUSD", Timeframe::H4, at()).is_empty());
    }

    #[test]
    fn short_window_detects_nothing() {
        let w = window_from_closes(vec![100.0; 12]);
        assert!(detect(&w, "BTCUSD", Timeframe::H4, at()).is_empty());
    }
}
