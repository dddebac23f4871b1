// =============================================================================
// Formations — double top/bottom, head-and-shoulders, triangle, flag
// =============================================================================
//
// All formations are matched on pivot points with relative tolerance bands.
// =============================================================================

use chrono::{DateTime, Utc};

use crate::feed::Timeframe;

use super::{find_pivots, level, Pattern, PatternType, PatternWindow, Pivot};

/// Two extremes within this relative distance count as "equal".
const EQUAL_TOLERANCE: f64 = 0.006;
/// Minimum relative bounce between the two extremes of a double formation.
const MIN_BOUNCE: f64 = 0.01;
/// The head must exceed the shoulders by at least this relative margin.
const HEAD_MARGIN: f64 = 0.008;
/// Minimum relative pole move for a flag.
const FLAG_POLE_MIN: f64 = 0.03;
/// Consolidation range must stay under this fraction of the pole.
const FLAG_RANGE_MAX: f64 = 0.4;

pub(crate) fn detect(
    w: &PatternWindow,
    symbol: &str,
    timeframe: Timeframe,
    detected_at: DateTime<Utc>,
) -> Vec<Pattern> {
    let n = w.len();
    if n < 20 {
        return Vec::new();
    }

    let pivots = find_pivots(&w.highs, &w.lows, 2);
    let highs: Vec<Pivot> = pivots.iter().filter(|p| p.is_high).cloned().collect();
    let lows: Vec<Pivot> = pivots.iter().filter(|p| !p.is_high).cloned().collect();

    let mut out = Vec::new();
    out.extend(double_bottom(&lows, &highs, symbol, timeframe, detected_at));
    out.extend(double_top(&highs, &lows, symbol, timeframe, detected_at));
    out.extend(head_and_shoulders(&highs, &lows, symbol, timeframe, detected_at));
    out.extend(triangle(&highs, &lows, symbol, timeframe, detected_at));
    out.extend(flag(w, symbol, timeframe, detected_at));
    out
}

fn double_bottom(
    lows: &[Pivot],
    highs: &[Pivot],
    symbol: &str,
    timeframe: Timeframe,
    detected_at: DateTime<Utc>,
) -> Option<Pattern> {
    if lows.len() < 2 {
        return None;
    }
    let (a, b) = (&lows[lows.len() - 2], &lows[lows.len() - 1]);

    let equal = (a.price - b.price).abs() / a.price <= EQUAL_TOLERANCE;
    // Neckline: the highest pivot high between the two bottoms.
    let neckline = highs
        .iter()
        .filter(|h| h.index > a.index && h.index < b.index)
        .map(|h| h.price)
        .fold(f64::NEG_INFINITY, f64::max);
    if !equal || !neckline.is_finite() {
        return None;
    }
    let bounce = (neckline - a.price.max(b.price)) / a.price;
    if bounce < MIN_BOUNCE {
        return None;
    }

    let symmetry = 1.0 - ((a.price - b.price).abs() / a.price) / EQUAL_TOLERANCE;
    let geometric = (0.5 * symmetry + 0.5 * (bounce / 0.03).min(1.0)).clamp(0.0, 1.0);
    Some(
        Pattern::new(
            PatternType::DoubleBottom,
            symbol,
            timeframe,
            0.4 + 0.4 * geometric,
            5.0 + 3.0 * geometric,
            [level(a.price.min(b.price)), level(neckline)]
                .into_iter()
                .flatten()
                .collect(),
            detected_at,
        )
        .with_meta("neckline", format!("{neckline:.4}")),
    )
}

fn double_top(
    highs: &[Pivot],
    lows: &[Pivot],
    symbol: &str,
    timeframe: Timeframe,
    detected_at: DateTime<Utc>,
) -> Option<Pattern> {
    if highs.len() < 2 {
        return None;
    }
    let (a, b) = (&highs[highs.len() - 2], &highs[highs.len() - 1]);

    let equal = (a.price - b.price).abs() / a.price <= EQUAL_TOLERANCE;
    let neckline = lows
        .iter()
        .filter(|l| l.index > a.index && l.index < b.index)
        .map(|l| l.price)
        .fold(f64::INFINITY, f64::min);
    if !equal || !neckline.is_finite() {
        return None;
    }
    let dip = (a.price.min(b.price) - neckline) / a.price;
    if dip < MIN_BOUNCE {
        return None;
    }

    let symmetry = 1.0 - ((a.price - b.price).abs() / a.price) / EQUAL_TOLERANCE;
    let geometric = (0.5 * symmetry + 0.5 * (dip / 0.03).min(1.0)).clamp(0.0, 1.0);
    Some(
        Pattern::new(
            PatternType::DoubleTop,
            symbol,
            timeframe,
            0.4 + 0.4 * geometric,
            5.0 + 3.0 * geometric,
            [level(neckline), level(a.price.max(b.price))]
                .into_iter()
                .flatten()
                .collect(),
            detected_at,
        )
        .with_meta("neckline", format!("{neckline:.4}")),
    )
}

fn head_and_shoulders(
    highs: &[Pivot],
    lows: &[Pivot],
    symbol: &str,
    timeframe: Timeframe,
    detected_at: DateTime<Utc>,
) -> Option<Pattern> {
    if highs.len() < 3 {
        return None;
    }
    let (l, h, r) = (
        &highs[highs.len() - 3],
        &highs[highs.len() - 2],
        &highs[highs.len() - 1],
    );

    let head_above = (h.price - l.price) / l.price >= HEAD_MARGIN
        && (h.price - r.price) / r.price >= HEAD_MARGIN;
    let shoulders_equal = (l.price - r.price).abs() / l.price <= 2.0 * EQUAL_TOLERANCE;
    if !head_above || !shoulders_equal {
        return None;
    }

    let neckline = lows
        .iter()
        .filter(|p| p.index > l.index && p.index < r.index)
        .map(|p| p.price)
        .fold(f64::INFINITY, f64::min);
    if !neckline.is_finite() {
        return None;
    }

    let head_prominence = ((h.price - l.price.max(r.price)) / h.price / 0.02).min(1.0);
    let symmetry = 1.0 - ((l.price - r.price).abs() / l.price) / (2.0 * EQUAL_TOLERANCE);
    let geometric = (0.6 * head_prominence + 0.4 * symmetry).clamp(0.0, 1.0);
    Some(
        Pattern::new(
            PatternType::HeadAndShoulders,
            symbol,
            timeframe,
            0.4 + 0.4 * geometric,
            5.0 + 4.0 * geometric,
            [
                level(neckline),
                level((l.price + r.price) / 2.0),
                level(h.price),
            ]
            .into_iter()
            .flatten()
            .collect(),
            detected_at,
        )
        .with_meta("neckline", format!("{neckline:.4}")),
    )
}

fn triangle(
    highs: &[Pivot],
    lows: &[Pivot],
    symbol: &str,
    timeframe: Timeframe,
    detected_at: DateTime<Utc>,
) -> Option<Pattern> {
    if highs.len() < 2 || lows.len() < 2 {
        return None;
    }
    let (h1, h2) = (&highs[highs.len() - 2], &highs[highs.len() - 1]);
    let (l1, l2) = (&lows[lows.len() - 2], &lows[lows.len() - 1]);

    // Converging structure: lower highs and higher lows.
    let highs_falling = h2.price < h1.price * (1.0 - 0.001);
    let lows_rising = l2.price > l1.price * (1.0 + 0.001);
    if !highs_falling || !lows_rising {
        return None;
    }

    let early_range = h1.price - l1.price;
    let late_range = h2.price - l2.price;
    if early_range <= 0.0 || late_range <= 0.0 || late_range >= early_range {
        return None;
    }

    let contraction = 1.0 - late_range / early_range;
    let geometric = (contraction / 0.6).min(1.0);
    Some(
        Pattern::new(
            PatternType::Triangle,
            symbol,
            timeframe,
            0.35 + 0.35 * geometric,
            3.0 + 3.0 * geometric,
            [level(l2.price), level(h2.price)].into_iter().flatten().collect(),
            detected_at,
        )
        .with_meta("contraction", format!("{contraction:.3}")),
    )
}

fn flag(
    w: &PatternWindow,
    symbol: &str,
    timeframe: Timeframe,
    detected_at: DateTime<Utc>,
) -> Option<Pattern> {
    let n = w.len();
    const POLE: usize = 8;
    const CONSOLIDATION: usize = 5;
    if n < POLE + CONSOLIDATION + 1 {
        return None;
    }

    let pole_start = w.closes[n - 1 - CONSOLIDATION - POLE];
    let pole_end = w.closes[n - 1 - CONSOLIDATION];
    if pole_start <= 0.0 {
        return None;
    }
    let pole_move = (pole_end - pole_start) / pole_start;
    if pole_move.abs() < FLAG_POLE_MIN {
        return None;
    }

    let cons = &w.closes[n - CONSOLIDATION..];
    let cons_high = cons.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let cons_low = cons.iter().cloned().fold(f64::INFINITY, f64::min);
    let cons_range = cons_high - cons_low;
    let pole_range = (pole_end - pole_start).abs();
    if pole_range <= 0.0 || cons_range / pole_range > FLAG_RANGE_MAX {
        return None;
    }

    let tightness = 1.0 - cons_range / (pole_range * FLAG_RANGE_MAX);
    let geometric = (0.5 * (pole_move.abs() / 0.06).min(1.0) + 0.5 * tightness).clamp(0.0, 1.0);
    Some(
        Pattern::new(
            PatternType::Flag,
            symbol,
            timeframe,
            0.35 + 0.4 * geometric,
            4.0 + 3.0 * geometric,
            [level(cons_low), level(cons_high)].into_iter().flatten().collect(),
            detected_at,
        )
        .with_meta("bias", if pole_move > 0.0 { "bullish" } else { "bearish" })
        .with_meta("pole_pct", format!("{:.2}", pole_move * 100.0)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn window_from_closes(closes: Vec<f64>) -> PatternWindow {
        let highs: Vec<f64> = closes.iter().map(|c| c + 0.2).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.2).collect();
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

    fn detect_types(closes: Vec<f64>) -> Vec<PatternType> {
        let w = window_from_closes(closes);
        detect(&w, "BTCUSD", Timeframe::H4, at())
            .into_iter()
            .map(|p| p.pattern_type)
            .collect()
    }

    #[test]
    fn double_bottom_on_w_shape() {
        // Down to 100, bounce to 104, back to ~100, recover.
        let mut closes: Vec<f64> = Vec::new();
        closes.extend((0..8).map(|i| 107.0 - i as f64)); // 107 -> 100
        closes.extend((0..5).map(|i| 100.0 + i as f64)); // 100 -> 104
        closes.extend((0..5).map(|i| 104.0 - i as f64)); // 104 -> 100
        closes.extend((0..6).map(|i| 100.3 + i as f64 * 0.8)); // recover
        let found = detect_types(closes);
        assert!(found.contains(&PatternType::DoubleBottom), "got {found:?}");
    }

    #[test]
    fn double_top_on_m_shape() {
        let mut closes: Vec<f64> = Vec::new();
        closes.extend((0..8).map(|i| 93.0 + i as f64)); // 93 -> 100
        closes.extend((0..5).map(|i| 100.0 - i as f64)); // 100 -> 96
        closes.extend((0..5).map(|i| 96.0 + i as f64)); // 96 -> 100
        closes.extend((0..6).map(|i| 99.7 - i as f64 * 0.8)); // fall away
        let found = detect_types(closes);
        assert!(found.contains(&PatternType::DoubleTop), "got {found:?}");
    }

    #[test]
    fn head_and_shoulders_three_peaks() {
        let mut closes: Vec<f64> = Vec::new();
        closes.extend((0..5).map(|i| 95.0 + i as f64)); // up to 99 (left shoulder)
        closes.extend((0..4).map(|i| 99.0 - i as f64 * 0.75)); // dip to ~96
        closes.extend((0..6).map(|i| 96.0 + i as f64 * 1.2)); // head to ~102
        closes.extend((0..6).map(|i| 102.0 - i as f64 * 1.0)); // dip to ~97
        closes.extend((0..4).map(|i| 97.0 + i as f64 * 0.5)); // right shoulder ~99
        closes.extend((0..4).map(|i| 99.0 - i as f64 * 0.8)); // roll over
        let found = detect_types(closes);
        assert!(found.contains(&PatternType::HeadAndShoulders), "got {found:?}");
    }

    #[test]
    fn bull_flag_pole_then_tight_range() {
        let mut closes: Vec<f64> = vec![100.0; 10];
        closes.extend((0..8).map(|i| 100.0 + i as f64 * 0.8)); // pole to ~105.6
        closes.extend([105.5, 105.6, 105.4, 105.5, 105.6]); // tight flag
        let found = detect_types(closes);
        assert!(found.contains(&PatternType::Flag), "got {found:?}");
    }

    #[test]
    fn steady_trend_matches_no_formation() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64 * 0.3).collect();
        let found = detect_types(closes);
        assert!(found.is_empty(), "got {found:?}");
    }
}
