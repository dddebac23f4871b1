// =============================================================================
// Support / resistance — pivot clustering with touch counting
// =============================================================================
//
// Pivot lows/highs are clustered within a relative tolerance; clusters with
// at least two touches form a level. A bounce fires when the latest bar
// probes the level and closes back on the far side.
// =============================================================================

use chrono::{DateTime, Utc};

use crate::feed::Timeframe;

use super::{find_pivots, level, Pattern, PatternType, PatternWindow};

/// Pivots within this relative distance merge into one level.
const CLUSTER_TOLERANCE: f64 = 0.004;
/// The bar must probe within this relative distance of the level.
const TOUCH_TOLERANCE: f64 = 0.003;
/// Minimum touches for a cluster to count as a level.
const MIN_TOUCHES: usize = 2;

#[derive(Debug, Clone)]
struct Level {
    price: f64,
    touches: usize,
}

fn cluster(pivot_prices: &[f64]) -> Vec<Level> {
    let mut sorted = pivot_prices.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut levels: Vec<Level> = Vec::new();
    for price in sorted {
        match levels.last_mut() {
            Some(last) if (price - last.price).abs() / last.price <= CLUSTER_TOLERANCE => {
                // Running mean keeps the level centred on its touches.
                last.price =
                    (last.price * last.touches as f64 + price) / (last.touches as f64 + 1.0);
                last.touches += 1;
            }
            _ => levels.push(Level { price, touches: 1 }),
        }
    }
    levels.retain(|l| l.touches >= MIN_TOUCHES);
    levels
}

pub(crate) fn detect(
    w: &PatternWindow,
    symbol: &str,
    timeframe: Timeframe,
    detected_at: DateTime<Utc>,
) -> Vec<Pattern> {
    let n = w.len();
    if n < 15 {
        return Vec::new();
    }

    let pivots = find_pivots(&w.highs, &w.lows, 2);
    let low_prices: Vec<f64> = pivots.iter().filter(|p| !p.is_high).map(|p| p.price).collect();
    let high_prices: Vec<f64> = pivots.iter().filter(|p| p.is_high).map(|p| p.price).collect();

    let supports = cluster(&low_prices);
    let resistances = cluster(&high_prices);

    let close = w.closes[n - 1];
    let low = w.lows[n - 1];
    let high = w.highs[n - 1];
    let mut out = Vec::new();

    // ── Support bounce: probe the level, close back above it ────────────
    for s in &supports {
        let probed = (low - s.price).abs() / s.price <= TOUCH_TOLERANCE || low < s.price;
        if probed && close > s.price {
            let geometric = (s.touches as f64 / 5.0).min(1.0);
            let p = Pattern::new(
                PatternType::SupportBounce,
                symbol,
                timeframe,
                0.35 + 0.4 * geometric,
                3.0 + (s.touches as f64).min(5.0),
                level(s.price).into_iter().collect(),
                detected_at,
            )
            .with_meta("touches", s.touches);
            out.push(p);
        }
    }

    // ── Resistance rejection: probe the level, close back below it ──────
    for r in &resistances {
        let probed = (high - r.price).abs() / r.price <= TOUCH_TOLERANCE || high > r.price;
        if probed && close < r.price {
            let geometric = (r.touches as f64 / 5.0).min(1.0);
            let p = Pattern::new(
                PatternType::ResistanceRejection,
                symbol,
                timeframe,
                0.35 + 0.4 * geometric,
                3.0 + (r.touches as f64).min(5.0),
                level(r.price).into_iter().collect(),
                detected_at,
            )
            .with_meta("touches", r.touches);
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

    /// Price oscillates, repeatedly bottoming at ~100, and the final bar
    /// probes 100 and closes above.
    fn support_window() -> PatternWindow {
        let closes = vec![
            102.0, 101.0, 100.2, 101.5, 103.0, 102.0, 100.1, 101.0, 102.5, 103.0, 102.0, 100.15,
            101.2, 102.0, 103.0, 102.5, 101.5, 100.3,
        ];
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.3).collect();
        let highs: Vec<f64> = closes.iter().map(|c| c + 0.3).collect();
        let opens: Vec<f64> = closes.iter().map(|c| c - 0.1).collect();
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
    fn clustering_merges_nearby_pivots() {
        let levels = cluster(&[100.0, 100.2, 105.0, 100.1]);
        // 100.0/100.1/100.2 merge; 105 stands alone with one touch and drops.
        assert_eq!(levels.len(), 1);
        assert!(levels[0].touches >= 3);
        assert!((levels[0].price - 100.1).abs() < 0.2);
    }

    #[test]
    fn support_bounce_detected() {
        let w = support_window();
        let found = detect(&w, "BTCUSD", Timeframe::H4, at());
        assert!(
            found.iter().any(|p| p.pattern_type == PatternType::SupportBounce),
            "expected support bounce, got {:?}",
            found.iter().map(|p| p.pattern_type).collect::<Vec<_>>()
        );
    }

    #[test]
    fn short_window_detects_nothing() {
        let w = PatternWindow {
            opens: vec![1.0; 5],
            highs: vec![1.0; 5],
            lows: vec![1.0; 5],
            closes: vec![1.0; 5],
            volumes: vec![1.0; 5],
        };
        assert!(detect(&w, "X", Timeframe::H1, at()).is_empty());
    }
}
