// =============================================================================
// Market Regime Detector
// =============================================================================
//
// Classifies the market into {Bull, Bear, Sideways} from EMA-stack alignment,
// MACD sign and price momentum on the 4h and 1d timeframes. The 1d vote
// carries more weight. The latest state is cached with its age, and the
// regime gates which signal directions are admissible.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::IndicatorSnapshot;
use crate::types::Direction;

/// High-level market mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    Bull,
    Bear,
    Sideways,
}

impl Regime {
    /// Which signal directions this regime admits. Sideways admits both:
    /// range strategies trade both edges.
    pub fn allows(self, direction: Direction) -> bool {
        match self {
            Self::Bull => direction == Direction::Long,
            Self::Bear => direction == Direction::Short,
            Self::Sideways => true,
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bull => write!(f, "BULL"),
            Self::Bear => write!(f, "BEAR"),
            Self::Sideways => write!(f, "SIDEWAYS"),
        }
    }
}

/// Detected regime plus its classification confidence.
#[derive(Debug, Clone, Serialize)]
pub struct RegimeState {
    pub regime: Regime,
    /// Classification confidence in [0, 1].
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
}

/// Caching detector, shared behind `Arc`.
pub struct RegimeDetector {
    state: RwLock<Option<RegimeState>>,
}

/// Directional votes from one timeframe's snapshot.
fn timeframe_vote(snapshot: &IndicatorSnapshot) -> f64 {
    let mut vote = 0.0;

    // EMA stack alignment.
    if let (Some(e20), Some(e50)) = (snapshot.get("ema_20"), snapshot.get("ema_50")) {
        match snapshot.get("ema_200") {
            Some(e200) if e20 > e50 && e50 > e200 => vote += 1.0,
            Some(e200) if e20 < e50 && e50 < e200 => vote -= 1.0,
            // Without the slow EMA, the fast pair still gets half a vote.
            None if e20 > e50 => vote += 0.5,
            None if e20 < e50 => vote -= 0.5,
            _ => {}
        }
    }

    // MACD histogram sign.
    if let Some(hist) = snapshot.get("macd_hist") {
        if hist > 0.0 {
            vote += 1.0;
        } else if hist < 0.0 {
            vote -= 1.0;
        }
    }

    // Price momentum.
    if let Some(roc) = snapshot.get("roc_10") {
        if roc > 0.5 {
            vote += 1.0;
        } else if roc < -0.5 {
            vote -= 1.0;
        }
    }

    vote
}

impl RegimeDetector {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(None),
        }
    }

    /// Classify from the 4h snapshot plus, when warmed up, the 1d snapshot.
    pub fn detect(
        &self,
        h4: &IndicatorSnapshot,
        d1: Option<&IndicatorSnapshot>,
        now: DateTime<Utc>,
    ) -> RegimeState {
        let mut total = timeframe_vote(h4);
        let mut max_total = 3.0;
        if let Some(d1) = d1 {
            total += 1.5 * timeframe_vote(d1);
            max_total += 4.5;
        }

        let regime = if total >= 2.0 {
            Regime::Bull
        } else if total <= -2.0 {
            Regime::Bear
        } else {
            Regime::Sideways
        };
        let confidence = (total.abs() / max_total).clamp(0.3, 1.0);

        let state = RegimeState {
            regime,
            confidence,
            detected_at: now,
        };

        debug!(
            symbol = %h4.symbol,
            regime = %regime,
            votes = format!("{total:.1}"),
            confidence = format!("{confidence:.2}"),
            "regime detected"
        );

        *self.state.write() = Some(state.clone());
        state
    }

    /// Most recent classification without recomputing.
    pub fn current(&self) -> Option<RegimeState> {
        self.state.read().clone()
    }
}

impl Default for RegimeDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::Timeframe;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn snapshot(values: &[(&str, f64)]) -> IndicatorSnapshot {
        IndicatorSnapshot {
            symbol: "BTCUSD".into(),
            timeframe: Timeframe::H4,
            bar_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<BTreeMap<_, _>>(),
            flags: Vec::new(),
        }
    }

    fn bullish() -> IndicatorSnapshot {
        snapshot(&[
            ("ema_20", 105.0),
            ("ema_50", 103.0),
            ("ema_200", 100.0),
            ("macd_hist", 0.5),
            ("roc_10", 2.0),
        ])
    }

    fn bearish() -> IndicatorSnapshot {
        snapshot(&[
            ("ema_20", 95.0),
            ("ema_50", 97.0),
            ("ema_200", 100.0),
            ("macd_hist", -0.5),
            ("roc_10", -2.0),
        ])
    }

    #[test]
    fn aligned_uptrend_is_bull() {
        let d = RegimeDetector::new();
        let state = d.detect(&bullish(), Some(&bullish()), Utc::now());
        assert_eq!(state.regime, Regime::Bull);
        assert!(state.confidence > 0.5);
    }

    #[test]
    fn aligned_downtrend_is_bear() {
        let d = RegimeDetector::new();
        let state = d.detect(&bearish(), None, Utc::now());
        assert_eq!(state.regime, Regime::Bear);
    }

    #[test]
    fn mixed_votes_are_sideways() {
        let d = RegimeDetector::new();
        let mixed = snapshot(&[
            ("ema_20", 105.0),
            ("ema_50", 103.0),
            ("ema_200", 100.0),
            ("macd_hist", -0.5),
            ("roc_10", 0.0),
        ]);
        let state = d.detect(&mixed, None, Utc::now());
        assert_eq!(state.regime, Regime::Sideways);
    }

    #[test]
    fn daily_vote_can_flip_ambiguous_h4() {
        let d = RegimeDetector::new();
        let weak_h4 = snapshot(&[("ema_20", 101.0), ("ema_50", 100.5), ("macd_hist", 0.1)]);
        let state = d.detect(&weak_h4, Some(&bullish()), Utc::now());
        assert_eq!(state.regime, Regime::Bull);
    }

    #[test]
    fn regime_direction_gating() {
        assert!(Regime::Bull.allows(Direction::Long));
        assert!(!Regime::Bull.allows(Direction::Short));
        assert!(Regime::Bear.allows(Direction::Short));
        assert!(!Regime::Bear.allows(Direction::Long));
        assert!(Regime::Sideways.allows(Direction::Long));
        assert!(Regime::Sideways.allows(Direction::Short));
    }

    #[test]
    fn detector_caches_state() {
        let d = RegimeDetector::new();
        assert!(d.current().is_none());
        d.detect(&bullish(), None, Utc::now());
        assert_eq!(d.current().unwrap().regime, Regime::Bull);
    }
}
