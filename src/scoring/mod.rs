// =============================================================================
// Scoring — confluence, regime, calibration, and the Signal type
// =============================================================================

pub mod calibration;
pub mod confluence;
pub mod regime;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::types::Direction;

pub use calibration::{CalibratorSettings, ConfidenceCalibrator};
pub use confluence::{
    ConfluenceScorer, ScoreBreakdown, ScorerSettings, ScorerWeights, TimeframeFeatures,
};
pub use regime::{Regime, RegimeDetector, RegimeState};

/// A fully formed trade signal.
///
/// Construction goes through [`Signal::try_new`], which enforces the price
/// ordering (long: stop < entry < target; short: target < entry < stop),
/// a risk:reward of at least 1, and the confluence/confidence consistency
/// rule.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub signal_id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    /// Composite confluence score in [0, 100].
    pub confluence_score: f64,
    /// Calibrated win probability in [0, 1].
    pub calibrated_confidence: f64,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    pub target_price: Decimal,
    /// |target − entry| / |entry − stop|, ≥ 1.
    pub risk_reward: f64,
    /// 1 (lowest) … 5 (highest). Ties at the risk gate break in favour of
    /// higher priority.
    pub priority: u8,
    /// Identifiers of the bars, patterns and verdicts behind this signal.
    pub contributing_evidence: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Signal {
    /// Validate and build. Returns `None` when any invariant fails.
    #[allow(clippy::too_many_arguments)]
    pub fn try_new(
        symbol: impl Into<String>,
        direction: Direction,
        confluence_score: f64,
        calibrated_confidence: f64,
        entry_price: Decimal,
        stop_price: Decimal,
        target_price: Decimal,
        priority: u8,
        contributing_evidence: Vec<String>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Option<Self> {
        let ordered = match direction {
            Direction::Long => stop_price < entry_price && entry_price < target_price,
            Direction::Short => target_price < entry_price && entry_price < stop_price,
        };
        if !ordered {
            return None;
        }

        let risk = (entry_price - stop_price).abs();
        let reward = (target_price - entry_price).abs();
        if risk <= Decimal::ZERO {
            return None;
        }
        use rust_decimal::prelude::ToPrimitive;
        let risk_reward = (reward / risk).to_f64()?;
        if risk_reward < 1.0 {
            return None;
        }

        if !(0.0..=100.0).contains(&confluence_score)
            || !(0.0..=1.0).contains(&calibrated_confidence)
        {
            return None;
        }
        // High confluence requires commensurate calibrated confidence.
        if confluence_score >= 90.0 && calibrated_confidence < 0.8 {
            return None;
        }
        if !(1..=5).contains(&priority) || expires_at <= issued_at {
            return None;
        }

        Some(Self {
            signal_id: Uuid::new_v4(),
            symbol: symbol.into(),
            direction,
            confluence_score,
            calibrated_confidence,
            entry_price,
            stop_price,
            target_price,
            risk_reward,
            priority,
            contributing_evidence,
            issued_at,
            expires_at,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
