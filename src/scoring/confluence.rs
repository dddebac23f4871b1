// =============================================================================
// Confluence Scorer — weighted composite of technical, pattern and analyst
// evidence across timeframes
// =============================================================================
//
// Each timeframe produces component scores in [-10, +10]:
//   trend      — EMA stack alignment + MACD sign + price momentum
//   momentum   — RSI / Stochastic / CCI / MFI
//   volatility — ATR percentile context (non-directional)
//   volume     — volume confirmation (non-directional)
//   pattern    — confidence × strength × learned pattern weight
//   analyst    — mean sentiment × mean confidence with a dispersion penalty
//
// Directional components set the sign; the non-directional pair scales the
// magnitude. Timeframe weights start from the configured base and shift with
// the volatility percentile (high vol → shorter frames) and the regime
// (trending → longer frames), then renormalize to 1.0.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analysts::AnalystVerdict;
use crate::error::ConfigError;
use crate::feed::Timeframe;
use crate::indicators::IndicatorSnapshot;
use crate::patterns::{Pattern, PatternType};
use crate::types::Direction;

use super::regime::{Regime, RegimeState};
use super::Signal;

/// Weight-sum tolerance for config validation.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Component weights. Must sum to 1.0 within ±1e-6.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScorerWeights {
    pub trend: f64,
    pub momentum: f64,
    pub volatility: f64,
    pub volume: f64,
    pub pattern: f64,
    pub analyst: f64,
}

impl Default for ScorerWeights {
    fn default() -> Self {
        Self {
            trend: 0.25,
            momentum: 0.20,
            volatility: 0.10,
            volume: 0.10,
            pattern: 0.20,
            analyst: 0.15,
        }
    }
}

impl ScorerWeights {
    pub fn sum(&self) -> f64 {
        self.trend + self.momentum + self.volatility + self.volume + self.pattern + self.analyst
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::WeightSum { sum });
        }
        for (name, v) in [
            ("scorer.weights.trend", self.trend),
            ("scorer.weights.momentum", self.momentum),
            ("scorer.weights.volatility", self.volatility),
            ("scorer.weights.volume", self.volume),
            ("scorer.weights.pattern", self.pattern),
            ("scorer.weights.analyst", self.analyst),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::InvalidValue {
                    field: "scorer.weights",
                    reason: format!("{name} = {v} outside [0, 1]"),
                });
            }
        }
        Ok(())
    }
}

/// Scorer tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerSettings {
    pub weights: ScorerWeights,
    /// Composite score required before a signal may be emitted.
    pub entry_threshold: f64,
    pub min_calibrated_confidence: f64,
    pub min_risk_reward: f64,
    /// Stop distance as a multiple of ATR.
    pub stop_atr_multiplier: f64,
    /// Signal time-to-live in seconds.
    pub signal_ttl_secs: i64,
    /// Base timeframe weights before volatility/regime adjustment.
    pub timeframe_base_weights: BTreeMap<Timeframe, f64>,
}

impl Default for ScorerSettings {
    fn default() -> Self {
        let mut timeframe_base_weights = BTreeMap::new();
        timeframe_base_weights.insert(Timeframe::M15, 0.15);
        timeframe_base_weights.insert(Timeframe::H1, 0.25);
        timeframe_base_weights.insert(Timeframe::H4, 0.35);
        timeframe_base_weights.insert(Timeframe::D1, 0.25);
        Self {
            weights: ScorerWeights::default(),
            entry_threshold: 55.0,
            min_calibrated_confidence: 0.55,
            min_risk_reward: 1.5,
            stop_atr_multiplier: 2.0,
            signal_ttl_secs: 3600,
            timeframe_base_weights,
        }
    }
}

/// Per-timeframe inputs to one scoring pass.
#[derive(Debug, Clone)]
pub struct TimeframeFeatures {
    pub snapshot: IndicatorSnapshot,
    pub patterns: Vec<Pattern>,
}

/// Component scores for one timeframe, each in [-10, +10].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ComponentScores {
    pub trend: f64,
    pub momentum: f64,
    pub volatility: f64,
    pub volume: f64,
    pub pattern: f64,
    pub analyst: f64,
}

/// Result of one scoring pass.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreBreakdown {
    /// Composite in [0, 100].
    pub composite: f64,
    /// `None` when the evidence nets out flat.
    pub direction: Option<Direction>,
    /// |directional| mapped to [0, 1]; input to the calibrator.
    pub raw_confidence: f64,
    pub per_timeframe: BTreeMap<Timeframe, ComponentScores>,
    pub timeframe_weights: BTreeMap<Timeframe, f64>,
}

/// The confluence scorer.
pub struct ConfluenceScorer {
    settings: ScorerSettings,
}

impl ConfluenceScorer {
    pub fn new(settings: ScorerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ScorerSettings {
        &self.settings
    }

    // -------------------------------------------------------------------------
    // Scoring
    // -------------------------------------------------------------------------

    /// Score the available evidence. Absent inputs degrade the affected
    /// component to zero rather than failing the pass.
    pub fn evaluate(
        &self,
        features: &BTreeMap<Timeframe, TimeframeFeatures>,
        verdicts: &[&AnalystVerdict],
        regime: &RegimeState,
        pattern_weights: &HashMap<PatternType, f64>,
    ) -> ScoreBreakdown {
        let tf_weights = self.timeframe_weights(features, regime.regime);

        let analyst_score = analyst_component(verdicts);

        let mut per_timeframe = BTreeMap::new();
        let mut directional = 0.0;
        let mut context = 0.0;

        for (tf, feats) in features {
            let mut c = technical_components(&feats.snapshot);
            c.pattern = pattern_component(&feats.patterns, pattern_weights);
            c.analyst = analyst_score;
            let w_tf = tf_weights.get(tf).copied().unwrap_or(0.0);

            directional += w_tf * self.directional(&c);
            context += w_tf * self.context(&c);
            per_timeframe.insert(*tf, c);
        }

        // Context modulates magnitude within [0.75, 1.0].
        let context_factor = 0.75 + 0.25 * ((context + 10.0) / 20.0).clamp(0.0, 1.0);
        let composite = (directional.abs() / 10.0 * 100.0 * context_factor).clamp(0.0, 100.0);

        let direction = if directional > 0.05 {
            Some(Direction::Long)
        } else if directional < -0.05 {
            Some(Direction::Short)
        } else {
            None
        };

        ScoreBreakdown {
            composite,
            direction,
            raw_confidence: (directional.abs() / 10.0).clamp(0.0, 1.0),
            per_timeframe,
            timeframe_weights: tf_weights,
        }
    }

    /// Weighted directional total across the signed components.
    fn directional(&self, c: &ComponentScores) -> f64 {
        let w = &self.settings.weights;
        let weight_sum = w.trend + w.momentum + w.pattern + w.analyst;
        if weight_sum <= 0.0 {
            return 0.0;
        }
        ((w.trend * c.trend + w.momentum * c.momentum + w.pattern * c.pattern
            + w.analyst * c.analyst)
            / weight_sum)
            .clamp(-10.0, 10.0)
    }

    /// Weighted non-directional context.
    fn context(&self, c: &ComponentScores) -> f64 {
        let w = &self.settings.weights;
        let weight_sum = w.volatility + w.volume;
        if weight_sum <= 0.0 {
            return 0.0;
        }
        ((w.volatility * c.volatility + w.volume * c.volume) / weight_sum).clamp(-10.0, 10.0)
    }

    /// Per-symbol timeframe weights: volatility shifts weight between short
    /// and long frames, regime biases trending markets toward longer frames,
    /// then the result renormalizes to 1.0 over the frames present.
    fn timeframe_weights(
        &self,
        features: &BTreeMap<Timeframe, TimeframeFeatures>,
        regime: Regime,
    ) -> BTreeMap<Timeframe, f64> {
        let vol_percentile = {
            let ps: Vec<f64> = features
                .values()
                .filter_map(|f| f.snapshot.get("atr_percentile"))
                .collect();
            if ps.is_empty() {
                50.0
            } else {
                ps.iter().sum::<f64>() / ps.len() as f64
            }
        };
        // [-0.5, 0.5]: positive means high volatility.
        let vol_shift = ((vol_percentile - 50.0) / 100.0).clamp(-0.5, 0.5);

        let mut weights = BTreeMap::new();
        for tf in features.keys() {
            let base = self
                .settings
                .timeframe_base_weights
                .get(tf)
                .copied()
                .unwrap_or(0.25);
            let short_frame = matches!(tf, Timeframe::M15 | Timeframe::H1);

            let mut w = base * if short_frame { 1.0 + vol_shift } else { 1.0 - vol_shift };
            w *= match (regime, short_frame) {
                (Regime::Bull | Regime::Bear, false) => 1.2,
                (Regime::Sideways, true) => 1.2,
                _ => 1.0,
            };
            weights.insert(*tf, w.max(0.0));
        }

        let sum: f64 = weights.values().sum();
        if sum > 0.0 {
            for w in weights.values_mut() {
                *w /= sum;
            }
        }
        weights
    }

    // -------------------------------------------------------------------------
    // Signal emission
    // -------------------------------------------------------------------------

    /// Turn a score breakdown into a signal, or `None` when any emission gate
    /// fails. `atr` is in price units on the primary timeframe.
    #[allow(clippy::too_many_arguments)]
    pub fn emit_signal(
        &self,
        symbol: &str,
        breakdown: &ScoreBreakdown,
        regime: &RegimeState,
        calibrated_confidence: f64,
        last_close: Decimal,
        atr: f64,
        evidence: Vec<String>,
        now: DateTime<Utc>,
    ) -> Option<Signal> {
        let direction = breakdown.direction?;

        if breakdown.composite < self.settings.entry_threshold {
            return None;
        }
        if calibrated_confidence < self.settings.min_calibrated_confidence {
            return None;
        }
        if !regime.regime.allows(direction) {
            debug!(symbol, %direction, regime = %regime.regime, "signal blocked by regime");
            return None;
        }
        if atr <= 0.0 || last_close <= Decimal::ZERO {
            return None;
        }

        let stop_distance = Decimal::from_f64(atr * self.settings.stop_atr_multiplier)?;
        if stop_distance <= Decimal::ZERO {
            return None;
        }

        // Reward stretches with conviction above the threshold.
        let headroom = (breakdown.composite - self.settings.entry_threshold)
            / (100.0 - self.settings.entry_threshold).max(1.0);
        let rr = self.settings.min_risk_reward + headroom.max(0.0);
        let reward_distance = stop_distance * Decimal::from_f64(rr)?;

        let (stop_price, target_price) = match direction {
            Direction::Long => (last_close - stop_distance, last_close + reward_distance),
            Direction::Short => (last_close + stop_distance, last_close - reward_distance),
        };

        let priority = match breakdown.composite {
            s if s >= 90.0 => 5,
            s if s >= 80.0 => 4,
            s if s >= 70.0 => 3,
            s if s >= 60.0 => 2,
            _ => 1,
        };

        Signal::try_new(
            symbol,
            direction,
            breakdown.composite,
            calibrated_confidence,
            last_close,
            stop_price,
            target_price,
            priority,
            evidence,
            now,
            now + Duration::seconds(self.settings.signal_ttl_secs),
        )
    }
}

// ---------------------------------------------------------------------------
// Component functions
// ---------------------------------------------------------------------------

/// Trend, momentum, volatility and volume from one snapshot.
fn technical_components(snapshot: &IndicatorSnapshot) -> ComponentScores {
    let mut c = ComponentScores::default();

    // ── Trend: EMA alignment (±4) + MACD sign (±3) + momentum (±3) ──────
    let mut trend = 0.0;
    match (
        snapshot.get("ema_20"),
        snapshot.get("ema_50"),
        snapshot.get("ema_200"),
    ) {
        (Some(e20), Some(e50), Some(e200)) => {
            if e20 > e50 && e50 > e200 {
                trend += 4.0;
            } else if e20 < e50 && e50 < e200 {
                trend -= 4.0;
            }
        }
        (Some(e20), Some(e50), None) => {
            if e20 > e50 {
                trend += 2.0;
            } else if e20 < e50 {
                trend -= 2.0;
            }
        }
        _ => {}
    }
    if let Some(hist) = snapshot.get("macd_hist") {
        if hist != 0.0 {
            trend += 3.0 * hist.signum();
        }
    }
    if let Some(roc) = snapshot.get("roc_10") {
        trend += 3.0 * (roc / 2.0).clamp(-1.0, 1.0);
    }
    c.trend = trend.clamp(-10.0, 10.0);

    // ── Momentum: mean of the available oscillators ─────────────────────
    let mut momentum_parts = Vec::new();
    if let Some(rsi) = snapshot.get("rsi_14") {
        if !snapshot.has_flag("rsi_degenerate") {
            momentum_parts.push(((rsi - 50.0) / 5.0).clamp(-10.0, 10.0));
        }
    }
    if let Some(k) = snapshot.get("stoch_k") {
        momentum_parts.push(((k - 50.0) / 5.0).clamp(-10.0, 10.0));
    }
    if let Some(cci) = snapshot.get("cci_20") {
        momentum_parts.push((cci / 20.0).clamp(-10.0, 10.0));
    }
    if let Some(mfi) = snapshot.get("mfi_14") {
        if !snapshot.has_flag("mfi_degenerate") {
            momentum_parts.push(((mfi - 50.0) / 5.0).clamp(-10.0, 10.0));
        }
    }
    if !momentum_parts.is_empty() {
        c.momentum = momentum_parts.iter().sum::<f64>() / momentum_parts.len() as f64;
    }

    // ── Volatility context: mid-range percentile is ideal ───────────────
    if let Some(p) = snapshot.get("atr_percentile") {
        c.volatility = (10.0 - (p - 50.0).abs() / 2.5).clamp(-10.0, 10.0);
    }

    // ── Volume confirmation ─────────────────────────────────────────────
    if let Some(ratio) = snapshot.get("vol_ratio") {
        c.volume = ((ratio - 1.0) * 10.0).clamp(-10.0, 10.0);
    }

    c
}

/// Pattern evidence: Σ bias × confidence × (strength/10) × learned weight.
fn pattern_component(patterns: &[Pattern], weights: &HashMap<PatternType, f64>) -> f64 {
    let mut total = 0.0;
    for p in patterns {
        let Some(bullish) = p.bullish_bias() else {
            continue; // direction-neutral patterns contribute no sign
        };
        let sign = if bullish { 1.0 } else { -1.0 };
        let weight = weights
            .get(&p.pattern_type)
            .copied()
            .unwrap_or(1.0)
            .clamp(0.5, 2.0);
        total += sign * p.confidence * (p.strength / 10.0) * weight;
    }
    (total * 5.0).clamp(-10.0, 10.0)
}

/// Analyst consensus: mean sentiment × confidence with a dispersion penalty.
fn analyst_component(verdicts: &[&AnalystVerdict]) -> f64 {
    if verdicts.is_empty() {
        return 0.0;
    }
    let n = verdicts.len() as f64;

    let weighted_mean: f64 = verdicts
        .iter()
        .map(|v| v.sentiment.as_f64() * v.confidence_or_neutral())
        .sum::<f64>()
        / n;

    let sentiment_mean: f64 = verdicts.iter().map(|v| v.sentiment.as_f64()).sum::<f64>() / n;
    let dispersion = (verdicts
        .iter()
        .map(|v| (v.sentiment.as_f64() - sentiment_mean).powi(2))
        .sum::<f64>()
        / n)
        .sqrt();

    let penalty = 1.0 - 0.5 * dispersion.min(1.0);
    (weighted_mean * 10.0 * penalty).clamp(-10.0, 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Sentiment;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::time::Duration as StdDuration;

    fn snapshot(tf: Timeframe, values: &[(&str, f64)]) -> IndicatorSnapshot {
        IndicatorSnapshot {
            symbol: "BTCUSD".into(),
            timeframe: tf,
            bar_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            values: values.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            flags: Vec::new(),
        }
    }

    fn verdict(sentiment: Sentiment, confidence: f64) -> AnalystVerdict {
        AnalystVerdict {
            analyst_id: "a".into(),
            sentiment,
            confidence: Some(confidence),
            rationale: String::new(),
            latency: StdDuration::from_millis(10),
            token_cost: 10,
            produced_at: Utc::now(),
            from_cache: false,
        }
    }

    fn bullish_features() -> BTreeMap<Timeframe, TimeframeFeatures> {
        let mut features = BTreeMap::new();
        for tf in [Timeframe::H1, Timeframe::H4] {
            let snap = snapshot(
                tf,
                &[
                    ("ema_20", 105.0),
                    ("ema_50", 103.0),
                    ("ema_200", 100.0),
                    ("macd_hist", 0.8),
                    ("roc_10", 2.5),
                    ("rsi_14", 62.0),
                    ("stoch_k", 70.0),
                    ("cci_20", 120.0),
                    ("mfi_14", 65.0),
                    ("atr_percentile", 55.0),
                    ("vol_ratio", 1.6),
                ],
            );
            let at = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
            let pattern = Pattern::new(
                PatternType::DoubleBottom,
                "BTCUSD",
                tf,
                0.8,
                7.0,
                vec![dec!(49000)],
                at,
            );
            features.insert(
                tf,
                TimeframeFeatures {
                    snapshot: snap,
                    patterns: vec![pattern],
                },
            );
        }
        features
    }

    fn bull_regime() -> RegimeState {
        RegimeState {
            regime: Regime::Bull,
            confidence: 0.8,
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn default_weights_validate() {
        assert!(ScorerWeights::default().validate().is_ok());
    }

    #[test]
    fn bad_weight_sum_rejected() {
        let w = ScorerWeights {
            trend: 0.24,
            ..ScorerWeights::default()
        };
        assert!(matches!(w.validate(), Err(ConfigError::WeightSum { .. })));
    }

    #[test]
    fn aligned_bullish_evidence_scores_long() {
        let scorer = ConfluenceScorer::new(ScorerSettings::default());
        let verdicts_owned = [verdict(Sentiment::Bullish, 0.75), verdict(Sentiment::Bullish, 0.82)];
        let verdicts: Vec<&AnalystVerdict> = verdicts_owned.iter().collect();

        let breakdown = scorer.evaluate(
            &bullish_features(),
            &verdicts,
            &bull_regime(),
            &HashMap::new(),
        );
        assert_eq!(breakdown.direction, Some(Direction::Long));
        assert!(breakdown.composite > 50.0, "composite {}", breakdown.composite);
        assert!(breakdown.raw_confidence > 0.5);
    }

    #[test]
    fn timeframe_weights_sum_to_one() {
        let scorer = ConfluenceScorer::new(ScorerSettings::default());
        let breakdown = scorer.evaluate(
            &bullish_features(),
            &[],
            &bull_regime(),
            &HashMap::new(),
        );
        let sum: f64 = breakdown.timeframe_weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn no_evidence_scores_flat() {
        let scorer = ConfluenceScorer::new(ScorerSettings::default());
        let mut features = BTreeMap::new();
        features.insert(
            Timeframe::H1,
            TimeframeFeatures {
                snapshot: snapshot(Timeframe::H1, &[]),
                patterns: Vec::new(),
            },
        );
        let breakdown = scorer.evaluate(&features, &[], &bull_regime(), &HashMap::new());
        assert_eq!(breakdown.direction, None);
        assert!(breakdown.composite < 1.0);
    }

    #[test]
    fn dispersion_penalty_reduces_analyst_component() {
        let agree_owned = [verdict(Sentiment::Bullish, 0.8), verdict(Sentiment::Bullish, 0.8)];
        let split_owned = [verdict(Sentiment::Bullish, 0.8), verdict(Sentiment::Bearish, 0.8)];
        let agree: Vec<&AnalystVerdict> = agree_owned.iter().collect();
        let split: Vec<&AnalystVerdict> = split_owned.iter().collect();
        assert!(analyst_component(&agree) > analyst_component(&split).abs());
    }

    #[test]
    fn pattern_weight_scales_contribution() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let p = Pattern::new(
            PatternType::DoubleBottom,
            "X",
            Timeframe::H1,
            0.8,
            8.0,
            vec![],
            at,
        );
        let patterns = vec![p];
        let mut heavy = HashMap::new();
        heavy.insert(PatternType::DoubleBottom, 2.0);
        let mut light = HashMap::new();
        light.insert(PatternType::DoubleBottom, 0.5);
        assert!(
            pattern_component(&patterns, &heavy) > pattern_component(&patterns, &light)
        );
    }

    #[test]
    fn emit_signal_honors_threshold_and_regime() {
        let settings = ScorerSettings {
            entry_threshold: 55.0,
            min_calibrated_confidence: 0.5,
            min_risk_reward: 2.5,
            stop_atr_multiplier: 2.0,
            ..ScorerSettings::default()
        };
        let scorer = ConfluenceScorer::new(settings);
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        let breakdown = ScoreBreakdown {
            composite: 55.0,
            direction: Some(Direction::Long),
            raw_confidence: 0.6,
            per_timeframe: BTreeMap::new(),
            timeframe_weights: BTreeMap::new(),
        };

        let signal = scorer
            .emit_signal(
                "BTCUSD",
                &breakdown,
                &bull_regime(),
                0.6,
                dec!(50000),
                500.0,
                vec!["bar:1".into()],
                now,
            )
            .expect("signal");
        // ATR 500 × 2.0 multiplier → stop 1000 below, RR 2.5 → target +2500.
        assert_eq!(signal.entry_price, dec!(50000));
        assert_eq!(signal.stop_price, dec!(49000));
        assert_eq!(signal.target_price, dec!(52500));
        assert!((signal.risk_reward - 2.5).abs() < 1e-9);

        // Below threshold: no emission.
        let weak = ScoreBreakdown {
            composite: 40.0,
            ..breakdown.clone()
        };
        assert!(scorer
            .emit_signal("BTCUSD", &weak, &bull_regime(), 0.6, dec!(50000), 500.0, vec![], now)
            .is_none());

        // Bull regime blocks shorts.
        let short = ScoreBreakdown {
            direction: Some(Direction::Short),
            ..breakdown
        };
        assert!(scorer
            .emit_signal("BTCUSD", &short, &bull_regime(), 0.6, dec!(50000), 500.0, vec![], now)
            .is_none());
    }
}
