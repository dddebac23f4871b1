// =============================================================================
// Pattern Detector — chart patterns with confidence and salience
// =============================================================================
//
// Detectors are pure functions over a window of closed bars (plus indicator
// history where divergence needs it). Confidence blends the geometric fit
// with volume confirmation and the pattern type's historical hit-rate
// published by learning memory. Strength is an ordinal salience score in
// [0, 10]. Ties between simultaneous detections resolve by earlier
// detected_at, then by enum order.
// =============================================================================

pub mod breakout;
pub mod candlesticks;
pub mod divergence;
pub mod formations;
pub mod levels;

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::feed::{Bar, Timeframe};

/// Closed set of recognized chart patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PatternType {
    SupportBounce,
    ResistanceRejection,
    Breakout,
    TrendReversal,
    PinBar,
    Engulfing,
    Doji,
    DoubleBottom,
    DoubleTop,
    HeadAndShoulders,
    Triangle,
    Flag,
}

impl PatternType {
    pub const ALL: [PatternType; 12] = [
        Self::SupportBounce,
        Self::ResistanceRejection,
        Self::Breakout,
        Self::TrendReversal,
        Self::PinBar,
        Self::Engulfing,
        Self::Doji,
        Self::DoubleBottom,
        Self::DoubleTop,
        Self::HeadAndShoulders,
        Self::Triangle,
        Self::Flag,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SupportBounce => "support_bounce",
            Self::ResistanceRejection => "resistance_rejection",
            Self::Breakout => "breakout",
            Self::TrendReversal => "trend_reversal",
            Self::PinBar => "pin_bar",
            Self::Engulfing => "engulfing",
            Self::Doji => "doji",
            Self::DoubleBottom => "double_bottom",
            Self::DoubleTop => "double_top",
            Self::HeadAndShoulders => "head_and_shoulders",
            Self::Triangle => "triangle",
            Self::Flag => "flag",
        }
    }
}

impl std::fmt::Display for PatternType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected chart pattern.
#[derive(Debug, Clone, Serialize)]
pub struct Pattern {
    pub pattern_type: PatternType,
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Blended confidence in [0, 1].
    pub confidence: f64,
    /// Ordinal salience in [0, 10].
    pub strength: f64,
    /// Key price levels, sorted ascending, all positive.
    pub price_levels: Vec<Decimal>,
    pub detected_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

impl Pattern {
    /// Construct with invariants enforced: confidence clamped to [0, 1],
    /// strength to [0, 10], levels sorted ascending with non-positive values
    /// dropped.
    pub fn new(
        pattern_type: PatternType,
        symbol: impl Into<String>,
        timeframe: Timeframe,
        confidence: f64,
        strength: f64,
        mut price_levels: Vec<Decimal>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        price_levels.retain(|p| *p > Decimal::ZERO);
        price_levels.sort();
        Self {
            pattern_type,
            symbol: symbol.into(),
            timeframe,
            confidence: confidence.clamp(0.0, 1.0),
            strength: strength.clamp(0.0, 10.0),
            price_levels,
            detected_at,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Whether the pattern argues for a long (true) or short (false) entry.
    pub fn bullish_bias(&self) -> Option<bool> {
        match self.pattern_type {
            PatternType::SupportBounce | PatternType::DoubleBottom => Some(true),
            PatternType::ResistanceRejection
            | PatternType::DoubleTop
            | PatternType::HeadAndShoulders => Some(false),
            _ => self.metadata.get("bias").map(|b| b == "bullish"),
        }
    }
}

/// Historical hit-rates per pattern type, published by learning memory.
#[derive(Debug, Clone, Default)]
pub struct PatternPriors {
    hit_rates: HashMap<PatternType, f64>,
}

impl PatternPriors {
    pub fn new(hit_rates: HashMap<PatternType, f64>) -> Self {
        Self { hit_rates }
    }

    /// Historical win fraction for the pattern, neutral 0.5 when unseen.
    pub fn hit_rate(&self, pattern_type: PatternType) -> f64 {
        self.hit_rates
            .get(&pattern_type)
            .copied()
            .unwrap_or(0.5)
            .clamp(0.0, 1.0)
    }
}

/// Blend of a detector's geometric confidence with the historical prior.
fn blend_confidence(geometric: f64, prior: f64) -> f64 {
    (0.7 * geometric + 0.3 * prior).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Window view and pivots
// ---------------------------------------------------------------------------

/// f64 view of a bar window shared by the detectors.
pub(crate) struct PatternWindow {
    pub highs: Vec<f64>,
    pub lows: Vec<f64>,
    pub opens: Vec<f64>,
    pub closes: Vec<f64>,
    pub volumes: Vec<f64>,
}

impl PatternWindow {
    pub fn from_bars(bars: &[Bar]) -> Self {
        use rust_decimal::prelude::ToPrimitive;
        Self {
            highs: bars.iter().map(|b| b.high.to_f64().unwrap_or(0.0)).collect(),
            lows: bars.iter().map(|b| b.low.to_f64().unwrap_or(0.0)).collect(),
            opens: bars.iter().map(|b| b.open.to_f64().unwrap_or(0.0)).collect(),
            closes: bars.iter().map(|b| b.close.to_f64().unwrap_or(0.0)).collect(),
            volumes: bars.iter().map(|b| b.volume.to_f64().unwrap_or(0.0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.closes.len()
    }
}

/// A local extreme in the window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Pivot {
    pub index: usize,
    pub price: f64,
    pub is_high: bool,
}

/// Find local pivot highs/lows with `span` neighbors on each side.
pub(crate) fn find_pivots(highs: &[f64], lows: &[f64], span: usize) -> Vec<Pivot> {
    let n = highs.len();
    if n < 2 * span + 1 {
        return Vec::new();
    }
    let mut pivots = Vec::new();
    for i in span..n - span {
        let is_high = (i - span..=i + span).all(|j| highs[j] <= highs[i]);
        let is_low = (i - span..=i + span).all(|j| lows[j] >= lows[i]);
        if is_high {
            pivots.push(Pivot {
                index: i,
                price: highs[i],
                is_high: true,
            });
        }
        if is_low {
            pivots.push(Pivot {
                index: i,
                price: lows[i],
                is_high: false,
            });
        }
    }
    pivots
}

/// Convert an f64 price to an exact decimal level, dropping non-finite input.
pub(crate) fn level(price: f64) -> Option<Decimal> {
    if !price.is_finite() || price <= 0.0 {
        return None;
    }
    Decimal::from_f64(price)
}

// ---------------------------------------------------------------------------
// Top-level detection
// ---------------------------------------------------------------------------

/// Run every detector over the window and return patterns sorted by
/// (detected_at, type order).
pub fn detect_all(bars: &[Bar], priors: &PatternPriors) -> Vec<Pattern> {
    if bars.len() < 10 {
        return Vec::new();
    }

    let w = PatternWindow::from_bars(bars);
    let Some(last) = bars.last() else {
        return Vec::new();
    };
    let detected_at = last.close_time();
    let symbol = last.symbol.as_str();
    let timeframe = last.timeframe;

    let mut out = Vec::new();
    out.extend(candlesticks::detect(&w, symbol, timeframe, detected_at));
    out.extend(levels::detect(&w, symbol, timeframe, detected_at));
    out.extend(breakout::detect(&w, symbol, timeframe, detected_at));
    out.extend(divergence::detect(&w, symbol, timeframe, detected_at));
    out.extend(formations::detect(&w, symbol, timeframe, detected_at));

    for p in &mut out {
        p.confidence = blend_confidence(p.confidence, priors.hit_rate(p.pattern_type));
    }

    out.sort_by(|a, b| {
        a.detected_at
            .cmp(&b.detected_at)
            .then(a.pattern_type.cmp(&b.pattern_type))
    });
    out
}
