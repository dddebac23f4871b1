// =============================================================================
// Indicator Engine — deterministic snapshots over bar windows
// =============================================================================
//
// Pure computation, no I/O. Bars carry exact decimals; the window is converted
// to f64 arrays once at this boundary because indicator outputs are bounded
// ratios and levels consumed only by scoring. Identical input windows produce
// identical snapshots.
// =============================================================================

pub mod atr;
pub mod bollinger;
pub mod cci;
pub mod ema;
pub mod macd;
pub mod mfi;
pub mod rsi;
pub mod stochastic;
pub mod volume_profile;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

use crate::feed::{Bar, Timeframe};

/// Minimum closed bars before a snapshot is emitted at all.
pub const MIN_BARS: usize = 30;

/// Named indicator values for one (symbol, timeframe) at one bar close.
///
/// Values that have not finished warming up are simply absent from the map;
/// downstream scoring degrades gracefully on absence. Degenerate readings
/// (constant-price RSI, zero-volume MFI) are emitted at the neutral midpoint
/// with a flag.
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorSnapshot {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub bar_time: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
    pub flags: Vec<String>,
}

impl IndicatorSnapshot {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }
}

/// Extracted f64 views of a bar window, oldest first.
struct WindowView {
    highs: Vec<f64>,
    lows: Vec<f64>,
    closes: Vec<f64>,
    volumes: Vec<f64>,
}

fn view(bars: &[Bar]) -> WindowView {
    WindowView {
        highs: bars.iter().map(|b| b.high.to_f64().unwrap_or(0.0)).collect(),
        lows: bars.iter().map(|b| b.low.to_f64().unwrap_or(0.0)).collect(),
        closes: bars.iter().map(|b| b.close.to_f64().unwrap_or(0.0)).collect(),
        volumes: bars.iter().map(|b| b.volume.to_f64().unwrap_or(0.0)).collect(),
    }
}

/// Build the full indicator snapshot for a window of closed bars.
///
/// Returns `None` when the window is too short to produce anything useful
/// (fewer than [`MIN_BARS`] bars) or empty.
pub fn compute_snapshot(bars: &[Bar], volume_window: usize) -> Option<IndicatorSnapshot> {
    if bars.len() < MIN_BARS {
        return None;
    }
    let last = bars.last()?;
    let w = view(bars);

    let mut values = BTreeMap::new();
    let mut flags = Vec::new();
    let put = |name: &str, v: Option<f64>, into: &mut BTreeMap<String, f64>| {
        if let Some(v) = v {
            if v.is_finite() {
                into.insert(name.to_string(), v);
            }
        }
    };

    // ── Moving averages ─────────────────────────────────────────────────
    put("ema_20", ema::ema(&w.closes, 20), &mut values);
    put("ema_50", ema::ema(&w.closes, 50), &mut values);
    put("ema_200", ema::ema(&w.closes, 200), &mut values);

    // ── RSI (constant-price window is degenerate) ───────────────────────
    let constant_price = w.closes.windows(2).all(|p| p[0] == p[1]);
    match rsi::rsi(&w.closes, 14) {
        Some(v) if constant_price => {
            values.insert("rsi_14".to_string(), v);
            flags.push("rsi_degenerate".to_string());
        }
        Some(v) => {
            values.insert("rsi_14".to_string(), v.clamp(0.0, 100.0));
        }
        None => {}
    }

    // ── MACD ────────────────────────────────────────────────────────────
    if let Some(m) = macd::macd_standard(&w.closes) {
        values.insert("macd".to_string(), m.macd);
        values.insert("macd_signal".to_string(), m.signal);
        values.insert("macd_hist".to_string(), m.histogram);
    }

    // ── Bollinger (lower ≤ mid ≤ upper by construction) ─────────────────
    if let Some(b) = bollinger::bollinger(&w.closes, 20, 2.0) {
        values.insert("bb_lower".to_string(), b.lower);
        values.insert("bb_mid".to_string(), b.middle);
        values.insert("bb_upper".to_string(), b.upper);
        values.insert("bb_width".to_string(), b.width_pct);
    }

    // ── ATR + percentile ────────────────────────────────────────────────
    put("atr_14", atr::atr(&w.highs, &w.lows, &w.closes, 14), &mut values);
    put(
        "atr_percentile",
        atr::atr_percentile(&w.highs, &w.lows, &w.closes, 14),
        &mut values,
    );

    // ── Stochastic ──────────────────────────────────────────────────────
    if let Some(s) = stochastic::stochastic_standard(&w.highs, &w.lows, &w.closes) {
        values.insert("stoch_k".to_string(), s.k.clamp(0.0, 100.0));
        values.insert("stoch_d".to_string(), s.d.clamp(0.0, 100.0));
    }

    // ── CCI ─────────────────────────────────────────────────────────────
    put("cci_20", cci::cci(&w.highs, &w.lows, &w.closes, 20), &mut values);

    // ── MFI (zero-volume window is degenerate) ──────────────────────────
    let zero_volume = w.volumes[w.volumes.len().saturating_sub(15)..]
        .iter()
        .all(|&v| v <= 0.0);
    match mfi::mfi(&w.highs, &w.lows, &w.closes, &w.volumes, 14) {
        Some(v) => {
            values.insert("mfi_14".to_string(), v.clamp(0.0, 100.0));
        }
        None if zero_volume && w.closes.len() >= 15 => {
            values.insert("mfi_14".to_string(), 50.0);
            flags.push("mfi_degenerate".to_string());
        }
        None => {}
    }

    // ── Volume profile ──────────────────────────────────────────────────
    let vp_window = volume_window.max(10).min(bars.len());
    if let Some(vp) = volume_profile::volume_profile(&w.closes, &w.volumes, vp_window, 12) {
        values.insert("vp_poc".to_string(), vp.poc);
        values.insert("vol_ratio".to_string(), vp.volume_ratio);
    }

    // ── Price momentum (rate of change over 10 bars) ────────────────────
    if w.closes.len() > 10 {
        let prev = w.closes[w.closes.len() - 11];
        if prev != 0.0 {
            let roc = (w.closes[w.closes.len() - 1] / prev - 1.0) * 100.0;
            if roc.is_finite() {
                values.insert("roc_10".to_string(), roc);
            }
        }
    }

    Some(IndicatorSnapshot {
        symbol: last.symbol.clone(),
        timeframe: last.timeframe,
        bar_time: last.open_time,
        values,
        flags,
    })
}
