// =============================================================================
// Confidence calibration — raw score confidence → realized win probability
// =============================================================================
//
// Primary: quantile-local adjustment — the empirical win rate of recent
// trades whose raw confidence fell near the query value. Fallback: a global
// Platt-style sigmoid updated online, used until enough local samples exist.
// Samples arrive from closed trades.
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Calibrator tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibratorSettings {
    /// Rolling sample window.
    pub window: usize,
    /// Local neighborhoods need at least this many samples.
    pub min_local_samples: usize,
    /// Half-width of the raw-confidence neighborhood.
    pub bandwidth: f64,
}

impl Default for CalibratorSettings {
    fn default() -> Self {
        Self {
            window: 200,
            min_local_samples: 12,
            bandwidth: 0.10,
        }
    }
}

/// Rolling calibrator with Platt fallback.
#[derive(Debug, Clone)]
pub struct ConfidenceCalibrator {
    settings: CalibratorSettings,
    samples: VecDeque<(f64, bool)>,
    platt_a: f64,
    platt_b: f64,
}

/// Learning rate for the online Platt update.
const PLATT_LR: f64 = 0.05;

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl ConfidenceCalibrator {
    pub fn new(settings: CalibratorSettings) -> Self {
        Self {
            settings,
            samples: VecDeque::new(),
            // sigmoid(2·0.5 − 1) = 0.5: near-identity before any data.
            platt_a: 2.0,
            platt_b: -1.0,
        }
    }

    /// Map a raw confidence to a calibrated one in [0, 1].
    pub fn calibrate(&self, raw: f64) -> f64 {
        let raw = raw.clamp(0.0, 1.0);

        let neighbors: Vec<bool> = self
            .samples
            .iter()
            .filter(|(r, _)| (r - raw).abs() <= self.settings.bandwidth)
            .map(|(_, won)| *won)
            .collect();

        if neighbors.len() >= self.settings.min_local_samples {
            let wins = neighbors.iter().filter(|&&w| w).count() as f64;
            let n = neighbors.len() as f64;
            // Laplace-smoothed local win rate.
            ((wins + 1.0) / (n + 2.0)).clamp(0.0, 1.0)
        } else {
            self.platt(raw)
        }
    }

    fn platt(&self, raw: f64) -> f64 {
        sigmoid(self.platt_a * raw + self.platt_b).clamp(0.0, 1.0)
    }

    /// Feed one closed-trade outcome: the raw confidence the signal carried
    /// and whether the trade won.
    pub fn record_outcome(&mut self, raw: f64, won: bool) {
        let raw = raw.clamp(0.0, 1.0);
        if self.samples.len() == self.settings.window {
            self.samples.pop_front();
        }
        self.samples.push_back((raw, won));

        // One online logistic-regression step keeps the fallback current.
        let y = if won { 1.0 } else { 0.0 };
        let p = self.platt(raw);
        let grad = p - y;
        self.platt_a -= PLATT_LR * grad * raw;
        self.platt_b -= PLATT_LR * grad;
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

impl Default for ConfidenceCalibrator {
    fn default() -> Self {
        Self::new(CalibratorSettings::default())
    }
}
