// =============================================================================
// Learning Memory — closed-trade outcomes → pattern weights via a bandit
// =============================================================================
//
// Each pattern type is a bandit arm. Closed trades contribute exactly once
// (keyed by position id) to rolling 30/60/90-day windows and to the arm's
// reward estimate. Recalibration normalizes expected rewards across arms
// into weights bounded to [0.5, 2.0], with an ε exploration floor so
// seldom-seen patterns are never starved. The scorer and pattern detectors
// consume a read-only published snapshot; memory never calls back into them.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::patterns::{PatternPriors, PatternType};

/// Weight bounds.
pub const WEIGHT_MIN: f64 = 0.5;
pub const WEIGHT_MAX: f64 = 2.0;

/// Bandit estimator flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BanditKind {
    EpsilonGreedy,
    Ucb1,
}

/// One closed-trade outcome attributed to a pattern type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub position_id: Uuid,
    pub pattern_type: PatternType,
    /// Realized P&L in initial-risk units.
    pub r_multiple: f64,
    pub won: bool,
    pub hold_secs: i64,
    pub closed_at: DateTime<Utc>,
}

/// Aggregates over one rolling window.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WindowStats {
    pub trades: u32,
    pub wins: u32,
    pub expectancy_r: f64,
    pub avg_hold_secs: f64,
}

impl WindowStats {
    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.5
        } else {
            self.wins as f64 / self.trades as f64
        }
    }
}

/// Bandit arm state for one pattern type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BanditArm {
    pub pulls: u64,
    pub reward_sum: f64,
}

impl BanditArm {
    fn mean_reward(&self) -> f64 {
        if self.pulls == 0 {
            0.5 // optimistic neutral
        } else {
            self.reward_sum / self.pulls as f64
        }
    }

    /// UCB1 upper bound given total pulls across all arms.
    fn ucb(&self, total_pulls: u64) -> f64 {
        if self.pulls == 0 || total_pulls == 0 {
            return 1.0; // unexplored arms float to the top
        }
        self.mean_reward() + (2.0 * (total_pulls as f64).ln() / self.pulls as f64).sqrt()
    }
}

/// Per-pattern performance state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternPerformance {
    pub pattern_type: PatternType,
    pub outcomes: VecDeque<TradeOutcome>,
    pub weight: f64,
    pub arm: BanditArm,
}

impl PatternPerformance {
    fn new(pattern_type: PatternType) -> Self {
        Self {
            pattern_type,
            outcomes: VecDeque::new(),
            weight: 1.0,
            arm: BanditArm::default(),
        }
    }

    /// Stats over the trailing `days`-day window ending at `now`.
    pub fn window(&self, days: i64, now: DateTime<Utc>) -> WindowStats {
        let cutoff = now - Duration::days(days);
        let mut stats = WindowStats::default();
        let mut r_sum = 0.0;
        let mut hold_sum = 0.0;
        for o in self.outcomes.iter().filter(|o| o.closed_at >= cutoff) {
            stats.trades += 1;
            if o.won {
                stats.wins += 1;
            }
            r_sum += o.r_multiple;
            hold_sum += o.hold_secs as f64;
        }
        if stats.trades > 0 {
            stats.expectancy_r = r_sum / stats.trades as f64;
            stats.avg_hold_secs = hold_sum / stats.trades as f64;
        }
        stats
    }
}

/// Read-only view published to the scorer and the pattern detectors.
#[derive(Debug, Clone, Default)]
pub struct WeightsSnapshot {
    pub weights: HashMap<PatternType, f64>,
    pub hit_rates: HashMap<PatternType, f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl WeightsSnapshot {
    pub fn priors(&self) -> PatternPriors {
        PatternPriors::new(self.hit_rates.clone())
    }
}

/// Serializable memory state for the durable store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryState {
    pub performance: Vec<PatternPerformance>,
    pub processed: Vec<Uuid>,
}

struct Inner {
    perf: HashMap<PatternType, PatternPerformance>,
    processed: HashSet<Uuid>,
}

/// The learning memory.
pub struct LearningMemory {
    inner: RwLock<Inner>,
    snapshot: RwLock<Arc<WeightsSnapshot>>,
    kind: BanditKind,
    epsilon: f64,
    /// Outcomes older than this horizon are evicted.
    horizon_days: i64,
}

/// Map an R-multiple into a [0, 1] bandit reward. −2R floors at 0; +4R caps
/// at 1; breakeven lands at 1/3.
fn reward_from_r(r: f64) -> f64 {
    ((r.clamp(-2.0, 4.0) + 2.0) / 6.0).clamp(0.0, 1.0)
}

impl LearningMemory {
    pub fn new(kind: BanditKind, epsilon: f64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                perf: HashMap::new(),
                processed: HashSet::new(),
            }),
            snapshot: RwLock::new(Arc::new(WeightsSnapshot::default())),
            kind,
            epsilon: epsilon.clamp(0.0, 1.0),
            horizon_days: 90,
        }
    }

    // -------------------------------------------------------------------------
    // Outcome ingestion
    // -------------------------------------------------------------------------

    /// Record one closed trade. Idempotent under replay: a position id seen
    /// before contributes nothing and returns false.
    pub fn record_outcome(&self, outcome: TradeOutcome) -> bool {
        let mut inner = self.inner.write();
        if !inner.processed.insert(outcome.position_id) {
            debug!(position_id = %outcome.position_id, "outcome already recorded — skipped");
            return false;
        }

        let horizon = outcome.closed_at - Duration::days(self.horizon_days);
        let perf = inner
            .perf
            .entry(outcome.pattern_type)
            .or_insert_with(|| PatternPerformance::new(outcome.pattern_type));

        perf.arm.pulls += 1;
        perf.arm.reward_sum += reward_from_r(outcome.r_multiple);
        perf.outcomes.push_back(outcome);
        while perf
            .outcomes
            .front()
            .is_some_and(|o| o.closed_at < horizon)
        {
            perf.outcomes.pop_front();
        }
        true
    }

    // -------------------------------------------------------------------------
    // Recalibration
    // -------------------------------------------------------------------------

    /// Recompute weights from the bandit estimates and publish a fresh
    /// snapshot. Called on the recalibration cadence (daily by default).
    pub fn recalibrate(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.write();
        let total_pulls: u64 = inner.perf.values().map(|p| p.arm.pulls).sum();

        // Expected-reward estimates per arm.
        let estimates: HashMap<PatternType, f64> = inner
            .perf
            .iter()
            .map(|(t, p)| {
                let est = match self.kind {
                    BanditKind::EpsilonGreedy => p.arm.mean_reward(),
                    BanditKind::Ucb1 => p.arm.ucb(total_pulls),
                };
                (*t, est)
            })
            .collect();

        let (lo, hi) = estimates.values().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });

        for (t, perf) in inner.perf.iter_mut() {
            let est = estimates.get(t).copied().unwrap_or(0.5);
            let exploit = if hi > lo {
                WEIGHT_MIN + (WEIGHT_MAX - WEIGHT_MIN) * (est - lo) / (hi - lo)
            } else {
                1.0
            };
            // ε of the weight mass stays neutral: seldom-seen patterns keep
            // at least that share of exploration.
            perf.weight = ((1.0 - self.epsilon) * exploit + self.epsilon * 1.0)
                .clamp(WEIGHT_MIN, WEIGHT_MAX);
        }

        let snapshot = WeightsSnapshot {
            weights: inner.perf.iter().map(|(t, p)| (*t, p.weight)).collect(),
            hit_rates: inner
                .perf
                .iter()
                .map(|(t, p)| (*t, p.window(90, now).win_rate()))
                .collect(),
            updated_at: Some(now),
        };
        drop(inner);

        info!(
            patterns = snapshot.weights.len(),
            "pattern weights recalibrated"
        );
        *self.snapshot.write() = Arc::new(snapshot);
    }

    /// The current published snapshot.
    pub fn snapshot(&self) -> Arc<WeightsSnapshot> {
        self.snapshot.read().clone()
    }

    /// Window stats for one pattern, for health/metrics surfaces.
    pub fn window_stats(
        &self,
        pattern_type: PatternType,
        days: i64,
        now: DateTime<Utc>,
    ) -> WindowStats {
        self.inner
            .read()
            .perf
            .get(&pattern_type)
            .map(|p| p.window(days, now))
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    pub fn to_state(&self) -> MemoryState {
        let inner = self.inner.read();
        MemoryState {
            performance: inner.perf.values().cloned().collect(),
            processed: inner.processed.iter().copied().collect(),
        }
    }

    /// Restore from a persisted state and publish a snapshot.
    pub fn restore(&self, state: MemoryState, now: DateTime<Utc>) {
        {
            let mut inner = self.inner.write();
            inner.perf = state
                .performance
                .into_iter()
                .map(|p| (p.pattern_type, p))
                .collect();
            inner.processed = state.processed.into_iter().collect();
        }
        self.recalibrate(now);
    }
}
