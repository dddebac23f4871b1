// =============================================================================
// Position Manager — per-position state machine and exact P&L
// =============================================================================
//
// Life-cycle:
//   Open -> Monitoring -> Adjusting -> Monitoring -> ... -> Closing -> Closed
//
// `Open` on first fill confirmation; each mark re-evaluates stop/target and
// the trailing rule; stop/target updates pass through `Adjusting` and are
// capped by `max_adjustments`; a breach moves to `Closing`, whose exit intent
// is idempotent; the terminal exit fill produces `Closed` with
//   realized_pnl = Σ exit_qty × (exit − avg_entry) × side_sign − fees − funding.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::execution::types::{ExecutionRecord, Fill};
use crate::patterns::PatternType;
use crate::scoring::Signal;
use crate::types::Direction;

/// Position life-cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    Open,
    Monitoring,
    Adjusting,
    Closing,
    Closed,
}

/// Why a position is being exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopHit,
    TargetHit,
    SafeModeClose,
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StopHit => "stop_hit",
            Self::TargetHit => "target_hit",
            Self::SafeModeClose => "safe_mode_close",
            Self::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// A request from the book to submit an exit order.
#[derive(Debug, Clone)]
pub struct ExitRequest {
    pub position_id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub reason: ExitReason,
}

/// One tracked position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    /// Remaining open quantity.
    pub quantity: Decimal,
    /// Quantity at open, before any partial exits.
    pub initial_quantity: Decimal,
    pub avg_entry: Decimal,
    pub stop: Decimal,
    /// The stop as placed at entry; R-multiples are measured against it.
    pub initial_stop: Decimal,
    pub target: Decimal,
    pub state: PositionState,
    pub opened_at: DateTime<Utc>,
    pub last_check_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub adjustments: u32,
    /// Exit submission attempts; each maps to its own deterministic
    /// exit client_id.
    #[serde(default)]
    pub exit_attempts: u32,
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    pub funding: Decimal,
    /// Most favourable price seen since open, drives the trailing rule.
    pub best_price: Decimal,
    /// Entry order key; the risk reservation is released under it.
    pub entry_client_id: Uuid,
    pub parent_signal_id: Uuid,
    /// Pattern types the entry signal cited, for outcome attribution.
    pub pattern_types: Vec<PatternType>,
    /// Raw scorer confidence the signal carried, for calibrator updates.
    pub signal_raw_confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<ExitReason>,
}

impl Position {
    fn sign(&self) -> Decimal {
        Decimal::from(self.direction.sign())
    }

    /// Mark-to-market P&L of the remaining quantity.
    pub fn unrealized_pnl(&self, mark: Decimal) -> Decimal {
        (mark - self.avg_entry) * self.quantity * self.sign()
    }

    /// Hold duration in seconds at `now` (or at close).
    pub fn hold_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.closed_at.unwrap_or(now) - self.opened_at).num_seconds()
    }

    /// Realized P&L measured in initial-risk units. Uses the stop as placed
    /// at entry, not the trailed one.
    pub fn r_multiple(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        let initial_risk = (self.avg_entry - self.initial_stop).abs() * self.initial_quantity;
        if initial_risk <= Decimal::ZERO {
            return 0.0;
        }
        (self.realized_pnl / initial_risk).to_f64().unwrap_or(0.0)
    }
}

/// Book configuration.
#[derive(Debug, Clone)]
pub struct BookSettings {
    pub max_adjustments: u32,
    /// Trail distance as a fraction of the best price (0.005 = 0.5 %).
    pub trail_pct: Decimal,
    /// Favourable move (as a multiple of initial risk) before trailing arms.
    pub trail_arm_r: Decimal,
}

impl Default for BookSettings {
    fn default() -> Self {
        Self {
            max_adjustments: 5,
            trail_pct: Decimal::new(5, 3), // 0.005
            trail_arm_r: Decimal::ONE,
        }
    }
}

/// Thread-safe owner of open and closed positions.
pub struct PositionBook {
    open: RwLock<Vec<Position>>,
    closed: RwLock<Vec<Position>>,
    settings: BookSettings,
}

impl PositionBook {
    pub fn new(settings: BookSettings) -> Self {
        Self {
            open: RwLock::new(Vec::new()),
            closed: RwLock::new(Vec::new()),
            settings,
        }
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    /// Open a position from the entry order's confirmed fills.
    pub fn open_from_fills(
        &self,
        record: &ExecutionRecord,
        signal: &Signal,
        pattern_types: Vec<PatternType>,
        raw_confidence: f64,
        now: DateTime<Utc>,
    ) -> Option<Position> {
        if record.filled_qty <= Decimal::ZERO {
            return None;
        }
        let avg_entry = record.avg_fill_price?;

        let position = Position {
            position_id: Uuid::new_v4(),
            symbol: record.symbol.clone(),
            direction: signal.direction,
            quantity: record.filled_qty,
            initial_quantity: record.filled_qty,
            avg_entry,
            stop: signal.stop_price,
            initial_stop: signal.stop_price,
            target: signal.target_price,
            state: PositionState::Open,
            opened_at: now,
            last_check_at: now,
            closed_at: None,
            adjustments: 0,
            exit_attempts: 0,
            realized_pnl: Decimal::ZERO,
            fees: record.total_fees(),
            funding: Decimal::ZERO,
            best_price: avg_entry,
            entry_client_id: record.client_id,
            parent_signal_id: signal.signal_id,
            pattern_types,
            signal_raw_confidence: raw_confidence,
            exit_reason: None,
        };

        info!(
            position_id = %position.position_id,
            symbol = %position.symbol,
            direction = %position.direction,
            quantity = %position.quantity,
            avg_entry = %position.avg_entry,
            stop = %position.stop,
            target = %position.target,
            "position opened"
        );

        self.open.write().push(position.clone());
        Some(position)
    }

    // -------------------------------------------------------------------------
    // Mark / monitoring
    // -------------------------------------------------------------------------

    /// Mark every open position of `symbol` at `price`. Returns exit requests
    /// for stop/target breaches. Trailing-stop updates transition through
    /// `Adjusting` and respect the adjustment cap.
    pub fn mark(&self, symbol: &str, price: Decimal, now: DateTime<Utc>) -> Vec<ExitRequest> {
        let mut exits = Vec::new();
        let mut open = self.open.write();

        for pos in open.iter_mut().filter(|p| p.symbol == symbol) {
            pos.last_check_at = now;
            if pos.state == PositionState::Open {
                pos.state = PositionState::Monitoring;
            }
            if pos.state == PositionState::Closing {
                // Still closing from an earlier tick — re-drive the exit.
                exits.push(ExitRequest {
                    position_id: pos.position_id,
                    symbol: pos.symbol.clone(),
                    direction: pos.direction,
                    quantity: pos.quantity,
                    reason: pos.exit_reason.unwrap_or(ExitReason::Manual),
                });
                continue;
            }
            if pos.state == PositionState::Closed {
                continue;
            }

            let is_long = pos.direction == Direction::Long;

            // ── Stop / target breaches ──────────────────────────────────
            let stop_hit = if is_long { price <= pos.stop } else { price >= pos.stop };
            let target_hit = if is_long { price >= pos.target } else { price <= pos.target };
            if stop_hit || target_hit {
                pos.state = PositionState::Closing;
                let reason = if stop_hit { ExitReason::StopHit } else { ExitReason::TargetHit };
                pos.exit_reason = Some(reason);
                exits.push(ExitRequest {
                    position_id: pos.position_id,
                    symbol: pos.symbol.clone(),
                    direction: pos.direction,
                    quantity: pos.quantity,
                    reason,
                });
                continue;
            }

            // ── Trailing rule ───────────────────────────────────────────
            let improved = if is_long { price > pos.best_price } else { price < pos.best_price };
            if improved {
                pos.best_price = price;

                let initial_risk = (pos.avg_entry - pos.stop).abs();
                let favourable = (price - pos.avg_entry).abs();
                let armed = initial_risk > Decimal::ZERO
                    && favourable >= initial_risk * self.settings.trail_arm_r;

                if armed && pos.adjustments < self.settings.max_adjustments {
                    let trail = if is_long {
                        pos.best_price * (Decimal::ONE - self.settings.trail_pct)
                    } else {
                        pos.best_price * (Decimal::ONE + self.settings.trail_pct)
                    };
                    let tightens = if is_long { trail > pos.stop } else { trail < pos.stop };
                    if tightens {
                        pos.state = PositionState::Adjusting;
                        pos.stop = trail;
                        pos.adjustments += 1;
                        pos.state = PositionState::Monitoring;
                        debug!(
                            position_id = %pos.position_id,
                            stop = %pos.stop,
                            adjustments = pos.adjustments,
                            "trailing stop tightened"
                        );
                    }
                }
            }
        }

        exits
    }

    /// Apply an operator/risk-driven stop/target adjustment. Respects the
    /// adjustment cap; returns false when the cap is exhausted or the
    /// position is not adjustable.
    pub fn adjust(
        &self,
        position_id: Uuid,
        new_stop: Option<Decimal>,
        new_target: Option<Decimal>,
    ) -> bool {
        let mut open = self.open.write();
        let Some(pos) = open.iter_mut().find(|p| p.position_id == position_id) else {
            return false;
        };
        if !matches!(pos.state, PositionState::Monitoring | PositionState::Open) {
            return false;
        }
        if pos.adjustments >= self.settings.max_adjustments {
            return false;
        }
        pos.state = PositionState::Adjusting;
        if let Some(stop) = new_stop {
            pos.stop = stop;
        }
        if let Some(target) = new_target {
            pos.target = target;
        }
        pos.adjustments += 1;
        pos.state = PositionState::Monitoring;
        true
    }

    /// Force a position into `Closing` (SAFE_MODE close-out, operator exit).
    /// Idempotent; returns the exit request when a close is (already) due.
    pub fn begin_close(&self, position_id: Uuid, reason: ExitReason) -> Option<ExitRequest> {
        let mut open = self.open.write();
        let pos = open.iter_mut().find(|p| p.position_id == position_id)?;
        if pos.state != PositionState::Closing {
            pos.state = PositionState::Closing;
            pos.exit_reason = Some(reason);
        }
        Some(ExitRequest {
            position_id: pos.position_id,
            symbol: pos.symbol.clone(),
            direction: pos.direction,
            quantity: pos.quantity,
            reason: pos.exit_reason.unwrap_or(reason),
        })
    }

    // -------------------------------------------------------------------------
    // Exit fills
    // -------------------------------------------------------------------------

    /// Apply one exit fill. The position closes when its remaining quantity
    /// reaches zero; the closed copy is returned for downstream accounting.
    pub fn apply_exit_fill(
        &self,
        position_id: Uuid,
        fill: &Fill,
        funding: Decimal,
        now: DateTime<Utc>,
    ) -> Option<Position> {
        let mut open = self.open.write();
        let idx = open.iter().position(|p| p.position_id == position_id)?;
        let pos = &mut open[idx];

        let qty = fill.qty.min(pos.quantity);
        if qty <= Decimal::ZERO {
            return None;
        }

        let sign = Decimal::from(pos.direction.sign());
        pos.realized_pnl += qty * (fill.price - pos.avg_entry) * sign;
        pos.fees += fill.fee;
        pos.funding += funding;
        pos.quantity -= qty;
        pos.last_check_at = now;

        if pos.quantity > Decimal::ZERO {
            return None; // partial exit — stays open
        }

        let mut closed = open.remove(idx);
        closed.state = PositionState::Closed;
        closed.closed_at = Some(now);
        // Net out costs once, at close.
        closed.realized_pnl -= closed.fees + closed.funding;

        info!(
            position_id = %closed.position_id,
            symbol = %closed.symbol,
            realized_pnl = %closed.realized_pnl,
            fees = %closed.fees,
            reason = ?closed.exit_reason,
            "position closed"
        );

        self.closed.write().push(closed.clone());
        Some(closed)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn open_positions(&self) -> Vec<Position> {
        self.open.read().clone()
    }

    pub fn closed_positions(&self, count: usize) -> Vec<Position> {
        let closed = self.closed.read();
        closed.iter().rev().take(count).cloned().collect()
    }

    pub fn get(&self, position_id: Uuid) -> Option<Position> {
        self.open
            .read()
            .iter()
            .find(|p| p.position_id == position_id)
            .cloned()
    }

    pub fn open_count(&self) -> usize {
        self.open.read().len()
    }

    /// Advance to the next exit attempt after the current exit order went
    /// terminal without closing the position (e.g. cancelled remainder).
    pub fn bump_exit_attempt(&self, position_id: Uuid) {
        if let Some(pos) = self
            .open
            .write()
            .iter_mut()
            .find(|p| p.position_id == position_id)
        {
            pos.exit_attempts += 1;
        }
    }

    /// Restore positions from the durable store after a restart. Idempotent:
    /// a position id already tracked is left untouched.
    pub fn restore(&self, positions: Vec<Position>) {
        let mut open = self.open.write();
        let mut closed = self.closed.write();
        for p in positions {
            let known = open.iter().any(|o| o.position_id == p.position_id)
                || closed.iter().any(|c| c.position_id == p.position_id);
            if known {
                continue;
            }
            if p.state == PositionState::Closed {
                closed.push(p);
            } else {
                open.push(p);
            }
        }
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new(BookSettings::default())
    }
}
