// =============================================================================
// Risk Gate — admission control and position sizing
// =============================================================================
//
// Sizing takes the smaller of fractional Kelly and fixed-fraction risk, caps
// it at the maximum position size, and lot-aligns down. Admission then runs
// the portfolio invariants atomically against the ledger. Rejections are
// ordinary values with recorded reasons — never errors. Loss-limit tracking
// rolls daily and monthly windows and feeds the SAFE_MODE trigger.
// =============================================================================

use chrono::{DateTime, Datelike, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{DrawdownBasis, InstrumentConfig, RiskConfig};
use crate::execution::types::{OrderIntent, OrderType, TimeInForce};
use crate::execution::venue::snap_quantity;
use crate::scoring::Signal;
use crate::types::SafeModeReason;

use super::ledger::{LedgerCaps, LedgerRefusal, RiskLedger, RiskReservation};

/// Why a signal was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    SafeModeActive,
    SignalExpired,
    ZeroQuantity,
    PortfolioRiskCap,
    CorrelatedRiskCap,
    LeverageCap,
    DailyLossLimit,
    MonthlyLossLimit,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SafeModeActive => "SAFE_MODE active — new entries blocked",
            Self::SignalExpired => "signal expired before admission",
            Self::ZeroQuantity => "sized quantity is zero after lot alignment",
            Self::PortfolioRiskCap => "portfolio risk cap would be exceeded",
            Self::CorrelatedRiskCap => "correlated-group risk cap would be exceeded",
            Self::LeverageCap => "leverage cap would be exceeded",
            Self::DailyLossLimit => "daily loss limit reached",
            Self::MonthlyLossLimit => "monthly loss limit reached",
        };
        f.write_str(s)
    }
}

struct PnlWindows {
    daily_realized: Decimal,
    monthly_realized: Decimal,
    unrealized: Decimal,
    day: i64,
    month: (i32, u32),
}

/// The risk gate. One instance per engine; shared behind `Arc`.
pub struct RiskGate {
    ledger: RiskLedger,
    equity: RwLock<Decimal>,
    pnl: Mutex<PnlWindows>,
}

impl RiskGate {
    pub fn new(starting_equity: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            ledger: RiskLedger::new(),
            equity: RwLock::new(starting_equity),
            pnl: Mutex::new(PnlWindows {
                daily_realized: Decimal::ZERO,
                monthly_realized: Decimal::ZERO,
                unrealized: Decimal::ZERO,
                day: now.num_days_from_ce() as i64,
                month: (now.year(), now.month()),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    /// Size a signal and admit it against the portfolio invariants.
    ///
    /// `safe_mode` is supplied by the orchestrator; the gate never admits
    /// while it is set. Admission reserves risk in the ledger keyed by the
    /// intent's `client_id`.
    pub fn evaluate(
        &self,
        signal: &Signal,
        config: &RiskConfig,
        instrument: &InstrumentConfig,
        attempt: u32,
        safe_mode: bool,
        now: DateTime<Utc>,
    ) -> Result<OrderIntent, RejectReason> {
        if safe_mode {
            return Err(RejectReason::SafeModeActive);
        }
        if signal.is_expired(now) {
            return Err(RejectReason::SignalExpired);
        }
        // Loss limits gate admission before any sizing work.
        if let Some(reason) = self.loss_breach(config, now) {
            return Err(match reason {
                SafeModeReason::MonthlyLossBreach => RejectReason::MonthlyLossLimit,
                _ => RejectReason::DailyLossLimit,
            });
        }

        let equity = *self.equity.read();
        let quantity = self.size(signal, config, instrument, equity)?;

        let stop_distance = (signal.entry_price - signal.stop_price).abs();
        let reservation = RiskReservation {
            key: OrderIntent::derive_client_id(signal.signal_id, attempt),
            symbol: signal.symbol.clone(),
            correlation_group: instrument.correlation_group.clone(),
            risk_amount: quantity * stop_distance,
            notional: quantity * signal.entry_price,
        };

        let caps = self.caps(config, equity);
        self.ledger
            .try_reserve(reservation, &caps)
            .map_err(|refusal| {
                warn!(
                    symbol = %signal.symbol,
                    priority = signal.priority,
                    refusal = ?refusal,
                    "admission refused by ledger"
                );
                match refusal {
                    LedgerRefusal::PortfolioRiskCap => RejectReason::PortfolioRiskCap,
                    LedgerRefusal::CorrelatedRiskCap => RejectReason::CorrelatedRiskCap,
                    LedgerRefusal::LeverageCap => RejectReason::LeverageCap,
                }
            })?;

        let risk_pct = (quantity * stop_distance / equity).to_f64().unwrap_or(0.0);
        let leverage = ((self.ledger.total_notional()) / equity).to_f64().unwrap_or(0.0);

        debug!(
            symbol = %signal.symbol,
            quantity = %quantity,
            risk_pct = format!("{:.4}", risk_pct),
            "signal admitted"
        );

        Ok(OrderIntent {
            client_id: OrderIntent::derive_client_id(signal.signal_id, attempt),
            parent_signal_id: signal.signal_id,
            attempt,
            symbol: signal.symbol.clone(),
            side: signal.direction.entry_side(),
            order_type: OrderType::Limit,
            quantity,
            limit_price: Some(signal.entry_price),
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            risk_pct,
            leverage,
            created_at: now,
        })
    }

    /// Admit a batch, highest priority first. When caps contend, the
    /// lower-priority signals are the ones rejected.
    pub fn evaluate_batch(
        &self,
        mut signals: Vec<Signal>,
        config: &RiskConfig,
        instrument_for: impl Fn(&str) -> Option<InstrumentConfig>,
        safe_mode: bool,
        now: DateTime<Utc>,
    ) -> Vec<(Signal, Result<OrderIntent, RejectReason>)> {
        signals.sort_by(|a, b| b.priority.cmp(&a.priority));
        signals
            .into_iter()
            .map(|signal| {
                let outcome = match instrument_for(&signal.symbol) {
                    Some(instrument) => {
                        self.evaluate(&signal, config, &instrument, 0, safe_mode, now)
                    }
                    None => Err(RejectReason::ZeroQuantity),
                };
                (signal, outcome)
            })
            .collect()
    }

    /// min(fractional Kelly, fixed-fraction) sizing, capped and lot-aligned.
    fn size(
        &self,
        signal: &Signal,
        config: &RiskConfig,
        instrument: &InstrumentConfig,
        equity: Decimal,
    ) -> Result<Decimal, RejectReason> {
        let stop_distance = (signal.entry_price - signal.stop_price).abs();
        if stop_distance <= Decimal::ZERO || signal.entry_price <= Decimal::ZERO {
            return Err(RejectReason::ZeroQuantity);
        }

        // Fixed-fraction leg: risk budget / stop distance.
        let risk_budget = equity
            * Decimal::from_f64(config.per_trade_risk_pct).unwrap_or(Decimal::ZERO);
        let qty_fixed = risk_budget / stop_distance;

        // Kelly leg: f* = p − (1−p)/b, scaled down.
        let p = signal.calibrated_confidence;
        let b = signal.risk_reward.max(1.0);
        let kelly_fraction = (p - (1.0 - p) / b).max(0.0) * config.kelly_scale;
        let kelly_value = equity * Decimal::from_f64(kelly_fraction).unwrap_or(Decimal::ZERO);
        let qty_kelly = kelly_value / signal.entry_price;

        let mut quantity = qty_fixed.min(qty_kelly);

        // Absolute position-size ceiling.
        let max_value =
            equity * Decimal::from_f64(config.max_position_size_pct).unwrap_or(Decimal::ONE);
        let qty_cap = max_value / signal.entry_price;
        quantity = quantity.min(qty_cap);

        let quantity = snap_quantity(quantity, instrument.step);
        if quantity <= Decimal::ZERO {
            return Err(RejectReason::ZeroQuantity);
        }
        Ok(quantity)
    }

    fn caps(&self, config: &RiskConfig, equity: Decimal) -> LedgerCaps {
        let frac = |f: f64| Decimal::from_f64(f).unwrap_or(Decimal::ZERO);
        LedgerCaps {
            portfolio_risk: equity * frac(config.portfolio_risk_cap),
            correlated_risk: equity * frac(config.correlated_cap),
            total_notional: equity * frac(config.leverage_cap),
        }
    }

    // -------------------------------------------------------------------------
    // Reservations
    // -------------------------------------------------------------------------

    /// Release the reservation for a terminal-failed or closed order.
    pub fn release(&self, key: Uuid) {
        self.ledger.release(key);
    }

    /// Shrink a reservation after a partial fill + cancel: only the filled
    /// share of risk remains on the book.
    pub fn shrink_reservation(&self, key: Uuid, filled_fraction: Decimal) {
        self.ledger.shrink_to(key, filled_fraction);
    }

    pub fn total_open_risk(&self) -> Decimal {
        self.ledger.total_risk()
    }

    pub fn group_open_risk(&self, group: &str) -> Decimal {
        self.ledger.group_risk(group)
    }

    pub fn total_open_notional(&self) -> Decimal {
        self.ledger.total_notional()
    }

    // -------------------------------------------------------------------------
    // P&L windows and loss limits
    // -------------------------------------------------------------------------

    /// Record realized P&L from a closed position and adjust equity.
    pub fn record_realized(&self, pnl: Decimal, now: DateTime<Utc>) {
        self.maybe_roll(now);
        let mut windows = self.pnl.lock();
        windows.daily_realized += pnl;
        windows.monthly_realized += pnl;
        drop(windows);
        *self.equity.write() += pnl;
    }

    /// Refresh the mark-to-market component.
    pub fn set_unrealized(&self, unrealized: Decimal) {
        self.pnl.lock().unrealized = unrealized;
    }

    /// Whether a loss limit is currently breached. The orchestrator turns
    /// this into a SAFE_MODE transition. Rolls the daily/monthly windows
    /// first so a new UTC day clears yesterday's breach.
    pub fn loss_breach(&self, config: &RiskConfig, now: DateTime<Utc>) -> Option<SafeModeReason> {
        self.maybe_roll(now);
        let equity = *self.equity.read();
        if equity <= Decimal::ZERO {
            return Some(SafeModeReason::DailyLossBreach);
        }
        let windows = self.pnl.lock();

        let daily = match config.drawdown_basis {
            DrawdownBasis::Realized => windows.daily_realized,
            DrawdownBasis::MarkToMarket => windows.daily_realized + windows.unrealized,
        };
        let daily_loss = (-daily / equity).to_f64().unwrap_or(0.0);
        if daily_loss >= config.daily_loss_limit {
            return Some(SafeModeReason::DailyLossBreach);
        }

        // Monthly limit is measured on realized P&L only.
        let monthly_loss = (-windows.monthly_realized / equity).to_f64().unwrap_or(0.0);
        if monthly_loss >= config.monthly_loss_limit {
            return Some(SafeModeReason::MonthlyLossBreach);
        }
        None
    }

    /// Reset the rolling windows when the UTC day or month changes.
    fn maybe_roll(&self, now: DateTime<Utc>) {
        let mut windows = self.pnl.lock();
        let day = now.num_days_from_ce() as i64;
        if day != windows.day {
            windows.day = day;
            windows.daily_realized = Decimal::ZERO;
        }
        let month = (now.year(), now.month());
        if month != windows.month {
            windows.month = month;
            windows.monthly_realized = Decimal::ZERO;
        }
    }

    pub fn equity(&self) -> Decimal {
        *self.equity.read()
    }

    pub fn set_equity(&self, equity: Decimal) {
        *self.equity.write() = equity;
    }
}
