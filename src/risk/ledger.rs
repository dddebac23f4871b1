// =============================================================================
// Risk ledger — the single linearization point for portfolio invariants
// =============================================================================
//
// Every admitted order reserves its risk here before submission, under one
// short-held lock. Cap checks and the reservation insert happen atomically,
// so concurrent symbol pipelines can never jointly exceed a cap.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

/// One reserved slice of portfolio risk, keyed by the order's client id.
#[derive(Debug, Clone, Serialize)]
pub struct RiskReservation {
    pub key: Uuid,
    pub symbol: String,
    pub correlation_group: Option<String>,
    /// Amount at risk: quantity × stop distance.
    pub risk_amount: Decimal,
    /// Position notional: quantity × entry.
    pub notional: Decimal,
}

/// Caps evaluated atomically with the reservation.
#[derive(Debug, Clone, Copy)]
pub struct LedgerCaps {
    /// Maximum Σ risk across all reservations.
    pub portfolio_risk: Decimal,
    /// Maximum Σ risk within one correlation group.
    pub correlated_risk: Decimal,
    /// Maximum Σ notional (equity × leverage cap).
    pub total_notional: Decimal,
}

/// Why a reservation was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LedgerRefusal {
    PortfolioRiskCap,
    CorrelatedRiskCap,
    LeverageCap,
}

#[derive(Default)]
struct Inner {
    reservations: HashMap<Uuid, RiskReservation>,
}

/// Thread-safe reservation ledger.
#[derive(Default)]
pub struct RiskLedger {
    inner: Mutex<Inner>,
}

impl RiskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically check every cap and reserve. Nothing is recorded when any
    /// cap would be breached.
    pub fn try_reserve(
        &self,
        reservation: RiskReservation,
        caps: &LedgerCaps,
    ) -> Result<(), LedgerRefusal> {
        let mut inner = self.inner.lock();

        let total_risk: Decimal = inner.reservations.values().map(|r| r.risk_amount).sum();
        if total_risk + reservation.risk_amount > caps.portfolio_risk {
            return Err(LedgerRefusal::PortfolioRiskCap);
        }

        if let Some(group) = &reservation.correlation_group {
            let group_risk: Decimal = inner
                .reservations
                .values()
                .filter(|r| r.correlation_group.as_deref() == Some(group))
                .map(|r| r.risk_amount)
                .sum();
            if group_risk + reservation.risk_amount > caps.correlated_risk {
                return Err(LedgerRefusal::CorrelatedRiskCap);
            }
        }

        let total_notional: Decimal = inner.reservations.values().map(|r| r.notional).sum();
        if total_notional + reservation.notional > caps.total_notional {
            return Err(LedgerRefusal::LeverageCap);
        }

        inner.reservations.insert(reservation.key, reservation);
        Ok(())
    }

    /// Release a reservation (terminal order failure, position closed).
    pub fn release(&self, key: Uuid) -> Option<RiskReservation> {
        self.inner.lock().reservations.remove(&key)
    }

    /// Shrink a reservation to `fraction` of its size — a partial fill whose
    /// remainder was cancelled holds only the filled share of risk.
    pub fn shrink_to(&self, key: Uuid, fraction: Decimal) {
        let fraction = fraction.clamp(Decimal::ZERO, Decimal::ONE);
        let mut inner = self.inner.lock();
        if let Some(r) = inner.reservations.get_mut(&key) {
            r.risk_amount *= fraction;
            r.notional *= fraction;
        }
    }

    pub fn total_risk(&self) -> Decimal {
        self.inner
            .lock()
            .reservations
            .values()
            .map(|r| r.risk_amount)
            .sum()
    }

    pub fn total_notional(&self) -> Decimal {
        self.inner
            .lock()
            .reservations
            .values()
            .map(|r| r.notional)
            .sum()
    }

    pub fn group_risk(&self, group: &str) -> Decimal {
        self.inner
            .lock()
            .reservations
            .values()
            .filter(|r| r.correlation_group.as_deref() == Some(group))
            .map(|r| r.risk_amount)
            .sum()
    }

    pub fn reservation_count(&self) -> usize {
        self.inner.lock().reservations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn reservation(risk: Decimal, group: Option<&str>) -> RiskReservation {
        RiskReservation {
            key: Uuid::new_v4(),
            symbol: "BTCUSD".into(),
            correlation_group: group.map(String::from),
            risk_amount: risk,
            notional: risk * dec!(50),
        }
    }

    fn caps() -> LedgerCaps {
        LedgerCaps {
            portfolio_risk: dec!(1000),
            correlated_risk: dec!(600),
            total_notional: dec!(100000),
        }
    }

    #[test]
    fn reserve_and_release() {
        let ledger = RiskLedger::new();
        let r = reservation(dec!(400), None);
        let key = r.key;
        ledger.try_reserve(r, &caps()).unwrap();
        assert_eq!(ledger.total_risk(), dec!(400));

        ledger.release(key).unwrap();
        assert_eq!(ledger.total_risk(), dec!(0));
        assert_eq!(ledger.reservation_count(), 0);
    }

    #[test]
    fn portfolio_cap_is_monotonic() {
        let ledger = RiskLedger::new();
        ledger.try_reserve(reservation(dec!(600), None), &caps()).unwrap();
        ledger.try_reserve(reservation(dec!(300), None), &caps()).unwrap();
        // 600 + 300 + 200 > 1000 — refused, ledger unchanged.
        assert_eq!(
            ledger.try_reserve(reservation(dec!(200), None), &caps()),
            Err(LedgerRefusal::PortfolioRiskCap)
        );
        assert_eq!(ledger.total_risk(), dec!(900));
    }

    #[test]
    fn correlated_cap_applies_within_group() {
        let ledger = RiskLedger::new();
        ledger
            .try_reserve(reservation(dec!(400), Some("majors")), &caps())
            .unwrap();
        assert_eq!(
            ledger.try_reserve(reservation(dec!(300), Some("majors")), &caps()),
            Err(LedgerRefusal::CorrelatedRiskCap)
        );
        // A different group is unaffected.
        ledger
            .try_reserve(reservation(dec!(300), Some("alts")), &caps())
            .unwrap();
        assert_eq!(ledger.group_risk("majors"), dec!(400));
        assert_eq!(ledger.group_risk("alts"), dec!(300));
    }

    #[test]
    fn leverage_cap_checks_notional() {
        let ledger = RiskLedger::new();
        let tight = LedgerCaps {
            total_notional: dec!(10000),
            ..caps()
        };
        // notional = 300 × 50 = 15000 > 10000.
        assert_eq!(
            ledger.try_reserve(reservation(dec!(300), None), &tight),
            Err(LedgerRefusal::LeverageCap)
        );
    }

    #[test]
    fn shrink_scales_both_amounts() {
        let ledger = RiskLedger::new();
        let r = reservation(dec!(400), None);
        let key = r.key;
        ledger.try_reserve(r, &caps()).unwrap();

        ledger.shrink_to(key, dec!(0.5));
        assert_eq!(ledger.total_risk(), dec!(200));
        assert_eq!(ledger.total_notional(), dec!(10000));
    }
}
