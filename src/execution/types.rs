// =============================================================================
// Execution types — intents, fills, and the execution record
// =============================================================================
//
// `client_id` is derived deterministically from (signal_id, attempt) with
// UUIDv5, so every retry of the same attempt reuses the same key and the
// venue can never see a duplicate creation.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Side;

/// Order types the gateway understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

/// Lifecycle status of one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// One execution fill as confirmed by the venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    pub qty: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub ts: DateTime<Utc>,
}

/// A sized, validated order the risk gate admitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    /// Deterministic idempotency key; see [`OrderIntent::derive_client_id`].
    pub client_id: Uuid,
    pub parent_signal_id: Uuid,
    /// Submission attempt this intent belongs to (0 for the first).
    pub attempt: u32,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    /// Fraction of equity at risk, for audit.
    pub risk_pct: f64,
    pub leverage: f64,
    pub created_at: DateTime<Utc>,
}

impl OrderIntent {
    /// The canonical `client_id` derivation. Every call site — first submit
    /// or any retry — must use this, so the mapping is stable across
    /// restarts.
    pub fn derive_client_id(signal_id: Uuid, attempt: u32) -> Uuid {
        let name = format!("{signal_id}:{attempt}");
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }

    /// Deterministic key for exit orders, namespaced away from entry keys so
    /// a position's exit can never collide with its entry.
    pub fn derive_exit_client_id(position_id: Uuid, attempt: u32) -> Uuid {
        let name = format!("exit:{position_id}:{attempt}");
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }
}

/// Durable record of one order's life at the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub client_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub venue_order_id: Option<String>,
    pub status: OrderStatus,
    pub fills: Vec<Fill>,
    /// The intent quantity. Invariant: filled_qty + remaining_qty == quantity.
    pub quantity: Decimal,
    pub filled_qty: Decimal,
    pub remaining_qty: Decimal,
    /// Exact Σ(qty × price) / filled_qty.
    pub avg_fill_price: Option<Decimal>,
    pub last_update: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(intent: &OrderIntent, now: DateTime<Utc>) -> Self {
        Self {
            client_id: intent.client_id,
            symbol: intent.symbol.clone(),
            side: intent.side,
            venue_order_id: None,
            status: OrderStatus::Pending,
            fills: Vec::new(),
            quantity: intent.quantity,
            filled_qty: Decimal::ZERO,
            remaining_qty: intent.quantity,
            avg_fill_price: None,
            last_update: now,
        }
    }

    /// Append one fill atomically, keeping quantities and the exact average
    /// consistent. Overfills are clamped to the remaining quantity.
    pub fn apply_fill(&mut self, fill: Fill, now: DateTime<Utc>) {
        let qty = fill.qty.min(self.remaining_qty);
        if qty <= Decimal::ZERO {
            return;
        }
        let fill = Fill { qty, ..fill };

        self.filled_qty += qty;
        self.remaining_qty = self.quantity - self.filled_qty;
        self.fills.push(fill);

        let notional: Decimal = self.fills.iter().map(|f| f.qty * f.price).sum();
        self.avg_fill_price = if self.filled_qty > Decimal::ZERO {
            Some(notional / self.filled_qty)
        } else {
            None
        };

        if self.remaining_qty == Decimal::ZERO {
            self.status = OrderStatus::Filled;
        } else {
            self.status = OrderStatus::PartiallyFilled;
        }
        self.last_update = now;
    }

    /// Total fees across all fills.
    pub fn total_fees(&self) -> Decimal {
        self.fills.iter().map(|f| f.fee).sum()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn intent(qty: Decimal) -> OrderIntent {
        let signal_id = Uuid::new_v4();
        OrderIntent {
            client_id: OrderIntent::derive_client_id(signal_id, 0),
            parent_signal_id: signal_id,
            attempt: 0,
            symbol: "BTCUSD".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity: qty,
            limit_price: Some(dec!(50000)),
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            risk_pct: 0.005,
            leverage: 1.0,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn fill(qty: Decimal, price: Decimal) -> Fill {
        Fill {
            qty,
            price,
            fee: dec!(0.1),
            ts: Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap(),
        }
    }

    #[test]
    fn client_id_is_deterministic() {
        let signal_id = Uuid::new_v4();
        assert_eq!(
            OrderIntent::derive_client_id(signal_id, 0),
            OrderIntent::derive_client_id(signal_id, 0)
        );
        assert_ne!(
            OrderIntent::derive_client_id(signal_id, 0),
            OrderIntent::derive_client_id(signal_id, 1)
        );
    }

    #[test]
    fn partial_then_full_fill_weighted_average() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 2, 0).unwrap();
        let mut record = ExecutionRecord::new(&intent(dec!(0.5)), now);

        record.apply_fill(fill(dec!(0.25), dec!(50000)), now);
        assert_eq!(record.status, OrderStatus::PartiallyFilled);
        assert_eq!(record.filled_qty, dec!(0.25));
        assert_eq!(record.remaining_qty, dec!(0.25));
        assert_eq!(record.avg_fill_price, Some(dec!(50000)));

        record.apply_fill(fill(dec!(0.25), dec!(50100)), now);
        assert_eq!(record.status, OrderStatus::Filled);
        assert_eq!(record.filled_qty, dec!(0.5));
        assert_eq!(record.remaining_qty, dec!(0));
        assert_eq!(record.avg_fill_price, Some(dec!(50050)));
        assert_eq!(record.total_fees(), dec!(0.2));
    }

    #[test]
    fn quantities_always_reconcile() {
        let now = Utc::now();
        let mut record = ExecutionRecord::new(&intent(dec!(1)), now);
        for _ in 0..4 {
            record.apply_fill(fill(dec!(0.3), dec!(100)), now);
            assert_eq!(record.filled_qty + record.remaining_qty, record.quantity);
        }
        // Over-delivery clamped: 4 × 0.3 > 1.0 but the record caps at 1.0.
        assert_eq!(record.filled_qty, dec!(1));
        assert_eq!(record.status, OrderStatus::Filled);
    }

    #[test]
    fn zero_fill_ignored() {
        let now = Utc::now();
        let mut record = ExecutionRecord::new(&intent(dec!(1)), now);
        record.apply_fill(fill(dec!(0), dec!(100)), now);
        assert_eq!(record.status, OrderStatus::Pending);
        assert!(record.fills.is_empty());
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }
}
