// =============================================================================
// ExchangeVenue — the venue collaborator contract, plus tick/step rounding
// =============================================================================

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExecError;

use super::types::{Fill, OrderIntent, OrderStatus};

/// Venue-declared price and quantity increments for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSpec {
    /// Minimum price increment.
    pub tick: Decimal,
    /// Minimum quantity increment.
    pub step: Decimal,
}

/// Server-of-truth view of one order as reported by the venue.
#[derive(Debug, Clone)]
pub struct VenueReport {
    pub venue_order_id: String,
    pub status: OrderStatus,
    pub fills: Vec<Fill>,
}

/// Exchange access. Implementations own authentication and the wire format.
#[async_trait]
pub trait ExchangeVenue: Send + Sync {
    /// Create the order. The venue must treat `intent.client_id` as an
    /// idempotency key: a second submit with the same key is a no-op that
    /// returns the existing order.
    async fn submit(&self, intent: &OrderIntent) -> Result<VenueReport, ExecError>;

    /// Cancel the unfilled remainder.
    async fn cancel(&self, client_id: Uuid) -> Result<VenueReport, ExecError>;

    /// Look up an order by client id; `None` when the venue never saw it.
    async fn query(&self, client_id: Uuid) -> Result<Option<VenueReport>, ExecError>;

    fn symbol_spec(&self, symbol: &str) -> SymbolSpec;
}

/// Price rounding direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundMode {
    Down,
    Up,
}

/// Snap a price to the venue tick in the given direction.
pub fn snap_price(price: Decimal, tick: Decimal, mode: RoundMode) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    let remainder = price % tick;
    if remainder.is_zero() {
        return price;
    }
    let down = price - remainder;
    match mode {
        RoundMode::Down => down,
        RoundMode::Up => down + tick,
    }
}

/// Snap a quantity down to the venue step. Rounding down is the only safe
/// direction: it can never increase the risk taken.
pub fn snap_quantity(qty: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return qty;
    }
    qty - (qty % step)
}
