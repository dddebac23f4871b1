pub mod client;
pub mod types;
pub mod venue;

pub use client::{ExecutionClient, RetrySettings};
pub use types::{ExecutionRecord, Fill, OrderIntent, OrderStatus, OrderType, TimeInForce};
pub use venue::{snap_price, snap_quantity, ExchangeVenue, RoundMode, SymbolSpec, VenueReport};
