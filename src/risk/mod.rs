pub mod gate;
pub mod ledger;

pub use gate::{RejectReason, RiskGate};
pub use ledger::{LedgerCaps, LedgerRefusal, RiskLedger, RiskReservation};
