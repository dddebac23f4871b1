// =============================================================================
// Error taxonomy
// =============================================================================
//
// Errors are grouped by the subsystem that produces them. Feed and analyst
// errors are absorbed locally and degrade the affected decision; execution
// errors distinguish transient (retryable) from permanent (terminal); store
// errors escalate. Risk admission rejects are NOT errors — they are ordinary
// values (see `risk::RejectReason`).
// =============================================================================

use thiserror::Error;
use uuid::Uuid;

/// Market data ingestion failures.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("feed read timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),
}

impl FeedError {
    /// Classification label used by the parse-failure metrics.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::SchemaMismatch(_) => "schema_mismatch",
            Self::Timeout | Self::Transport(_) => "timeout",
        }
    }
}

/// Analyst invocation failures. A timeout counts as a failure for the
/// analyst's circuit breaker.
#[derive(Debug, Clone, Error)]
pub enum AnalystError {
    #[error("analyst call timed out")]
    Timeout,

    #[error("analyst quota exhausted")]
    Quota,

    #[error("analyst returned malformed output: {0}")]
    Malformed(String),

    #[error("analyst circuit is open")]
    CircuitOpen,

    #[error("analyst transport error: {0}")]
    Transport(String),
}

/// Execution gateway failures.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// Retryable: network hiccup, 5xx, rate-limit.
    #[error("transient venue error: {0}")]
    Transient(String),

    /// Terminal: validation failure, insufficient funds. Frees the risk
    /// reservation.
    #[error("permanent venue error: {0}")]
    Permanent(String),

    #[error("venue circuit is open")]
    CircuitOpen,

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl ExecError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Durable state store failures.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    #[error("write conflict: {0}")]
    Conflict(String),

    /// Unique-constraint hit on `client_id` — the intent already exists.
    /// Callers treat this as "load the existing row", not as a failure.
    #[error("intent already recorded for client_id {0}")]
    DuplicateClientId(Uuid),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Configuration validation failures. A rejected config never replaces the
/// active one.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("scorer weights sum to {sum:.6}, expected 1.0 (±1e-6)")]
    WeightSum { sum: f64 },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
