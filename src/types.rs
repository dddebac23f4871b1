// =============================================================================
// Shared types used across the Meridian orchestrator
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a trade signal or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short. Used in P&L arithmetic.
    pub fn sign(self) -> i64 {
        match self {
            Self::Long => 1,
            Self::Short => -1,
        }
    }

    /// The order side that opens a position in this direction.
    pub fn entry_side(self) -> Side {
        match self {
            Self::Long => Side::Buy,
            Self::Short => Side::Sell,
        }
    }

    /// The order side that closes a position in this direction.
    pub fn exit_side(self) -> Side {
        match self {
            Self::Long => Side::Sell,
            Self::Short => Side::Buy,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Order side as submitted to a venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Directional opinion returned by an analyst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sentiment {
    Bullish,
    Bearish,
    Neutral,
}

impl Sentiment {
    /// Numeric direction: +1 bullish, -1 bearish, 0 neutral.
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Bullish => 1.0,
            Self::Bearish => -1.0,
            Self::Neutral => 0.0,
        }
    }
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "BULLISH"),
            Self::Bearish => write!(f, "BEARISH"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Operating mode of the orchestrator control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineMode {
    Starting,
    Running,
    SafeMode,
    Stopping,
}

impl Default for EngineMode {
    fn default() -> Self {
        Self::Starting
    }
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::SafeMode => write!(f, "SAFE_MODE"),
            Self::Stopping => write!(f, "STOPPING"),
        }
    }
}

/// Why the engine entered SAFE_MODE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafeModeReason {
    DailyLossBreach,
    MonthlyLossBreach,
    AuditUnavailable,
    ExecutionCritical,
    Operator(String),
}

impl std::fmt::Display for SafeModeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DailyLossBreach => write!(f, "daily loss limit breached"),
            Self::MonthlyLossBreach => write!(f, "monthly loss limit breached"),
            Self::AuditUnavailable => write!(f, "audit chain cannot be written"),
            Self::ExecutionCritical => write!(f, "execution-critical component failed"),
            Self::Operator(who) => write!(f, "declared by operator: {who}"),
        }
    }
}
