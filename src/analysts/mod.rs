// =============================================================================
// Analysts — model-backed market analysts behind a routing policy
// =============================================================================
//
// An `Analyst` is an external model endpoint with a declared profile (cost,
// capacity, latency SLA). The router fans requests out under a policy,
// guards every analyst with a circuit breaker, and caches verdicts by
// feature-pack hash. Concrete wire protocols live outside the core.
// =============================================================================

pub mod cache;
pub mod circuit;
pub mod router;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AnalystError;
use crate::feed::Timeframe;
use crate::types::Sentiment;

pub use cache::VerdictCache;
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState};
pub use router::{AnalystRouter, RouteOutcome, RouterSettings};

/// Routing policy for selecting analysts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePolicy {
    /// Highest success_rate × recent confidence first.
    AccuracyFirst,
    /// Cheapest analyst meeting the success-rate and SLA thresholds.
    CostAware,
    /// Lowest p95 latency meeting the success-rate threshold.
    LatencyAware,
    /// Fan out to K analysts and aggregate.
    Consensus,
}

impl Default for RoutePolicy {
    fn default() -> Self {
        Self::AccuracyFirst
    }
}

/// Declared, static properties of an analyst endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalystProfile {
    pub analyst_id: String,
    /// Cost per thousand tokens, in account currency.
    pub cost_per_token: f64,
    /// Maximum concurrent requests the endpoint accepts.
    pub capacity: u32,
}

/// Compact, typed feature pack sent to analysts. Field order is fixed and the
/// indicator map is ordered, so serialisation — and therefore the cache
/// hash — is deterministic.
#[derive(Debug, Clone, Serialize)]
pub struct FeaturePack {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub last_close: f64,
    pub indicators: BTreeMap<String, f64>,
    /// (pattern name, confidence) pairs for detected patterns.
    pub patterns: Vec<(String, f64)>,
    pub regime: String,
}

impl FeaturePack {
    /// Stable content hash used as the verdict-cache key.
    pub fn content_hash(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// One analysis request routed to the pool.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub features: FeaturePack,
    pub policy: RoutePolicy,
}

/// An analyst's opinion. Confidence may be missing; consumers substitute the
/// neutral midpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AnalystVerdict {
    pub analyst_id: String,
    pub sentiment: Sentiment,
    pub confidence: Option<f64>,
    pub rationale: String,
    pub latency: Duration,
    pub token_cost: u64,
    pub produced_at: DateTime<Utc>,
    /// True when served from the verdict cache instead of a live call.
    pub from_cache: bool,
}

impl AnalystVerdict {
    /// Confidence with the missing-value rule applied.
    pub fn confidence_or_neutral(&self) -> f64 {
        self.confidence.unwrap_or(0.5).clamp(0.0, 1.0)
    }
}

/// External analyst endpoint. `analyze` is expected to respect the per-call
/// deadline enforced by the router; a slow response is treated as a failure.
#[async_trait]
pub trait Analyst: Send + Sync {
    fn profile(&self) -> AnalystProfile;

    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalystVerdict, AnalystError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(close: f64) -> FeaturePack {
        let mut indicators = BTreeMap::new();
        indicators.insert("rsi_14".to_string(), 45.0);
        FeaturePack {
            symbol: "BTCUSD".into(),
            timeframe: Timeframe::H1,
            last_close: close,
            indicators,
            patterns: vec![("double_bottom".to_string(), 0.8)],
            regime: "bull".into(),
        }
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(pack(50_000.0).content_hash(), pack(50_000.0).content_hash());
    }

    #[test]
    fn content_hash_distinguishes_inputs() {
        assert_ne!(pack(50_000.0).content_hash(), pack(50_001.0).content_hash());
    }

    #[test]
    fn missing_confidence_defaults_neutral() {
        let v = AnalystVerdict {
            analyst_id: "a".into(),
            sentiment: Sentiment::Bullish,
            confidence: None,
            rationale: String::new(),
            latency: Duration::from_millis(10),
            token_cost: 0,
            produced_at: Utc::now(),
            from_cache: false,
        };
        assert_eq!(v.confidence_or_neutral(), 0.5);
    }
}
