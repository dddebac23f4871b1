// =============================================================================
// Analyst Router — policy-driven fan-out with breakers and caching
// =============================================================================
//
// Candidates are ordered by the active policy, analysts with an OPEN circuit
// are skipped, and the router walks down the list until a verdict arrives.
// Exhausting the list yields `NoVerdict` — a value, not an error; the scorer
// proceeds without analyst evidence.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::metrics::Metrics;

use super::cache::VerdictCache;
use super::circuit::{CircuitBreaker, CircuitConfig, CircuitState};
use super::{AnalysisRequest, Analyst, AnalystVerdict, RoutePolicy};

/// Samples retained for latency quantiles.
const LATENCY_RING: usize = 64;
/// EWMA smoothing for success rate and recent confidence.
const EWMA_ALPHA: f64 = 0.2;

/// Router tunables.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub policy: RoutePolicy,
    /// Minimum measured success rate for cost/latency policies.
    pub min_success_rate: f64,
    /// p95 latency SLA for the cost-aware policy.
    pub sla_p95: Duration,
    /// Per-call deadline; slower responses count as failures.
    pub call_timeout: Duration,
    /// Fan-out width for the consensus policy.
    pub consensus_size: usize,
    pub cache_ttl: Duration,
    pub circuit: CircuitConfig,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            policy: RoutePolicy::AccuracyFirst,
            min_success_rate: 0.6,
            sla_p95: Duration::from_secs(3),
            call_timeout: Duration::from_secs(3),
            consensus_size: 3,
            cache_ttl: Duration::from_secs(60),
            circuit: CircuitConfig::default(),
        }
    }
}

impl RouterSettings {
    /// Build from the validated config section.
    pub fn from_config(config: &crate::config::RouterConfig) -> Self {
        Self {
            policy: config.policy,
            min_success_rate: config.min_success_rate,
            sla_p95: Duration::from_millis(config.sla_p95_ms),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            consensus_size: config.consensus_size,
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            circuit: CircuitConfig {
                failure_threshold: config.circuit.failures,
                window: Duration::from_secs(config.circuit.window_secs),
                cooldown: Duration::from_secs(config.circuit.cooldown_secs),
                cooldown_cap: Duration::from_secs(config.circuit.cooldown_cap_secs),
            },
        }
    }
}

/// Measured per-analyst performance.
#[derive(Debug, Clone)]
struct Stats {
    success_ewma: f64,
    recent_confidence: f64,
    latencies: VecDeque<Duration>,
    calls: u64,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            // Optimistic start so new analysts get traffic.
            success_ewma: 1.0,
            recent_confidence: 0.5,
            latencies: VecDeque::with_capacity(LATENCY_RING),
            calls: 0,
        }
    }
}

impl Stats {
    fn record(&mut self, success: bool, latency: Duration, confidence: Option<f64>) {
        self.calls += 1;
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_ewma = EWMA_ALPHA * outcome + (1.0 - EWMA_ALPHA) * self.success_ewma;
        if let Some(c) = confidence {
            self.recent_confidence =
                EWMA_ALPHA * c.clamp(0.0, 1.0) + (1.0 - EWMA_ALPHA) * self.recent_confidence;
        }
        if self.latencies.len() == LATENCY_RING {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn quantile(&self, q: f64) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<Duration> = self.latencies.iter().copied().collect();
        sorted.sort();
        let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
        sorted[idx]
    }

    fn p50(&self) -> Duration {
        self.quantile(0.50)
    }

    fn p95(&self) -> Duration {
        self.quantile(0.95)
    }
}

/// Health view of one analyst.
#[derive(Debug, Clone, Serialize)]
pub struct AnalystHealth {
    pub analyst_id: String,
    pub success_rate: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub calls: u64,
    pub circuit: CircuitState,
}

/// Result of routing one request.
#[derive(Debug, Clone)]
pub enum RouteOutcome {
    Verdict(AnalystVerdict),
    Consensus(Vec<AnalystVerdict>),
    /// Every candidate was exhausted. Not an error.
    NoVerdict,
}

impl RouteOutcome {
    /// All verdicts carried by this outcome (empty for `NoVerdict`).
    pub fn verdicts(&self) -> Vec<&AnalystVerdict> {
        match self {
            Self::Verdict(v) => vec![v],
            Self::Consensus(vs) => vs.iter().collect(),
            Self::NoVerdict => Vec::new(),
        }
    }
}

/// The analyst pool router.
pub struct AnalystRouter {
    analysts: Vec<Arc<dyn Analyst>>,
    stats: RwLock<HashMap<String, Stats>>,
    breakers: HashMap<String, CircuitBreaker>,
    cache: VerdictCache,
    settings: RouterSettings,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl AnalystRouter {
    pub fn new(
        analysts: Vec<Arc<dyn Analyst>>,
        settings: RouterSettings,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let mut breakers = HashMap::new();
        let mut stats = HashMap::new();
        for analyst in &analysts {
            let id = analyst.profile().analyst_id;
            breakers.insert(
                id.clone(),
                CircuitBreaker::new(id.clone(), settings.circuit.clone(), clock.clone()),
            );
            stats.insert(id, Stats::default());
        }
        let cache = VerdictCache::new(settings.cache_ttl, clock.clone());
        Self {
            analysts,
            stats: RwLock::new(stats),
            breakers,
            cache,
            settings,
            clock,
            metrics,
        }
    }

    /// Route one request under its policy tag.
    pub async fn route(&self, request: &AnalysisRequest) -> RouteOutcome {
        let hash = request.features.content_hash();
        self.cache.purge_expired();

        match request.policy {
            RoutePolicy::Consensus => self.route_consensus(request, &hash).await,
            policy => self.route_single(request, &hash, policy).await,
        }
    }

    async fn route_single(
        &self,
        request: &AnalysisRequest,
        hash: &str,
        policy: RoutePolicy,
    ) -> RouteOutcome {
        for analyst in self.ordered_candidates(policy) {
            if let Some(verdict) = self.call_one(&analyst, request, hash).await {
                return RouteOutcome::Verdict(verdict);
            }
        }
        Metrics::inc(&self.metrics.no_verdicts);
        debug!(symbol = %request.features.symbol, "all analyst candidates exhausted");
        RouteOutcome::NoVerdict
    }

    async fn route_consensus(&self, request: &AnalysisRequest, hash: &str) -> RouteOutcome {
        let chosen: Vec<Arc<dyn Analyst>> = self
            .ordered_candidates(RoutePolicy::AccuracyFirst)
            .into_iter()
            .take(self.settings.consensus_size.max(1))
            .collect();

        let calls = chosen.iter().map(|a| self.call_one(a, request, hash));
        let verdicts: Vec<AnalystVerdict> = join_all(calls).await.into_iter().flatten().collect();

        if verdicts.is_empty() {
            Metrics::inc(&self.metrics.no_verdicts);
            RouteOutcome::NoVerdict
        } else {
            RouteOutcome::Consensus(verdicts)
        }
    }

    /// One guarded call: cache, breaker, deadline, stats.
    async fn call_one(
        &self,
        analyst: &Arc<dyn Analyst>,
        request: &AnalysisRequest,
        hash: &str,
    ) -> Option<AnalystVerdict> {
        let id = analyst.profile().analyst_id;

        if let Some(cached) = self.cache.get(hash, &id) {
            Metrics::inc(&self.metrics.verdicts_cached);
            return Some(cached);
        }

        let breaker = self.breakers.get(&id)?;
        if !breaker.try_acquire() {
            return None;
        }

        let start = self.clock.monotonic();
        let outcome = tokio::time::timeout(self.settings.call_timeout, analyst.analyze(request)).await;
        let latency = self.clock.monotonic().saturating_sub(start);

        match outcome {
            Ok(Ok(mut verdict)) => {
                verdict.latency = latency;
                verdict.from_cache = false;
                breaker.on_success();
                self.stats
                    .write()
                    .entry(id.clone())
                    .or_default()
                    .record(true, latency, verdict.confidence);
                self.cache.put(hash, verdict.clone());
                Metrics::inc(&self.metrics.verdicts_returned);
                Some(verdict)
            }
            Ok(Err(e)) => {
                warn!(analyst = %id, error = %e, "analyst call failed");
                self.record_failure(&id, breaker, latency);
                None
            }
            Err(_elapsed) => {
                warn!(analyst = %id, timeout_ms = self.settings.call_timeout.as_millis() as u64, "analyst call timed out");
                self.record_failure(&id, breaker, latency);
                None
            }
        }
    }

    fn record_failure(&self, id: &str, breaker: &CircuitBreaker, latency: Duration) {
        breaker.on_failure();
        self.stats
            .write()
            .entry(id.to_string())
            .or_default()
            .record(false, latency, None);
        Metrics::inc(&self.metrics.analyst_failures);
    }

    /// Candidates ordered by the policy, OPEN circuits skipped.
    fn ordered_candidates(&self, policy: RoutePolicy) -> Vec<Arc<dyn Analyst>> {
        let stats = self.stats.read();
        let mut scored: Vec<(Arc<dyn Analyst>, Stats, f64)> = self
            .analysts
            .iter()
            .filter(|a| {
                let id = a.profile().analyst_id;
                self.breakers.get(&id).map(|b| b.is_callable()).unwrap_or(false)
            })
            .map(|a| {
                let s = stats
                    .get(&a.profile().analyst_id)
                    .cloned()
                    .unwrap_or_default();
                (a.clone(), s, a.profile().cost_per_token)
            })
            .collect();
        drop(stats);

        match policy {
            RoutePolicy::AccuracyFirst | RoutePolicy::Consensus => {
                scored.sort_by(|(_, a, _), (_, b, _)| {
                    let ka = a.success_ewma * a.recent_confidence;
                    let kb = b.success_ewma * b.recent_confidence;
                    kb.partial_cmp(&ka).unwrap_or(std::cmp::Ordering::Equal)
                });
            }
            RoutePolicy::CostAware => {
                // Qualified analysts first (threshold + SLA), each tier by cost.
                scored.sort_by(|(_, a, ca), (_, b, cb)| {
                    let qa = a.success_ewma >= self.settings.min_success_rate
                        && a.p95() <= self.settings.sla_p95;
                    let qb = b.success_ewma >= self.settings.min_success_rate
                        && b.p95() <= self.settings.sla_p95;
                    qb.cmp(&qa)
                        .then(ca.partial_cmp(cb).unwrap_or(std::cmp::Ordering::Equal))
                });
            }
            RoutePolicy::LatencyAware => {
                scored.sort_by(|(_, a, _), (_, b, _)| {
                    let qa = a.success_ewma >= self.settings.min_success_rate;
                    let qb = b.success_ewma >= self.settings.min_success_rate;
                    qb.cmp(&qa).then(a.p95().cmp(&b.p95()))
                });
            }
        }

        scored.into_iter().map(|(a, _, _)| a).collect()
    }

    /// Breaker state for one analyst.
    pub fn circuit_state(&self, analyst_id: &str) -> Option<CircuitState> {
        self.breakers.get(analyst_id).map(|b| b.state())
    }

    /// Health snapshot across the pool.
    pub fn health(&self) -> Vec<AnalystHealth> {
        let stats = self.stats.read();
        self.analysts
            .iter()
            .map(|a| {
                let id = a.profile().analyst_id;
                let s = stats.get(&id).cloned().unwrap_or_default();
                AnalystHealth {
                    success_rate: s.success_ewma,
                    p50_ms: s.p50().as_millis() as u64,
                    p95_ms: s.p95().as_millis() as u64,
                    calls: s.calls,
                    circuit: self
                        .breakers
                        .get(&id)
                        .map(|b| b.state())
                        .unwrap_or(CircuitState::Closed),
                    analyst_id: id,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysts::{AnalystProfile, FeaturePack};
    use crate::clock::SimClock;
    use crate::error::AnalystError;
    use crate::feed::Timeframe;
    use crate::types::Sentiment;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// Stub analyst: fails while `failing` is set, succeeds otherwise.
    struct StubAnalyst {
        id: String,
        cost: f64,
        confidence: f64,
        failing: AtomicBool,
        calls: AtomicU64,
    }

    impl StubAnalyst {
        fn new(id: &str, cost: f64, confidence: f64) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                cost,
                confidence,
                failing: AtomicBool::new(false),
                calls: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl Analyst for StubAnalyst {
        fn profile(&self) -> AnalystProfile {
            AnalystProfile {
                analyst_id: self.id.clone(),
                cost_per_token: self.cost,
                capacity: 4,
            }
        }

        async fn analyze(
            &self,
            _request: &AnalysisRequest,
        ) -> Result<AnalystVerdict, AnalystError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(AnalystError::Transport("stub outage".into()));
            }
            Ok(AnalystVerdict {
                analyst_id: self.id.clone(),
                sentiment: Sentiment::Bullish,
                confidence: Some(self.confidence),
                rationale: "stub".into(),
                latency: Duration::ZERO,
                token_cost: 10,
                produced_at: Utc::now(),
                from_cache: false,
            })
        }
    }

    fn request(policy: RoutePolicy) -> AnalysisRequest {
        AnalysisRequest {
            features: FeaturePack {
                symbol: "BTCUSD".into(),
                timeframe: Timeframe::H1,
                last_close: 50_000.0,
                indicators: Default::default(),
                patterns: Vec::new(),
                regime: "bull".into(),
            },
            policy,
        }
    }

    fn router(analysts: Vec<Arc<dyn Analyst>>, settings: RouterSettings) -> (Arc<SimClock>, AnalystRouter) {
        let clock = Arc::new(SimClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let metrics = Arc::new(Metrics::new());
        let r = AnalystRouter::new(analysts, settings, clock.clone(), metrics);
        (clock, r)
    }

    #[tokio::test]
    async fn returns_verdict_from_healthy_pool() {
        let a = StubAnalyst::new("alpha", 1.0, 0.8);
        let (_clock, r) = router(vec![a], RouterSettings::default());
        match r.route(&request(RoutePolicy::AccuracyFirst)).await {
            RouteOutcome::Verdict(v) => assert_eq!(v.analyst_id, "alpha"),
            other => panic!("expected verdict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn identical_request_hits_cache() {
        let a = StubAnalyst::new("alpha", 1.0, 0.8);
        let handle = a.clone();
        let (_clock, r) = router(vec![a], RouterSettings::default());

        let req = request(RoutePolicy::AccuracyFirst);
        let first = r.route(&req).await;
        assert!(matches!(first, RouteOutcome::Verdict(ref v) if !v.from_cache));
        let second = r.route(&req).await;
        match second {
            RouteOutcome::Verdict(v) => assert!(v.from_cache),
            other => panic!("expected cached verdict, got {other:?}"),
        }
        assert_eq!(handle.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn falls_back_when_first_candidate_fails() {
        let bad = StubAnalyst::new("bad", 0.5, 0.9);
        bad.failing.store(true, Ordering::SeqCst);
        let good = StubAnalyst::new("good", 2.0, 0.7);
        let (_clock, r) = router(vec![bad.clone(), good], RouterSettings::default());

        match r.route(&request(RoutePolicy::AccuracyFirst)).await {
            RouteOutcome::Verdict(v) => assert_eq!(v.analyst_id, "good"),
            other => panic!("expected fallback verdict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_pool_yields_no_verdict() {
        let a = StubAnalyst::new("a", 1.0, 0.8);
        let b = StubAnalyst::new("b", 1.0, 0.8);
        a.failing.store(true, Ordering::SeqCst);
        b.failing.store(true, Ordering::SeqCst);
        let (_clock, r) = router(vec![a, b], RouterSettings::default());

        assert!(matches!(
            r.route(&request(RoutePolicy::AccuracyFirst)).await,
            RouteOutcome::NoVerdict
        ));
    }

    #[tokio::test]
    async fn consensus_collects_multiple_verdicts() {
        let a = StubAnalyst::new("a", 1.0, 0.75);
        let b = StubAnalyst::new("b", 1.0, 0.82);
        let c = StubAnalyst::new("c", 1.0, 0.6);
        let (_clock, r) = router(vec![a, b, c], RouterSettings::default());

        match r.route(&request(RoutePolicy::Consensus)).await {
            RouteOutcome::Consensus(vs) => assert_eq!(vs.len(), 3),
            other => panic!("expected consensus, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeated_failures_open_circuit_then_probe_recovers() {
        let a = StubAnalyst::new("solo", 1.0, 0.8);
        let settings = RouterSettings {
            circuit: CircuitConfig {
                failure_threshold: 3,
                window: Duration::from_secs(60),
                cooldown: Duration::from_secs(30),
                cooldown_cap: Duration::from_secs(300),
            },
            ..RouterSettings::default()
        };
        let (clock, r) = router(vec![a.clone()], settings);

        a.failing.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            // Distinct feature packs defeat the cache.
            let mut req = request(RoutePolicy::AccuracyFirst);
            req.features.last_close += clock.monotonic().as_millis() as f64;
            clock.advance(Duration::from_millis(10));
            assert!(matches!(r.route(&req).await, RouteOutcome::NoVerdict));
        }
        assert_eq!(r.circuit_state("solo"), Some(CircuitState::Open));

        // While OPEN the analyst is skipped entirely.
        let calls_before = a.calls.load(Ordering::SeqCst);
        assert!(matches!(
            r.route(&request(RoutePolicy::AccuracyFirst)).await,
            RouteOutcome::NoVerdict
        ));
        assert_eq!(a.calls.load(Ordering::SeqCst), calls_before);

        // After cooldown a probe goes through and closes the circuit.
        a.failing.store(false, Ordering::SeqCst);
        clock.advance(Duration::from_secs(31));
        let mut req = request(RoutePolicy::AccuracyFirst);
        req.features.last_close = 51_234.0;
        match r.route(&req).await {
            RouteOutcome::Verdict(v) => assert_eq!(v.analyst_id, "solo"),
            other => panic!("expected probe verdict, got {other:?}"),
        }
        assert_eq!(r.circuit_state("solo"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn cost_aware_prefers_cheapest_qualified() {
        let cheap = StubAnalyst::new("cheap", 0.2, 0.6);
        let pricey = StubAnalyst::new("pricey", 5.0, 0.9);
        let (_clock, r) = router(vec![pricey, cheap], RouterSettings::default());

        match r.route(&request(RoutePolicy::CostAware)).await {
            RouteOutcome::Verdict(v) => assert_eq!(v.analyst_id, "cheap"),
            other => panic!("expected cheap verdict, got {other:?}"),
        }
    }
}
