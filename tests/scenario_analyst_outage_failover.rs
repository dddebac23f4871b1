// Analyst outage: while one analyst fails, consensus routing still produces
// verdicts from the healthy pool, the failing analyst's circuit opens, and a
// probe closes it again once the outage ends.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use meridian::analysts::{AnalysisRequest, CircuitState, FeaturePack, RouteOutcome, RoutePolicy};
use meridian::feed::Timeframe;
use meridian::sim::SimAnalyst;
use meridian::types::Sentiment;

fn request(policy: RoutePolicy, tag: f64) -> AnalysisRequest {
    let mut indicators = BTreeMap::new();
    indicators.insert("rsi_14".to_string(), 45.0 + tag);
    AnalysisRequest {
        features: FeaturePack {
            symbol: "BTCUSD".into(),
            timeframe: Timeframe::H1,
            last_close: 50_000.0 + tag,
            indicators,
            patterns: Vec::new(),
            regime: "bull".into(),
        },
        policy,
    }
}

#[tokio::test]
async fn outage_fails_over_then_circuit_recovers() {
    let analysts = vec![
        SimAnalyst::new("a", Sentiment::Bullish, 0.9),
        SimAnalyst::new("b", Sentiment::Bullish, 0.7),
        SimAnalyst::new("c", Sentiment::Neutral, 0.6),
    ];
    let a = analysts[0].clone();
    let h = common::build_with_analysts(common::base_config(), analysts);

    // A goes dark. Consensus fans out to the whole pool each pass, so A
    // accumulates failures while B and C keep the verdicts flowing.
    a.set_failing(true);
    let mut tag = 0.0;
    for _ in 0..3 {
        tag += 1.0;
        match h.router.route(&request(RoutePolicy::Consensus, tag)).await {
            RouteOutcome::Consensus(verdicts) => {
                assert!(!verdicts.is_empty(), "healthy analysts must answer");
                assert!(verdicts.iter().all(|v| v.analyst_id != "a"));
            }
            other => panic!("expected consensus verdicts, got {other:?}"),
        }
        h.clock.advance(Duration::from_secs(5));
    }
    assert_eq!(h.router.circuit_state("a"), Some(CircuitState::Open));

    // While OPEN the router never dials A; single-candidate policies still
    // return verdicts (no quality collapse, only a smaller pool).
    tag += 1.0;
    match h.router.route(&request(RoutePolicy::AccuracyFirst, tag)).await {
        RouteOutcome::Verdict(v) => assert_ne!(v.analyst_id, "a"),
        other => panic!("expected fail-over verdict, got {other:?}"),
    }
    assert_eq!(h.router.circuit_state("a"), Some(CircuitState::Open));

    // Outage ends; after the cooldown the next consensus pass probes A and
    // the probe closes the circuit.
    a.set_failing(false);
    h.clock.advance(Duration::from_secs(61));
    tag += 1.0;
    match h.router.route(&request(RoutePolicy::Consensus, tag)).await {
        RouteOutcome::Consensus(verdicts) => {
            assert!(verdicts.iter().any(|v| v.analyst_id == "a"), "probe verdict expected");
        }
        other => panic!("expected consensus, got {other:?}"),
    }
    assert_eq!(h.router.circuit_state("a"), Some(CircuitState::Closed));
}
