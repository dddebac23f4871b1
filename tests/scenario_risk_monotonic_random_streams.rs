// Risk monotonicity: under a random stream of admissions and releases, the
// sum of reserved risk never exceeds the portfolio cap, the correlated-group
// caps hold, and leverage stays bounded.

mod common;

use chrono::Duration;
use meridian::clock::Clock;
use meridian::config::InstrumentConfig;
use meridian::feed::Timeframe;
use meridian::scoring::Signal;
use meridian::types::Direction;
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[test]
fn random_admission_stream_never_breaches_caps() {
    let mut config = common::base_config();
    config.risk.per_trade_risk_pct = 0.02;
    config.risk.portfolio_risk_cap = 0.08;
    config.risk.correlated_cap = 0.05;
    config.risk.leverage_cap = 3.0;
    config.risk.kelly_scale = 1.0;

    let h = common::build(config.clone());
    let now = h.clock.now();
    let equity = config.risk.starting_equity;
    let cap = equity * Decimal::from_f64(config.risk.portfolio_risk_cap).unwrap();
    let group_cap = equity * Decimal::from_f64(config.risk.correlated_cap).unwrap();
    let leverage_cap = equity * Decimal::from_f64(config.risk.leverage_cap).unwrap();

    let groups = ["majors", "alts", "metals"];
    let instrument = |group: &str| InstrumentConfig {
        enabled: true,
        timeframes: vec![Timeframe::H1],
        tick: dec!(0.5),
        step: dec!(0.001),
        correlation_group: Some(group.to_string()),
    };

    let mut rng = rand::rng();
    let mut admitted: Vec<(uuid::Uuid, String)> = Vec::new();

    for i in 0..300 {
        let group = groups[rng.random_range(0..groups.len())];
        let entry = 1_000.0 + rng.random_range(0.0..99_000.0);
        let stop_frac: f64 = rng.random_range(0.005..0.05);
        let rr: f64 = rng.random_range(1.0..4.0);
        let confidence: f64 = rng.random_range(0.05..0.95);
        let priority: u8 = rng.random_range(1..=5);

        let entry_d = Decimal::from_f64(entry).unwrap().round_dp(2);
        let stop_d = (entry_d * Decimal::from_f64(1.0 - stop_frac).unwrap()).round_dp(2);
        let target_d = (entry_d + (entry_d - stop_d) * Decimal::from_f64(rr).unwrap()).round_dp(2);

        let Some(signal) = Signal::try_new(
            format!("SYM{i}"),
            Direction::Long,
            60.0,
            confidence,
            entry_d,
            stop_d,
            target_d,
            priority,
            vec![],
            now,
            now + Duration::hours(1),
        ) else {
            continue; // rounding pushed RR under 1 — not an admissible signal
        };

        if let Ok(intent) = h.ctx.risk_gate.evaluate(
            &signal,
            &config.risk,
            &instrument(group),
            0,
            false,
            now,
        ) {
            admitted.push((intent.client_id, group.to_string()));
        }

        // The invariants must hold after every single admission attempt.
        assert!(
            h.ctx.risk_gate.total_open_risk() <= cap,
            "portfolio risk breached at step {i}"
        );
        for g in groups {
            assert!(
                h.ctx.risk_gate.group_open_risk(g) <= group_cap,
                "group {g} risk breached at step {i}"
            );
        }
        assert!(
            h.ctx.risk_gate.total_open_notional() <= leverage_cap,
            "leverage breached at step {i}"
        );

        // Occasionally a position closes and frees its reservation.
        if !admitted.is_empty() && rng.random_bool(0.25) {
            let idx = rng.random_range(0..admitted.len());
            let (key, _) = admitted.swap_remove(idx);
            h.ctx.risk_gate.release(key);
        }
    }

    assert!(h.ctx.risk_gate.total_open_risk() <= cap);
    assert!(!admitted.is_empty(), "stream should admit at least some signals");
}
