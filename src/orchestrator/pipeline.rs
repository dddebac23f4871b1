// =============================================================================
// Symbol pipeline — one orchestrator tick for one symbol
// =============================================================================
//
// bars → indicators + patterns → analyst routing → confluence scoring →
// risk gate → execution → position lifecycle. Exits are evaluated before
// entries so a stop breach never waits behind a new admission. Feed
// impairment and SAFE_MODE suppress entries but never exits.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analysts::{AnalysisRequest, AnalystRouter, FeaturePack};
use crate::context::EngineContext;
use crate::error::ExecError;
use crate::execution::types::{OrderIntent, OrderType, TimeInForce};
use crate::execution::{ExecutionClient, ExecutionRecord};
use crate::feed::{SeriesKey, Timeframe};
use crate::indicators::compute_snapshot;
use crate::memory::TradeOutcome;
use crate::metrics::Metrics;
use crate::patterns::detect_all;
use crate::position::{ExitRequest, Position};
use crate::scoring::TimeframeFeatures;
use crate::scoring::{ConfluenceScorer, ScorerSettings};

/// Bars pulled per timeframe for one pass.
const WINDOW_BARS: usize = 250;
/// Volume-profile window inside the indicator snapshot.
const VOLUME_WINDOW: usize = 30;

/// Summary of one pipeline pass, consumed by the adaptive scheduler.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub symbol: String,
    /// ATR percentile of the primary timeframe; drives cadence adaptation.
    pub vol_percentile: Option<f64>,
    pub signal_id: Option<Uuid>,
    pub admitted: bool,
    pub reject_reason: Option<String>,
    pub exits_processed: usize,
    pub entries_suppressed: bool,
}

impl TickReport {
    fn quiet(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            vol_percentile: None,
            signal_id: None,
            admitted: false,
            reject_reason: None,
            exits_processed: 0,
            entries_suppressed: false,
        }
    }
}

/// Run one full tick for `symbol`.
pub async fn run_symbol_tick(
    ctx: &Arc<EngineContext>,
    router: &Arc<AnalystRouter>,
    exec: &Arc<ExecutionClient>,
    symbol: &str,
    safe_mode: bool,
) -> TickReport {
    Metrics::inc(&ctx.metrics.ticks_run);
    let config = ctx.config();
    let now = ctx.clock.now();
    let mut report = TickReport::quiet(symbol);

    let Some(instrument) = config.instruments.get(symbol).filter(|i| i.enabled) else {
        return report;
    };

    // ── 1. Features per timeframe ───────────────────────────────────────
    let priors = ctx.memory.snapshot().priors();
    let mut features: BTreeMap<Timeframe, TimeframeFeatures> = BTreeMap::new();
    for tf in &instrument.timeframes {
        let key = SeriesKey::new(symbol, *tf);
        let window = ctx.bars.window(&key, WINDOW_BARS);
        if let Some(snapshot) = compute_snapshot(&window, VOLUME_WINDOW) {
            let patterns = detect_all(&window, &priors);
            features.insert(
                *tf,
                TimeframeFeatures {
                    snapshot,
                    patterns,
                },
            );
        }
    }

    // ── 2. Regime from the slow timeframes ──────────────────────────────
    if let Some(h4) = features.get(&Timeframe::H4) {
        let d1 = features.get(&Timeframe::D1).map(|f| &f.snapshot);
        ctx.regime.detect(&h4.snapshot, d1, now);
    }

    let primary = primary_features(&features);
    report.vol_percentile = primary.and_then(|f| f.snapshot.get("atr_percentile"));

    // ── 3. Position maintenance before any entry work ───────────────────
    let mark = mark_price(ctx, symbol, instrument.timeframes.as_slice());
    if let Some(mark) = mark {
        let exits = ctx.positions.mark(symbol, mark, now);
        report.exits_processed = exits.len();
        for exit in exits {
            run_exit(ctx, exec, &exit).await;
        }
        refresh_unrealized(ctx, mark, symbol);
    }

    // ── 4. Entry suppression gates ──────────────────────────────────────
    if safe_mode || ctx.feed_health.is_impaired(symbol) {
        report.entries_suppressed = true;
        debug!(symbol, safe_mode, "entries suppressed this tick");
        return report;
    }
    let Some(primary) = primary else {
        return report; // not enough bars yet
    };

    // ── 5. Analyst routing ──────────────────────────────────────────────
    let regime_state = match ctx.regime.current() {
        Some(state) => state,
        None => return report,
    };
    let Some(last_close) = ctx
        .bars
        .last(&SeriesKey::new(symbol, primary.snapshot.timeframe))
        .map(|b| b.close)
    else {
        return report;
    };
    let request = AnalysisRequest {
        features: feature_pack(symbol, primary, last_close, &regime_state.regime.to_string()),
        policy: config.router.policy,
    };
    let outcome = router.route(&request).await;
    let verdicts = outcome.verdicts();

    // ── 6. Confluence scoring ───────────────────────────────────────────
    let scorer = ConfluenceScorer::new(scorer_settings(&config));
    let weights = ctx.memory.snapshot().weights.clone();
    let breakdown = scorer.evaluate(&features, &verdicts, &regime_state, &weights);
    let calibrated = ctx.calibrator.read().calibrate(breakdown.raw_confidence);

    let Some(atr) = primary.snapshot.get("atr_14") else {
        return report;
    };

    let evidence = collect_evidence(primary, &verdicts);
    let Some(signal) = scorer.emit_signal(
        symbol,
        &breakdown,
        &regime_state,
        calibrated,
        last_close,
        atr,
        evidence,
        now,
    ) else {
        debug!(
            symbol,
            composite = format!("{:.1}", breakdown.composite),
            "no signal this tick"
        );
        return report;
    };

    Metrics::inc(&ctx.metrics.signals_emitted);
    report.signal_id = Some(signal.signal_id);
    info!(
        symbol,
        signal_id = %signal.signal_id,
        direction = %signal.direction,
        score = format!("{:.1}", signal.confluence_score),
        confidence = format!("{:.2}", signal.calibrated_confidence),
        priority = signal.priority,
        "signal emitted"
    );

    // ── 7. Risk gate ────────────────────────────────────────────────────
    let admission = ctx.risk_gate.evaluate(
        &signal,
        &config.risk,
        instrument,
        0,
        safe_mode,
        now,
    );
    let intent = match admission {
        Ok(intent) => intent,
        Err(reason) => {
            Metrics::inc(&ctx.metrics.risk_rejects);
            report.reject_reason = Some(reason.to_string());
            let _ = ctx
                .audit(
                    "risk_reject",
                    json!({
                        "symbol": symbol,
                        "signal_id": signal.signal_id,
                        "priority": signal.priority,
                        "reason": reason.to_string(),
                    }),
                )
                .await;
            return report;
        }
    };

    // ── 8. Execution + position open ────────────────────────────────────
    match exec.submit(&intent).await {
        Ok(record) => {
            report.admitted = true;
            if record.filled_qty > Decimal::ZERO {
                let mut pattern_types: Vec<_> = primary
                    .patterns
                    .iter()
                    .map(|p| (p.pattern_type, p.confidence))
                    .collect();
                pattern_types
                    .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

                if let Some(position) = ctx.positions.open_from_fills(
                    &record,
                    &signal,
                    pattern_types.into_iter().map(|(t, _)| t).collect(),
                    breakdown.raw_confidence,
                    now,
                ) {
                    let _ = ctx.store.upsert_position(&position).await;
                    let _ = ctx
                        .audit(
                            "position_opened",
                            json!({
                                "position_id": position.position_id,
                                "symbol": symbol,
                                "quantity": position.quantity.to_string(),
                                "avg_entry": position.avg_entry.to_string(),
                            }),
                        )
                        .await;
                }
            }
            if record.is_terminal() && record.filled_qty < record.quantity {
                // Unfilled remainder never opened — shrink the reservation to
                // the filled share.
                let fraction = if record.quantity > Decimal::ZERO {
                    record.filled_qty / record.quantity
                } else {
                    Decimal::ZERO
                };
                ctx.risk_gate.shrink_reservation(intent.client_id, fraction);
            }
        }
        Err(e) => {
            report.reject_reason = Some(e.to_string());
            if matches!(e, ExecError::Permanent(_)) {
                ctx.risk_gate.release(intent.client_id);
                let _ = ctx
                    .audit(
                        "order_rejected",
                        json!({
                            "client_id": intent.client_id,
                            "symbol": symbol,
                            "reason": e.to_string(),
                        }),
                    )
                    .await;
            } else {
                warn!(symbol, error = %e, "entry submission deferred — will recover");
            }
        }
    }

    report
}

// ---------------------------------------------------------------------------
// Exits
// ---------------------------------------------------------------------------

/// Submit one idempotent exit order and apply its fills. An exit order that
/// went terminal without fully closing the position advances the attempt
/// counter so the next tick submits a fresh (still deterministic) client_id.
pub async fn run_exit(ctx: &Arc<EngineContext>, exec: &Arc<ExecutionClient>, exit: &ExitRequest) {
    let attempt = ctx
        .positions
        .get(exit.position_id)
        .map(|p| p.exit_attempts)
        .unwrap_or(0);

    match submit_exit(ctx, exec, exit, attempt).await {
        Ok(record) => {
            apply_exit_record(ctx, exit.position_id, &record).await;
            if record.is_terminal() && ctx.positions.get(exit.position_id).is_some() {
                ctx.positions.bump_exit_attempt(exit.position_id);
            }
        }
        Err(e) => {
            warn!(
                position_id = %exit.position_id,
                error = %e,
                "exit submission failed — retried next tick"
            );
        }
    }
}

/// Build and submit the market exit intent for a closing position.
pub async fn submit_exit(
    ctx: &Arc<EngineContext>,
    exec: &Arc<ExecutionClient>,
    exit: &ExitRequest,
    attempt: u32,
) -> Result<ExecutionRecord, ExecError> {
    let intent = OrderIntent {
        client_id: OrderIntent::derive_exit_client_id(exit.position_id, attempt),
        parent_signal_id: exit.position_id,
        attempt,
        symbol: exit.symbol.clone(),
        side: exit.direction.exit_side(),
        order_type: OrderType::Market,
        quantity: exit.quantity,
        limit_price: None,
        stop_price: None,
        time_in_force: TimeInForce::Ioc,
        risk_pct: 0.0,
        leverage: 0.0,
        created_at: ctx.clock.now(),
    };
    exec.submit(&intent).await
}

/// Apply an exit record's fills to the book and run close accounting for any
/// position that fully closed.
pub async fn apply_exit_record(
    ctx: &Arc<EngineContext>,
    position_id: Uuid,
    record: &ExecutionRecord,
) {
    let now = ctx.clock.now();
    for fill in &record.fills {
        if let Some(closed) = ctx
            .positions
            .apply_exit_fill(position_id, fill, Decimal::ZERO, now)
        {
            close_accounting(ctx, &closed).await;
        }
    }
    if let Some(open) = ctx.positions.get(position_id) {
        let _ = ctx.store.upsert_position(&open).await;
    }
}

/// Closed-position bookkeeping: realized P&L, reservation release, learning
/// memory, calibrator, persistence, audit.
pub async fn close_accounting(ctx: &Arc<EngineContext>, closed: &Position) {
    let now = ctx.clock.now();
    ctx.risk_gate.record_realized(closed.realized_pnl, now);
    ctx.risk_gate.release(closed.entry_client_id);

    if let Some(&pattern_type) = closed.pattern_types.first() {
        ctx.memory.record_outcome(TradeOutcome {
            position_id: closed.position_id,
            pattern_type,
            r_multiple: closed.r_multiple(),
            won: closed.realized_pnl > Decimal::ZERO,
            hold_secs: closed.hold_secs(now),
            closed_at: closed.closed_at.unwrap_or(now),
        });
    }
    ctx.calibrator
        .write()
        .record_outcome(closed.signal_raw_confidence, closed.realized_pnl > Decimal::ZERO);

    let _ = ctx.store.upsert_position(closed).await;
    let _ = ctx
        .audit(
            "position_closed",
            json!({
                "position_id": closed.position_id,
                "symbol": closed.symbol,
                "realized_pnl": closed.realized_pnl.to_string(),
                "fees": closed.fees.to_string(),
                "reason": closed.exit_reason.map(|r| r.to_string()),
            }),
        )
        .await;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The timeframe whose snapshot drives entries: H1 when present, else the
/// finest available.
fn primary_features(
    features: &BTreeMap<Timeframe, TimeframeFeatures>,
) -> Option<&TimeframeFeatures> {
    features
        .get(&Timeframe::H1)
        .or_else(|| features.values().next())
}

/// Latest close on the finest configured timeframe.
fn mark_price(ctx: &Arc<EngineContext>, symbol: &str, timeframes: &[Timeframe]) -> Option<Decimal> {
    let finest = timeframes.iter().min()?;
    ctx.bars
        .last(&SeriesKey::new(symbol, *finest))
        .map(|b| b.close)
}

/// Refresh the risk gate's mark-to-market view for this symbol's positions.
fn refresh_unrealized(ctx: &Arc<EngineContext>, mark: Decimal, symbol: &str) {
    let total: Decimal = ctx
        .positions
        .open_positions()
        .iter()
        .filter(|p| p.symbol == symbol)
        .map(|p| p.unrealized_pnl(mark))
        .sum();
    ctx.risk_gate.set_unrealized(total);
}

fn feature_pack(
    symbol: &str,
    primary: &TimeframeFeatures,
    last_close: Decimal,
    regime: &str,
) -> FeaturePack {
    FeaturePack {
        symbol: symbol.to_string(),
        timeframe: primary.snapshot.timeframe,
        last_close: last_close.to_f64().unwrap_or(0.0),
        indicators: primary.snapshot.values.clone(),
        patterns: primary
            .patterns
            .iter()
            .map(|p| (p.pattern_type.to_string(), p.confidence))
            .collect(),
        regime: regime.to_string(),
    }
}

fn collect_evidence(
    primary: &TimeframeFeatures,
    verdicts: &[&crate::analysts::AnalystVerdict],
) -> Vec<String> {
    let mut evidence = Vec::new();
    evidence.push(format!(
        "bar:{}:{}",
        primary.snapshot.timeframe, primary.snapshot.bar_time
    ));
    for p in &primary.patterns {
        evidence.push(format!("pattern:{}", p.pattern_type));
    }
    for v in verdicts {
        evidence.push(format!("verdict:{}", v.analyst_id));
    }
    evidence
}

fn scorer_settings(config: &crate::config::Config) -> ScorerSettings {
    ScorerSettings {
        weights: config.scorer.weights,
        entry_threshold: config.scorer.entry_threshold,
        min_calibrated_confidence: config.scorer.min_calibrated_confidence,
        min_risk_reward: config.scorer.min_risk_reward,
        stop_atr_multiplier: config.scorer.stop_atr_multiplier,
        signal_ttl_secs: config.scorer.signal_ttl_secs,
        timeframe_base_weights: config.scorer.timeframe_base_weights.clone(),
    }
}
