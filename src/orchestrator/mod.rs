// =============================================================================
// Orchestrator — scheduler, adaptive cadence, SAFE_MODE, hot config, health
// =============================================================================
//
// One control task owns the mode transitions and schedules per-symbol ticks.
// Each symbol runs at most one pipeline at a time; cross-symbol concurrency
// is capped by a semaphore. Cadence adapts per symbol to realized volatility
// and feed health. SAFE_MODE blocks new entries, cancels non-terminal
// intents, and (behind an explicit config flag) closes open positions; it
// lifts after the cooldown once losses are back inside limits.
// =============================================================================

pub mod health;
pub mod pipeline;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, warn};

use crate::analysts::AnalystRouter;
use crate::config::{Config, OrchestratorConfig};
use crate::context::EngineContext;
use crate::execution::ExecutionClient;
use crate::feed::FeedStatus;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::position::ExitReason;
use crate::types::{EngineMode, SafeModeReason};

pub use health::{ComponentHealth, ComponentStatus, HeartbeatRegistry};
pub use pipeline::{run_symbol_tick, TickReport};

/// Mutable orchestrator state. The control task is the only writer.
#[derive(Debug, Default)]
pub struct OrchestratorState {
    pub mode: EngineMode,
    pub safe_mode_until: Option<DateTime<Utc>>,
    pub safe_mode_reason: Option<SafeModeReason>,
    /// Current cadence per symbol, seconds.
    pub cadence_secs: HashMap<String, u64>,
    pub last_tick: HashMap<String, DateTime<Utc>>,
}

/// Operator commands accepted by the control task.
#[derive(Debug)]
pub enum ControlCommand {
    Stop { graceful: Duration },
    TriggerSafeMode { operator: String },
    ReloadConfig,
}

/// Health payload returned by the controller.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub mode: EngineMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_mode_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_mode_reason: Option<String>,
    pub parse_success_rate: f64,
    pub open_positions: usize,
    pub open_risk: Decimal,
    pub components: Vec<ComponentHealth>,
    pub analysts: Vec<crate::analysts::router::AnalystHealth>,
    pub feeds: HashMap<String, FeedStatus>,
}

/// Pick the cadence for a symbol from its volatility percentile and feed
/// health. High volatility speeds scanning up; a degraded or skewed feed
/// slows it to the maximum.
pub fn adapt_cadence(
    vol_percentile: Option<f64>,
    impaired: bool,
    config: &OrchestratorConfig,
) -> u64 {
    let base = if impaired {
        config.cadence_max_secs
    } else {
        match vol_percentile {
            Some(p) if p >= config.volatility_high_percentile => 15 * 60,
            Some(p) if p >= 50.0 => 30 * 60,
            Some(p) if p > config.volatility_low_percentile => 60 * 60,
            Some(_) => 4 * 60 * 60,
            None => 60 * 60,
        }
    };
    base.clamp(config.cadence_min_secs, config.cadence_max_secs)
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Handle through which the operator drives the engine.
#[derive(Clone)]
pub struct Controller {
    tx: mpsc::Sender<ControlCommand>,
    ctx: Arc<EngineContext>,
    state: Arc<RwLock<OrchestratorState>>,
    heartbeats: Arc<HeartbeatRegistry>,
    router: Arc<AnalystRouter>,
}

impl Controller {
    /// Stop the engine, letting in-flight pipelines drain for up to
    /// `graceful`.
    pub async fn stop(&self, graceful: Duration) {
        let _ = self.tx.send(ControlCommand::Stop { graceful }).await;
    }

    /// Operator-declared SAFE_MODE.
    pub async fn trigger_safe_mode(&self, operator: impl Into<String>) {
        let _ = self
            .tx
            .send(ControlCommand::TriggerSafeMode {
                operator: operator.into(),
            })
            .await;
    }

    /// Force a config reload outside the polling interval.
    pub async fn reload_config(&self) {
        let _ = self.tx.send(ControlCommand::ReloadConfig).await;
    }

    pub fn mode(&self) -> EngineMode {
        self.state.read().mode
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    pub fn health(&self) -> HealthReport {
        let state = self.state.read();
        HealthReport {
            mode: state.mode,
            safe_mode_until: state.safe_mode_until,
            safe_mode_reason: state.safe_mode_reason.as_ref().map(|r| r.to_string()),
            parse_success_rate: self.ctx.metrics.parse_success_rate(),
            open_positions: self.ctx.positions.open_count(),
            open_risk: self.ctx.risk_gate.total_open_risk(),
            components: self.heartbeats.report(),
            analysts: self.router.health(),
            feeds: self.ctx.feed_health.snapshot(),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    ctx: Arc<EngineContext>,
    router: Arc<AnalystRouter>,
    exec: Arc<ExecutionClient>,
    state: Arc<RwLock<OrchestratorState>>,
    heartbeats: Arc<HeartbeatRegistry>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    config_path: Option<PathBuf>,
    rx: mpsc::Receiver<ControlCommand>,
    last_recalibration: RwLock<DateTime<Utc>>,
}

impl Orchestrator {
    pub fn new(
        ctx: Arc<EngineContext>,
        router: Arc<AnalystRouter>,
        exec: Arc<ExecutionClient>,
        config_path: Option<PathBuf>,
    ) -> (Self, Controller) {
        let (tx, rx) = mpsc::channel(32);
        let state = Arc::new(RwLock::new(OrchestratorState::default()));
        let heartbeats = Arc::new(HeartbeatRegistry::new(
            ctx.clock.clone(),
            Duration::from_secs(30),
        ));
        let concurrency = ctx.config().orchestrator.concurrency;
        let now = ctx.clock.now();

        let controller = Controller {
            tx,
            ctx: ctx.clone(),
            state: state.clone(),
            heartbeats: heartbeats.clone(),
            router: router.clone(),
        };
        let orchestrator = Self {
            ctx,
            router,
            exec,
            state,
            heartbeats,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            config_path,
            rx,
            last_recalibration: RwLock::new(now),
        };
        (orchestrator, controller)
    }

    /// Start and run until a stop command. Recovery runs first: non-terminal
    /// intents converge at the venue, positions and learning memory restore
    /// from the store.
    pub async fn run(mut self) {
        self.startup().await;

        let mut scheduler = tokio::time::interval(Duration::from_secs(1));
        scheduler.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let reload_secs = self
            .ctx
            .config()
            .orchestrator
            .config_reload_interval_secs
            .max(1);
        let mut reload = tokio::time::interval(Duration::from_secs(reload_secs));
        reload.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let (report_tx, mut report_rx) = mpsc::channel::<TickReport>(64);
        let mut graceful = Duration::from_secs(30);

        loop {
            tokio::select! {
                Some(command) = self.rx.recv() => {
                    match command {
                        ControlCommand::Stop { graceful: g } => {
                            graceful = g;
                            self.state.write().mode = EngineMode::Stopping;
                        }
                        ControlCommand::TriggerSafeMode { operator } => {
                            self.enter_safe_mode(SafeModeReason::Operator(operator)).await;
                        }
                        ControlCommand::ReloadConfig => self.try_reload_config().await,
                    }
                }
                Some(report) = report_rx.recv() => self.absorb_report(report),
                _ = scheduler.tick() => {
                    self.heartbeats.beat("scheduler");
                    self.control_pass(&report_tx).await;
                }
                _ = reload.tick() => self.try_reload_config().await,
            }

            if self.state.read().mode == EngineMode::Stopping {
                break;
            }
        }

        self.drain(graceful).await;
        info!("orchestrator stopped");
    }

    /// Restart recovery and transition to RUNNING. `run` calls this first;
    /// embedders driving the control loop manually call it themselves.
    pub async fn startup(&self) {
        info!("orchestrator starting — running recovery");

        match self.exec.recover().await {
            Ok(recovered) if !recovered.is_empty() => {
                info!(count = recovered.len(), "intents recovered at startup");
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "intent recovery failed — entering SAFE_MODE");
                self.enter_safe_mode(SafeModeReason::ExecutionCritical).await;
            }
        }

        if let Ok(positions) = self.ctx.store.load_positions().await {
            let open = positions
                .iter()
                .filter(|p| p.state != crate::position::PositionState::Closed)
                .count();
            if open > 0 {
                info!(open, "positions restored from store");
            }
            self.ctx.positions.restore(positions);
        }

        if let Ok(Some(state)) = self.ctx.store.load_memory_state().await {
            self.ctx.memory.restore(state, self.ctx.clock.now());
            info!("learning memory restored from store");
        }

        {
            let mut state = self.state.write();
            if state.mode == EngineMode::Starting {
                state.mode = EngineMode::Running;
            }
        }
        let _ = self.ctx.audit("engine_started", json!({})).await;
    }

    /// One scheduling pass: limits, SAFE_MODE lifecycle, due symbols.
    pub async fn control_pass(&self, report_tx: &mpsc::Sender<TickReport>) {
        self.check_escalations().await;
        self.check_safe_mode_expiry().await;
        self.maybe_recalibrate().await;

        let mode = self.state.read().mode;
        if mode == EngineMode::Stopping {
            return;
        }
        let safe_mode = mode == EngineMode::SafeMode;

        let config = self.ctx.config();
        let now = self.ctx.clock.now();

        for symbol in config.enabled_symbols() {
            if !self.is_due(&symbol, now, &config.orchestrator) {
                continue;
            }
            if self.in_flight.lock().contains(&symbol) {
                continue; // per-symbol serialization
            }
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                break; // concurrency cap reached — remaining symbols wait
            };

            self.state.write().last_tick.insert(symbol.clone(), now);
            self.in_flight.lock().insert(symbol.clone());

            let ctx = self.ctx.clone();
            let router = self.router.clone();
            let exec = self.exec.clone();
            let in_flight = self.in_flight.clone();
            let report_tx = report_tx.clone();
            let deadline = Duration::from_millis(config.orchestrator.tick_deadline_ms);

            tokio::spawn(async move {
                let outcome = tokio::time::timeout(
                    deadline,
                    run_symbol_tick(&ctx, &router, &exec, &symbol, safe_mode),
                )
                .await;
                match outcome {
                    Ok(report) => {
                        let _ = report_tx.send(report).await;
                    }
                    Err(_) => {
                        Metrics::inc(&ctx.metrics.ticks_deadline_exceeded);
                        warn!(symbol = %symbol, "tick exceeded its deadline — cancelled");
                    }
                }
                in_flight.lock().remove(&symbol);
                drop(permit);
            });
        }
    }

    /// Fold one tick report into the adaptive cadence.
    pub fn absorb_report(&self, report: TickReport) {
        let config = self.ctx.config();
        let impaired = self.ctx.feed_health.is_impaired(&report.symbol);
        let cadence = adapt_cadence(report.vol_percentile, impaired, &config.orchestrator);
        self.state
            .write()
            .cadence_secs
            .insert(report.symbol.clone(), cadence);
        self.heartbeats.beat("pipeline");
    }

    fn is_due(&self, symbol: &str, now: DateTime<Utc>, config: &OrchestratorConfig) -> bool {
        let state = self.state.read();
        let Some(last) = state.last_tick.get(symbol) else {
            return true; // never ticked
        };
        let cadence = state
            .cadence_secs
            .get(symbol)
            .copied()
            .unwrap_or(config.cadence_min_secs);
        (now - *last).num_seconds() >= cadence as i64
    }

    // -------------------------------------------------------------------------
    // SAFE_MODE lifecycle
    // -------------------------------------------------------------------------

    /// Escalation checks: loss limits and audit-chain health.
    async fn check_escalations(&self) {
        if self.state.read().mode != EngineMode::Running {
            return;
        }
        let config = self.ctx.config();
        if let Some(reason) = self.ctx.risk_gate.loss_breach(&config.risk, self.ctx.clock.now()) {
            self.enter_safe_mode(reason).await;
            return;
        }
        if self.ctx.audit_unhealthy() {
            self.enter_safe_mode(SafeModeReason::AuditUnavailable).await;
        }
    }

    /// Return to RUNNING once the cooldown elapsed and limits are respected.
    async fn check_safe_mode_expiry(&self) {
        let (mode, until) = {
            let state = self.state.read();
            (state.mode, state.safe_mode_until)
        };
        if mode != EngineMode::SafeMode {
            return;
        }
        let Some(until) = until else { return };
        let now = self.ctx.clock.now();
        if now < until {
            return;
        }

        let config = self.ctx.config();
        if self.ctx.risk_gate.loss_breach(&config.risk, self.ctx.clock.now()).is_some() {
            // Still in breach — extend the cooldown.
            let cooldown = chrono::Duration::seconds(config.risk.safe_mode_cooldown_secs as i64);
            self.state.write().safe_mode_until = Some(now + cooldown);
            return;
        }

        {
            let mut state = self.state.write();
            state.mode = EngineMode::Running;
            state.safe_mode_until = None;
            state.safe_mode_reason = None;
        }
        info!("SAFE_MODE lifted — back to RUNNING");
        let _ = self.ctx.audit("safe_mode_exit", json!({})).await;
    }

    /// Enter SAFE_MODE: block entries, cancel outstanding intents, and —
    /// behind the explicit config flag — close open positions.
    pub async fn enter_safe_mode(&self, reason: SafeModeReason) {
        {
            let mut state = self.state.write();
            if state.mode == EngineMode::SafeMode {
                return;
            }
            let config = self.ctx.config();
            state.mode = EngineMode::SafeMode;
            state.safe_mode_reason = Some(reason.clone());
            state.safe_mode_until = Some(
                self.ctx.clock.now()
                    + chrono::Duration::seconds(config.risk.safe_mode_cooldown_secs as i64),
            );
        }
        Metrics::inc(&self.ctx.metrics.safe_mode_entries);
        warn!(reason = %reason, "entering SAFE_MODE");
        let _ = self
            .ctx
            .audit("safe_mode_enter", json!({ "reason": reason.to_string() }))
            .await;

        // Cancel every non-terminal intent; fills that raced the cancel are
        // kept and their share of risk stays reserved.
        if let Ok(intents) = self.ctx.store.non_terminal_intents().await {
            for intent in intents {
                match self.exec.cancel(intent.client_id).await {
                    Ok(record) => {
                        let fraction = if record.quantity > Decimal::ZERO {
                            record.filled_qty / record.quantity
                        } else {
                            Decimal::ZERO
                        };
                        self.ctx
                            .risk_gate
                            .shrink_reservation(intent.client_id, fraction);
                    }
                    Err(e) => {
                        warn!(client_id = %intent.client_id, error = %e, "cancel failed during SAFE_MODE sweep");
                    }
                }
            }
        }

        // Optional close-out of open exposure.
        if self.ctx.config().risk.safe_mode_close_positions {
            for position in self.ctx.positions.open_positions() {
                if let Some(exit) = self
                    .ctx
                    .positions
                    .begin_close(position.position_id, ExitReason::SafeModeClose)
                {
                    pipeline::run_exit(&self.ctx, &self.exec, &exit).await;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Hot config reload
    // -------------------------------------------------------------------------

    /// Poll the config source; install on success, keep the old config and
    /// record a rejection otherwise. Never interrupts in-flight pipelines.
    pub async fn try_reload_config(&self) {
        let Some(path) = &self.config_path else { return };
        match Config::load(path) {
            Ok(config) => {
                self.ctx.install_config(Arc::new(config));
                Metrics::inc(&self.ctx.metrics.config_reloads);
                let _ = self.ctx.audit("config_reloaded", json!({})).await;
            }
            Err(e) => {
                Metrics::inc(&self.ctx.metrics.config_rejected);
                warn!(error = %e, "config reload rejected — keeping previous");
                let _ = self
                    .ctx
                    .audit("config_rejected", json!({ "error": e.to_string() }))
                    .await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Learning memory cadence
    // -------------------------------------------------------------------------

    async fn maybe_recalibrate(&self) {
        let config = self.ctx.config();
        let now = self.ctx.clock.now();
        let due = {
            let last = *self.last_recalibration.read();
            (now - last).num_seconds() >= config.orchestrator.recalibrate_interval_secs as i64
        };
        if !due {
            return;
        }
        *self.last_recalibration.write() = now;
        self.ctx.memory.recalibrate(now);
        let state = self.ctx.memory.to_state();
        if let Err(e) = self.ctx.store.save_memory_state(&state).await {
            warn!(error = %e, "memory state persist failed");
        }
        self.heartbeats.beat("memory");
    }

    /// Wait for in-flight pipelines to finish, bounded by `graceful`.
    async fn drain(&self, graceful: Duration) {
        let concurrency = self.ctx.config().orchestrator.concurrency as u32;
        let all = self
            .semaphore
            .clone()
            .acquire_many_owned(concurrency.max(1));
        if tokio::time::timeout(graceful, all).await.is_err() {
            warn!("graceful drain deadline hit — abandoning in-flight pipelines");
        }
        let _ = self.ctx.audit("engine_stopped", json!({})).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::default()
    }

    #[test]
    fn cadence_speeds_up_with_volatility() {
        let cfg = config();
        assert_eq!(adapt_cadence(Some(90.0), false, &cfg), 15 * 60);
        assert_eq!(adapt_cadence(Some(60.0), false, &cfg), 30 * 60);
        assert_eq!(adapt_cadence(Some(40.0), false, &cfg), 60 * 60);
        assert_eq!(adapt_cadence(Some(10.0), false, &cfg), 4 * 60 * 60);
    }

    #[test]
    fn impaired_feed_slows_to_max() {
        let cfg = config();
        assert_eq!(adapt_cadence(Some(95.0), true, &cfg), cfg.cadence_max_secs);
    }

    #[test]
    fn cadence_respects_bounds() {
        let mut cfg = config();
        cfg.cadence_min_secs = 1800;
        cfg.cadence_max_secs = 3600;
        assert_eq!(adapt_cadence(Some(95.0), false, &cfg), 1800);
        assert_eq!(adapt_cadence(Some(5.0), false, &cfg), 3600);
    }

    #[test]
    fn unknown_volatility_defaults_to_hourly() {
        let cfg = config();
        assert_eq!(adapt_cadence(None, false, &cfg), 60 * 60);
    }
}
