// =============================================================================
// EngineContext — shared state threaded from the orchestrator into components
// =============================================================================
//
// No component reaches for process-global state; everything flows through
// this context value. The active config is an immutable snapshot behind an
// atomic pointer swap: a hot reload installs a new Arc and in-flight
// pipelines keep the snapshot they started with.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::error;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::StoreError;
use crate::feed::{BarBuffer, FeedHealth};
use crate::memory::LearningMemory;
use crate::metrics::Metrics;
use crate::position::PositionBook;
use crate::risk::RiskGate;
use crate::scoring::{ConfidenceCalibrator, RegimeDetector};
use crate::store::{AuditRecord, StateStore};

/// Shared engine state. One instance per engine, wrapped in `Arc`.
pub struct EngineContext {
    config: RwLock<Arc<Config>>,
    /// Set when the most recent audit append failed; the orchestrator
    /// escalates this to SAFE_MODE.
    audit_failed: std::sync::atomic::AtomicBool,
    pub bars: Arc<BarBuffer>,
    pub feed_health: Arc<FeedHealth>,
    pub regime: Arc<RegimeDetector>,
    pub calibrator: RwLock<ConfidenceCalibrator>,
    pub memory: Arc<LearningMemory>,
    pub risk_gate: Arc<RiskGate>,
    pub positions: Arc<PositionBook>,
    pub store: Arc<dyn StateStore>,
    pub metrics: Arc<Metrics>,
    pub clock: Arc<dyn Clock>,
}

impl EngineContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        bars: Arc<BarBuffer>,
        feed_health: Arc<FeedHealth>,
        memory: Arc<LearningMemory>,
        risk_gate: Arc<RiskGate>,
        positions: Arc<PositionBook>,
        store: Arc<dyn StateStore>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            audit_failed: std::sync::atomic::AtomicBool::new(false),
            bars,
            feed_health,
            regime: Arc::new(RegimeDetector::new()),
            calibrator: RwLock::new(ConfidenceCalibrator::default()),
            memory,
            risk_gate,
            positions,
            store,
            metrics,
            clock,
        }
    }

    /// The active config snapshot. Cheap; callers keep the Arc for the
    /// duration of one pipeline pass.
    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    /// Atomically install a validated config. Applies from the next tick.
    pub fn install_config(&self, config: Arc<Config>) {
        *self.config.write() = config;
    }

    /// Append an audit event. Failure is surfaced to the caller — the
    /// orchestrator escalates an unwritable audit chain to SAFE_MODE.
    pub async fn audit(&self, kind: &str, payload: Value) -> Result<AuditRecord, StoreError> {
        use std::sync::atomic::Ordering;
        let result = self.store.append_audit(kind, payload, self.clock.now()).await;
        match &result {
            Ok(_) => self.audit_failed.store(false, Ordering::SeqCst),
            Err(e) => {
                error!(kind, error = %e, "audit append failed");
                self.audit_failed.store(true, Ordering::SeqCst);
            }
        }
        result
    }

    /// Whether the most recent audit append failed.
    pub fn audit_unhealthy(&self) -> bool {
        self.audit_failed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::feed::BarBuffer;
    use crate::memory::{BanditKind, LearningMemory};
    use crate::position::PositionBook;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn context() -> EngineContext {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        EngineContext::new(
            Config::default(),
            Arc::new(BarBuffer::new(500)),
            Arc::new(FeedHealth::new()),
            Arc::new(LearningMemory::new(BanditKind::Ucb1, 0.1)),
            Arc::new(RiskGate::new(dec!(100000), Utc::now())),
            Arc::new(PositionBook::default()),
            Arc::new(MemoryStore::new()),
            Arc::new(Metrics::new()),
            clock,
        )
    }

    #[test]
    fn config_swap_is_visible_to_new_readers() {
        let ctx = context();
        assert_eq!(ctx.config().risk.per_trade_risk_pct, 0.005);

        let mut updated = Config::default();
        updated.risk.per_trade_risk_pct = 0.01;
        ctx.install_config(Arc::new(updated));
        assert_eq!(ctx.config().risk.per_trade_risk_pct, 0.01);
    }

    #[test]
    fn old_snapshot_survives_swap() {
        let ctx = context();
        let snapshot = ctx.config();
        let mut updated = Config::default();
        updated.risk.per_trade_risk_pct = 0.02;
        ctx.install_config(Arc::new(updated));
        // The pipeline that grabbed the old snapshot still sees it.
        assert_eq!(snapshot.risk.per_trade_risk_pct, 0.005);
    }

    #[tokio::test]
    async fn audit_helper_appends() {
        let ctx = context();
        ctx.audit("test_event", serde_json::json!({ "k": 1 }))
            .await
            .unwrap();
        let records = ctx.store.audit_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, "test_event");
    }
}
