// =============================================================================
// Metrics — lock-free counters with a serialisable snapshot
// =============================================================================
//
// Counters are plain atomics so any task may bump them without coordination.
// The snapshot is the payload returned by the controller's `metrics()` call.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Engine-wide counters. Wrapped in `Arc` and shared across all tasks.
#[derive(Debug, Default)]
pub struct Metrics {
    // ── Feed ────────────────────────────────────────────────────────────
    pub bars_ingested: AtomicU64,
    pub bars_out_of_order: AtomicU64,
    pub bars_duplicate: AtomicU64,
    pub bars_invalid: AtomicU64,
    pub parse_malformed: AtomicU64,
    pub parse_schema_mismatch: AtomicU64,
    pub parse_timeout: AtomicU64,
    pub clock_skew_events: AtomicU64,
    pub backfills: AtomicU64,

    // ── Analysts ────────────────────────────────────────────────────────
    pub verdicts_returned: AtomicU64,
    pub verdicts_cached: AtomicU64,
    pub no_verdicts: AtomicU64,
    pub analyst_failures: AtomicU64,

    // ── Pipeline ────────────────────────────────────────────────────────
    pub ticks_run: AtomicU64,
    pub ticks_deadline_exceeded: AtomicU64,
    pub signals_emitted: AtomicU64,

    // ── Risk / execution ────────────────────────────────────────────────
    pub risk_rejects: AtomicU64,
    pub intents_submitted: AtomicU64,
    pub exec_retries: AtomicU64,
    pub intents_recovered: AtomicU64,

    // ── Orchestrator ────────────────────────────────────────────────────
    pub safe_mode_entries: AtomicU64,
    pub config_reloads: AtomicU64,
    pub config_rejected: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub bars_ingested: u64,
    pub bars_out_of_order: u64,
    pub bars_duplicate: u64,
    pub bars_invalid: u64,
    pub parse_malformed: u64,
    pub parse_schema_mismatch: u64,
    pub parse_timeout: u64,
    pub clock_skew_events: u64,
    pub backfills: u64,
    pub verdicts_returned: u64,
    pub verdicts_cached: u64,
    pub no_verdicts: u64,
    pub analyst_failures: u64,
    pub ticks_run: u64,
    pub ticks_deadline_exceeded: u64,
    pub signals_emitted: u64,
    pub risk_rejects: u64,
    pub intents_submitted: u64,
    pub exec_retries: u64,
    pub intents_recovered: u64,
    pub safe_mode_entries: u64,
    pub config_reloads: u64,
    pub config_rejected: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump a counter by one.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Parse-success ratio since startup. The operational target is ≥ 0.99.
    pub fn parse_success_rate(&self) -> f64 {
        let ok = self.bars_ingested.load(Ordering::Relaxed);
        let failed = self.parse_malformed.load(Ordering::Relaxed)
            + self.parse_schema_mismatch.load(Ordering::Relaxed)
            + self.parse_timeout.load(Ordering::Relaxed);
        let total = ok + failed;
        if total == 0 {
            1.0
        } else {
            ok as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            bars_ingested: load(&self.bars_ingested),
            bars_out_of_order: load(&self.bars_out_of_order),
            bars_duplicate: load(&self.bars_duplicate),
            bars_invalid: load(&self.bars_invalid),
            parse_malformed: load(&self.parse_malformed),
            parse_schema_mismatch: load(&self.parse_schema_mismatch),
            parse_timeout: load(&self.parse_timeout),
            clock_skew_events: load(&self.clock_skew_events),
            backfills: load(&self.backfills),
            verdicts_returned: load(&self.verdicts_returned),
            verdicts_cached: load(&self.verdicts_cached),
            no_verdicts: load(&self.no_verdicts),
            analyst_failures: load(&self.analyst_failures),
            ticks_run: load(&self.ticks_run),
            ticks_deadline_exceeded: load(&self.ticks_deadline_exceeded),
            signals_emitted: load(&self.signals_emitted),
            risk_rejects: load(&self.risk_rejects),
            intents_submitted: load(&self.intents_submitted),
            exec_retries: load(&self.exec_retries),
            intents_recovered: load(&self.intents_recovered),
            safe_mode_entries: load(&self.safe_mode_entries),
            config_reloads: load(&self.config_reloads),
            config_rejected: load(&self.config_rejected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_success_rate_empty_is_one() {
        let m = Metrics::new();
        assert_eq!(m.parse_success_rate(), 1.0);
    }

    #[test]
    fn parse_success_rate_counts_failures() {
        let m = Metrics::new();
        for _ in 0..99 {
            Metrics::inc(&m.bars_ingested);
        }
        Metrics::inc(&m.parse_malformed);
        assert!((m.parse_success_rate() - 0.99).abs() < 1e-12);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let m = Metrics::new();
        Metrics::inc(&m.signals_emitted);
        Metrics::inc(&m.signals_emitted);
        Metrics::inc(&m.risk_rejects);
        let snap = m.snapshot();
        assert_eq!(snap.signals_emitted, 2);
        assert_eq!(snap.risk_rejects, 1);
        assert_eq!(snap.intents_submitted, 0);
    }
}
