// =============================================================================
// Feed Ingestor — pumps a MarketFeed stream into the bar buffer
// =============================================================================
//
// Responsibilities:
//   - Validate and order-check every incoming bar.
//   - On (re)connect, compare local time against the feed's server time; a
//     divergence above 250 ms is recorded as a clock-skew event, and the
//     orchestrator suppresses new entries for the affected symbols until the
//     skew clears.
//   - Detect gaps between the expected and the arrived open_time and close
//     them via Backfill. Gaps larger than `max_gap_bars` mark the symbol's
//     feed DEGRADED.
//   - Classify parse failures {malformed, schema-mismatch, timeout} into
//     metrics; the operational target is ≥ 99 % parse success.
//   - Transient transport errors retry with bounded exponential backoff plus
//     jitter.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::FeedError;
use crate::metrics::Metrics;

use super::bar::{Bar, Timeframe};
use super::buffer::{BarBuffer, PushOutcome, SeriesKey};

/// Clock divergence above which a skew event is raised.
pub const SKEW_THRESHOLD_MS: i64 = 250;

// ---------------------------------------------------------------------------
// MarketFeed collaborator contract
// ---------------------------------------------------------------------------

/// Upstream market data source. Implementations own the wire protocol; the
/// core only sees validated decimal bars with UTC timestamps.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Open a stream of finalized bars for the given symbols and timeframes.
    async fn subscribe(
        &self,
        symbols: &[String],
        timeframes: &[Timeframe],
    ) -> Result<BoxStream<'static, Result<Bar, FeedError>>, FeedError>;

    /// Fetch the closed bars in `[from, to)`, ordered by open_time.
    async fn backfill(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, FeedError>;

    /// The feed's notion of current time, used for the clock-skew guard.
    async fn server_time(&self) -> Result<DateTime<Utc>, FeedError>;
}

// ---------------------------------------------------------------------------
// FeedHealth — per-symbol degradation and skew registry
// ---------------------------------------------------------------------------

/// Health of one symbol's feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FeedStatus {
    Healthy,
    Degraded {
        since: DateTime<Utc>,
        reason: String,
    },
}

/// Shared registry the orchestrator consults before admitting entries.
#[derive(Default)]
pub struct FeedHealth {
    status: RwLock<HashMap<String, FeedStatus>>,
    skew_ms: RwLock<HashMap<String, i64>>,
}

impl FeedHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_degraded(&self, symbol: &str, reason: impl Into<String>, now: DateTime<Utc>) {
        let reason = reason.into();
        warn!(symbol, reason = %reason, "feed marked DEGRADED");
        self.status
            .write()
            .insert(symbol.to_string(), FeedStatus::Degraded { since: now, reason });
    }

    pub fn mark_healthy(&self, symbol: &str) {
        let mut map = self.status.write();
        if matches!(map.get(symbol), Some(FeedStatus::Degraded { .. })) {
            info!(symbol, "feed recovered");
        }
        map.insert(symbol.to_string(), FeedStatus::Healthy);
    }

    pub fn is_degraded(&self, symbol: &str) -> bool {
        matches!(
            self.status.read().get(symbol),
            Some(FeedStatus::Degraded { .. })
        )
    }

    pub fn record_skew(&self, symbol: &str, millis: i64) {
        warn!(symbol, skew_ms = millis, "clock skew above threshold");
        self.skew_ms.write().insert(symbol.to_string(), millis);
    }

    pub fn clear_skew(&self, symbol: &str) {
        self.skew_ms.write().remove(symbol);
    }

    pub fn skew_ms(&self, symbol: &str) -> Option<i64> {
        self.skew_ms.read().get(symbol).copied()
    }

    /// A symbol is impaired when its feed is degraded or skewed. Impaired
    /// symbols get a slower cadence and no new entries.
    pub fn is_impaired(&self, symbol: &str) -> bool {
        self.is_degraded(symbol) || self.skew_ms(symbol).is_some()
    }

    pub fn snapshot(&self) -> HashMap<String, FeedStatus> {
        self.status.read().clone()
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff with full jitter, bounded by `cap`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let bounded = exp.min(cap);
    let jitter: f64 = rand::rng().random_range(0.5..1.0);
    bounded.mul_f64(jitter)
}

// ---------------------------------------------------------------------------
// FeedIngestor
// ---------------------------------------------------------------------------

/// Tunables for the pump loop.
#[derive(Debug, Clone)]
pub struct IngestorSettings {
    /// Gaps larger than this many bars mark the feed DEGRADED.
    pub max_gap_bars: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for IngestorSettings {
    fn default() -> Self {
        Self {
            max_gap_bars: 5,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Drives one `MarketFeed` subscription into the shared `BarBuffer`.
pub struct FeedIngestor {
    feed: Arc<dyn MarketFeed>,
    buffer: Arc<BarBuffer>,
    health: Arc<FeedHealth>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    settings: IngestorSettings,
}

impl FeedIngestor {
    pub fn new(
        feed: Arc<dyn MarketFeed>,
        buffer: Arc<BarBuffer>,
        health: Arc<FeedHealth>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
        settings: IngestorSettings,
    ) -> Self {
        Self {
            feed,
            buffer,
            health,
            metrics,
            clock,
            settings,
        }
    }

    /// Run the pump until the surrounding task is cancelled. Reconnects with
    /// backoff on transport failure.
    pub async fn run(&self, symbols: Vec<String>, timeframes: Vec<Timeframe>) {
        let mut attempt: u32 = 0;
        loop {
            match self.feed.subscribe(&symbols, &timeframes).await {
                Ok(stream) => {
                    attempt = 0;
                    self.check_clock_skew(&symbols, &timeframes).await;
                    self.pump(stream).await;
                    warn!("feed stream ended — reconnecting");
                }
                Err(e) => {
                    Metrics::inc(&self.metrics.parse_timeout);
                    warn!(error = %e, attempt, "feed subscribe failed");
                }
            }
            attempt = attempt.saturating_add(1);
            let delay = backoff_delay(attempt, self.settings.backoff_base, self.settings.backoff_cap);
            tokio::time::sleep(delay).await;
        }
    }

    /// Compare local time to the feed's server time. A divergence above
    /// 250 ms raises a skew event and backfills any bars missed since the
    /// last known bar.
    async fn check_clock_skew(&self, symbols: &[String], timeframes: &[Timeframe]) {
        let server = match self.feed.server_time().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "server_time unavailable — skipping skew check");
                return;
            }
        };
        let local = self.clock.now();
        let divergence = (server - local).num_milliseconds().abs();

        for symbol in symbols {
            if divergence > SKEW_THRESHOLD_MS {
                Metrics::inc(&self.metrics.clock_skew_events);
                self.health.record_skew(symbol, divergence);
                for tf in timeframes {
                    let key = SeriesKey::new(symbol.clone(), *tf);
                    if let Some(from) = self.buffer.expected_next(&key) {
                        let to = tf.align(server);
                        if from < to {
                            self.run_backfill(symbol, *tf, from, to).await;
                        }
                    }
                }
            } else {
                self.health.clear_skew(symbol);
            }
        }
    }

    async fn pump(&self, mut stream: BoxStream<'static, Result<Bar, FeedError>>) {
        while let Some(item) = stream.next().await {
            match item {
                Ok(bar) => self.ingest(bar).await,
                Err(e) => {
                    match e.class() {
                        "malformed" => Metrics::inc(&self.metrics.parse_malformed),
                        "schema_mismatch" => Metrics::inc(&self.metrics.parse_schema_mismatch),
                        _ => Metrics::inc(&self.metrics.parse_timeout),
                    }
                    warn!(error = %e, class = e.class(), "feed item failed to parse");
                    if matches!(e, FeedError::Transport(_)) {
                        return; // reconnect
                    }
                }
            }
        }
    }

    /// Validate, gap-check and store one bar.
    async fn ingest(&self, bar: Bar) {
        if let Err(e) = bar.validate() {
            Metrics::inc(&self.metrics.bars_invalid);
            warn!(error = %e, "invalid bar discarded");
            return;
        }

        let key = SeriesKey::new(bar.symbol.clone(), bar.timeframe);

        // Gap detection: how many bars are missing between the expected next
        // open_time and the arrived one?
        if let Some(expected) = self.buffer.expected_next(&key) {
            if bar.open_time > expected {
                let missing =
                    ((bar.open_time - expected).num_milliseconds() / bar.timeframe.millis()) as u32;
                if missing > 0 {
                    self.run_backfill(&bar.symbol, bar.timeframe, expected, bar.open_time)
                        .await;
                    if missing > self.settings.max_gap_bars {
                        self.health.mark_degraded(
                            &bar.symbol,
                            format!("gap of {missing} bars on {}", bar.timeframe),
                            self.clock.now(),
                        );
                    }
                }
            }
        }

        match self.buffer.push(bar.clone()) {
            PushOutcome::Appended => {
                Metrics::inc(&self.metrics.bars_ingested);
                debug!(key = %key, close = %bar.close, "bar ingested");
                // A freshly completed gap repair restores health.
                if self.health.is_degraded(&bar.symbol) && self.gap_closed(&key) {
                    self.health.mark_healthy(&bar.symbol);
                }
            }
            PushOutcome::Duplicate => Metrics::inc(&self.metrics.bars_duplicate),
            PushOutcome::OutOfOrder => {
                Metrics::inc(&self.metrics.bars_out_of_order);
                warn!(key = %key, open_time = %bar.open_time, "out-of-order bar discarded");
            }
        }
    }

    /// Fetch and insert the missing bars in `[from, to)`.
    async fn run_backfill(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) {
        Metrics::inc(&self.metrics.backfills);
        info!(symbol, %timeframe, %from, %to, "backfilling gap");
        match self.feed.backfill(symbol, timeframe, from, to).await {
            Ok(bars) => {
                for b in bars {
                    if b.validate().is_ok() {
                        if self.buffer.push(b) == PushOutcome::Appended {
                            Metrics::inc(&self.metrics.bars_ingested);
                        }
                    } else {
                        Metrics::inc(&self.metrics.bars_invalid);
                    }
                }
            }
            Err(e) => {
                warn!(symbol, %timeframe, error = %e, "backfill failed");
                self.health.mark_degraded(
                    symbol,
                    format!("backfill failed: {e}"),
                    self.clock.now(),
                );
            }
        }
    }

    /// True when the series has no missing bar immediately behind its head,
    /// i.e. the most recent repair covered the hole.
    fn gap_closed(&self, key: &SeriesKey) -> bool {
        let window = self.buffer.window(key, 3);
        window
            .windows(2)
            .all(|w| w[1].open_time - w[0].open_time == w[0].timeframe.duration())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(5);
        let d0 = backoff_delay(0, base, cap);
        assert!(d0 <= base);
        let d10 = backoff_delay(10, base, cap);
        assert!(d10 <= cap);
        // Jitter keeps the delay at least half the bounded value.
        assert!(d10 >= cap / 2);
    }

    #[test]
    fn health_registry_transitions() {
        let health = FeedHealth::new();
        assert!(!health.is_degraded("BTCUSD"));

        health.mark_degraded("BTCUSD", "gap", Utc::now());
        assert!(health.is_degraded("BTCUSD"));
        assert!(health.is_impaired("BTCUSD"));

        health.mark_healthy("BTCUSD");
        assert!(!health.is_degraded("BTCUSD"));
        assert!(!health.is_impaired("BTCUSD"));
    }

    #[test]
    fn skew_makes_symbol_impaired() {
        let health = FeedHealth::new();
        health.record_skew("ETHUSD", 400);
        assert_eq!(health.skew_ms("ETHUSD"), Some(400));
        assert!(health.is_impaired("ETHUSD"));
        assert!(!health.is_degraded("ETHUSD"));

        health.clear_skew("ETHUSD");
        assert!(!health.is_impaired("ETHUSD"));
    }
}
