// =============================================================================
// Simulation collaborators — paper venue, scripted feed, scripted analysts
// =============================================================================
//
// Demo mode and the end-to-end scenario suite run the full engine against
// these in-process implementations. The paper venue honours the same
// idempotency contract a real venue must provide: one order per client_id,
// ever.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::analysts::{AnalysisRequest, Analyst, AnalystProfile, AnalystVerdict};
use crate::error::{AnalystError, ExecError, FeedError};
use crate::execution::types::{Fill, OrderIntent, OrderStatus, OrderType};
use crate::execution::venue::{ExchangeVenue, SymbolSpec, VenueReport};
use crate::feed::{Bar, MarketFeed, Timeframe};
use crate::types::Sentiment;

// ---------------------------------------------------------------------------
// PaperVenue
// ---------------------------------------------------------------------------

/// In-process venue with instant fills and strict client_id idempotency.
pub struct PaperVenue {
    orders: Mutex<HashMap<Uuid, VenueReport>>,
    marks: RwLock<HashMap<String, Decimal>>,
    specs: RwLock<HashMap<String, SymbolSpec>>,
    /// Fraction of the quantity filled on submission (1 = full fill).
    fill_fraction: RwLock<Decimal>,
    /// Fail the next N submissions with transient errors.
    fail_next_submits: AtomicU32,
    /// Count of *distinct* orders ever created.
    created: AtomicU32,
    fee_rate: Decimal,
}

impl PaperVenue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            orders: Mutex::new(HashMap::new()),
            marks: RwLock::new(HashMap::new()),
            specs: RwLock::new(HashMap::new()),
            fill_fraction: RwLock::new(Decimal::ONE),
            fail_next_submits: AtomicU32::new(0),
            created: AtomicU32::new(0),
            fee_rate: Decimal::new(1, 3), // 0.1 %
        })
    }

    pub fn set_spec(&self, symbol: &str, tick: Decimal, step: Decimal) {
        self.specs
            .write()
            .insert(symbol.to_string(), SymbolSpec { tick, step });
    }

    pub fn set_mark(&self, symbol: &str, price: Decimal) {
        self.marks.write().insert(symbol.to_string(), price);
    }

    /// Next submissions fill only this fraction of the quantity.
    pub fn set_fill_fraction(&self, fraction: Decimal) {
        *self.fill_fraction.write() = fraction;
    }

    /// Inject transient submit failures.
    pub fn fail_next(&self, n: u32) {
        self.fail_next_submits.store(n, Ordering::SeqCst);
    }

    /// Number of distinct orders ever created — the at-most-once meter.
    pub fn orders_created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    /// Deliver a late fill for the remainder of an open order.
    pub fn fill_remainder(&self, client_id: Uuid, price: Decimal, quantity: Decimal, ts: DateTime<Utc>) {
        let mut orders = self.orders.lock();
        if let Some(report) = orders.get_mut(&client_id) {
            if report.status.is_terminal() {
                return;
            }
            report.fills.push(Fill {
                qty: quantity,
                price,
                fee: (quantity * price * self.fee_rate).round_dp(8),
                ts,
            });
            report.status = OrderStatus::Filled;
        }
    }

    fn fill_price(&self, intent: &OrderIntent) -> Decimal {
        match intent.order_type {
            OrderType::Market => self
                .marks
                .read()
                .get(&intent.symbol)
                .copied()
                .or(intent.limit_price)
                .unwrap_or(Decimal::ONE),
            _ => intent.limit_price.unwrap_or_else(|| {
                self.marks
                    .read()
                    .get(&intent.symbol)
                    .copied()
                    .unwrap_or(Decimal::ONE)
            }),
        }
    }
}

#[async_trait]
impl ExchangeVenue for PaperVenue {
    async fn submit(&self, intent: &OrderIntent) -> Result<VenueReport, ExecError> {
        if self.fail_next_submits.load(Ordering::SeqCst) > 0 {
            self.fail_next_submits.fetch_sub(1, Ordering::SeqCst);
            return Err(ExecError::Transient("paper venue connection drop".into()));
        }

        let mut orders = self.orders.lock();
        if let Some(existing) = orders.get(&intent.client_id) {
            // Idempotent: the same client_id maps to the same order.
            return Ok(existing.clone());
        }

        let price = self.fill_price(intent);
        let fraction = *self.fill_fraction.read();
        let fill_qty = (intent.quantity * fraction).round_dp(8);
        let mut fills = Vec::new();
        if fill_qty > Decimal::ZERO {
            fills.push(Fill {
                qty: fill_qty,
                price,
                fee: (fill_qty * price * self.fee_rate).round_dp(8),
                ts: intent.created_at,
            });
        }
        let status = if fill_qty >= intent.quantity {
            OrderStatus::Filled
        } else if fill_qty > Decimal::ZERO {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Open
        };

        self.created.fetch_add(1, Ordering::SeqCst);
        let report = VenueReport {
            venue_order_id: format!("P-{}", intent.client_id.simple()),
            status,
            fills,
        };
        orders.insert(intent.client_id, report.clone());
        Ok(report)
    }

    async fn cancel(&self, client_id: Uuid) -> Result<VenueReport, ExecError> {
        let mut orders = self.orders.lock();
        let report = orders
            .get_mut(&client_id)
            .ok_or_else(|| ExecError::Permanent(format!("unknown order {client_id}")))?;
        if !report.status.is_terminal() {
            report.status = OrderStatus::Cancelled;
        }
        Ok(report.clone())
    }

    async fn query(&self, client_id: Uuid) -> Result<Option<VenueReport>, ExecError> {
        Ok(self.orders.lock().get(&client_id).cloned())
    }

    fn symbol_spec(&self, symbol: &str) -> SymbolSpec {
        self.specs.read().get(symbol).cloned().unwrap_or(SymbolSpec {
            tick: Decimal::new(1, 2),   // 0.01
            step: Decimal::new(1, 3),   // 0.001
        })
    }
}

// ---------------------------------------------------------------------------
// SimFeed
// ---------------------------------------------------------------------------

/// Scripted market feed: bars are pushed by the test or a generator task and
/// served to subscribers; backfill answers from the same script. Each
/// `subscribe` opens a fresh stream, so reconnect loops behave as they would
/// against a real transport.
pub struct SimFeed {
    tx: Mutex<Option<mpsc::UnboundedSender<Result<Bar, FeedError>>>>,
    history: Mutex<Vec<Bar>>,
    /// Server-time offset for clock-skew injection.
    skew: RwLock<chrono::Duration>,
    now_fn: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl SimFeed {
    pub fn new(now_fn: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            tx: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            skew: RwLock::new(chrono::Duration::zero()),
            now_fn: Box::new(now_fn),
        })
    }

    /// Push one bar to the live stream (and the backfill history). Bars
    /// pushed before any subscription land in history only.
    pub fn push_bar(&self, bar: Bar) {
        self.history.lock().push(bar.clone());
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(Ok(bar));
        }
    }

    /// Close the current stream, as a transport drop would.
    pub fn disconnect(&self) {
        self.tx.lock().take();
    }

    /// Record a bar only in history — visible to backfill, absent from the
    /// live stream (a gap).
    pub fn push_history_only(&self, bar: Bar) {
        self.history.lock().push(bar);
    }

    pub fn push_error(&self, error: FeedError) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(Err(error));
        }
    }

    /// Inject server-clock skew.
    pub fn set_skew(&self, skew: chrono::Duration) {
        *self.skew.write() = skew;
    }
}

#[async_trait]
impl MarketFeed for SimFeed {
    async fn subscribe(
        &self,
        _symbols: &[String],
        _timeframes: &[Timeframe],
    ) -> Result<BoxStream<'static, Result<Bar, FeedError>>, FeedError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock() = Some(tx);
        Ok(tokio_stream::wrappers::UnboundedReceiverStream::new(rx).boxed())
    }

    async fn backfill(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, FeedError> {
        let mut bars: Vec<Bar> = self
            .history
            .lock()
            .iter()
            .filter(|b| {
                b.symbol == symbol
                    && b.timeframe == timeframe
                    && b.open_time >= from
                    && b.open_time < to
            })
            .cloned()
            .collect();
        bars.sort_by_key(|b| b.open_time);
        Ok(bars)
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, FeedError> {
        Ok((self.now_fn)() + *self.skew.read())
    }
}

// ---------------------------------------------------------------------------
// SimAnalyst
// ---------------------------------------------------------------------------

/// Scripted analyst with a fixed opinion and a failure switch.
pub struct SimAnalyst {
    id: String,
    sentiment: RwLock<Sentiment>,
    confidence: RwLock<f64>,
    failing: AtomicBool,
    cost_per_token: f64,
    delay: RwLock<Duration>,
}

impl SimAnalyst {
    pub fn new(id: &str, sentiment: Sentiment, confidence: f64) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            sentiment: RwLock::new(sentiment),
            confidence: RwLock::new(confidence),
            failing: AtomicBool::new(false),
            cost_per_token: 1.0,
            delay: RwLock::new(Duration::ZERO),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_opinion(&self, sentiment: Sentiment, confidence: f64) {
        *self.sentiment.write() = sentiment;
        *self.confidence.write() = confidence;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.write() = delay;
    }
}

#[async_trait]
impl Analyst for SimAnalyst {
    fn profile(&self) -> AnalystProfile {
        AnalystProfile {
            analyst_id: self.id.clone(),
            cost_per_token: self.cost_per_token,
            capacity: 8,
        }
    }

    async fn analyze(&self, _request: &AnalysisRequest) -> Result<AnalystVerdict, AnalystError> {
        let delay = *self.delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AnalystError::Transport("sim analyst outage".into()));
        }
        Ok(AnalystVerdict {
            analyst_id: self.id.clone(),
            sentiment: *self.sentiment.read(),
            confidence: Some(*self.confidence.read()),
            rationale: "scripted opinion".into(),
            latency: Duration::ZERO,
            token_cost: 64,
            produced_at: Utc::now(),
            from_cache: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Synthetic bar builder
// ---------------------------------------------------------------------------

/// Build a deterministic trending/oscillating bar series for tests and demo
/// feeds. `drift` is the per-bar price increment; `amplitude` the size of the
/// oscillation around the trend.
pub fn synthetic_bars(
    symbol: &str,
    timeframe: Timeframe,
    start: DateTime<Utc>,
    count: usize,
    base_price: f64,
    drift: f64,
    amplitude: f64,
) -> Vec<Bar> {
    let start = timeframe.align(start);
    (0..count)
        .map(|i| {
            let trend = base_price + drift * i as f64;
            let wobble = amplitude * ((i as f64) * 0.7).sin();
            let close = trend + wobble;
            let open = trend + amplitude * (((i as f64) - 1.0) * 0.7).sin();
            let hi = open.max(close) + amplitude * 0.3;
            let lo = open.min(close) - amplitude * 0.3;
            let volume = 100.0 + 20.0 * ((i as f64) * 1.3).cos().abs();
            Bar {
                symbol: symbol.to_string(),
                timeframe,
                open_time: start + timeframe.duration() * i as i32,
                open: Decimal::from_f64(open).unwrap_or(Decimal::ONE).round_dp(4),
                high: Decimal::from_f64(hi).unwrap_or(Decimal::ONE).round_dp(4),
                low: Decimal::from_f64(lo).unwrap_or(Decimal::ONE).round_dp(4),
                close: Decimal::from_f64(close).unwrap_or(Decimal::ONE).round_dp(4),
                volume: Decimal::from_f64(volume).unwrap_or(Decimal::ONE).round_dp(4),
                trades_count: Some(1000),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn synthetic_bars_validate() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bars = synthetic_bars("BTCUSD", Timeframe::H1, start, 100, 50_000.0, 10.0, 50.0);
        assert_eq!(bars.len(), 100);
        for bar in &bars {
            bar.validate().expect("synthetic bar must satisfy invariants");
        }
        // Strictly increasing, aligned open times.
        for pair in bars.windows(2) {
            assert_eq!(
                pair[1].open_time - pair[0].open_time,
                Timeframe::H1.duration()
            );
        }
    }

    #[tokio::test]
    async fn paper_venue_is_idempotent_per_client_id() {
        let venue = PaperVenue::new();
        let signal_id = Uuid::new_v4();
        let intent = OrderIntent {
            client_id: OrderIntent::derive_client_id(signal_id, 0),
            parent_signal_id: signal_id,
            attempt: 0,
            symbol: "BTCUSD".into(),
            side: crate::types::Side::Buy,
            order_type: OrderType::Limit,
            quantity: dec!(1),
            limit_price: Some(dec!(50000)),
            stop_price: None,
            time_in_force: crate::execution::types::TimeInForce::Gtc,
            risk_pct: 0.0,
            leverage: 0.0,
            created_at: Utc::now(),
        };
        let first = venue.submit(&intent).await.unwrap();
        let second = venue.submit(&intent).await.unwrap();
        assert_eq!(first.venue_order_id, second.venue_order_id);
        assert_eq!(venue.orders_created(), 1);
    }

    #[tokio::test]
    async fn sim_feed_backfills_from_history() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let feed = SimFeed::new(move || start);
        for bar in synthetic_bars("BTCUSD", Timeframe::H1, start, 5, 50_000.0, 1.0, 5.0) {
            feed.push_history_only(bar);
        }
        let bars = feed
            .backfill(
                "BTCUSD",
                Timeframe::H1,
                start,
                start + chrono::Duration::hours(3),
            )
            .await
            .unwrap();
        assert_eq!(bars.len(), 3);
    }
}
