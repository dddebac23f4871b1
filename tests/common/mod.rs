// Shared harness for the end-to-end scenario suite: the full engine wired
// against the in-process collaborators with a stepped clock.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use meridian::analysts::{Analyst, AnalystRouter, RouterSettings};
use meridian::clock::{Clock, SimClock};
use meridian::config::{Config, InstrumentConfig};
use meridian::context::EngineContext;
use meridian::execution::client::{ExecutionClient, RetrySettings};
use meridian::feed::{Bar, BarBuffer, FeedHealth, Timeframe};
use meridian::memory::{BanditKind, LearningMemory};
use meridian::metrics::Metrics;
use meridian::position::PositionBook;
use meridian::risk::RiskGate;
use meridian::sim::{PaperVenue, SimAnalyst};
use meridian::store::MemoryStore;
use meridian::types::Sentiment;

pub struct Harness {
    pub ctx: Arc<EngineContext>,
    pub router: Arc<AnalystRouter>,
    pub exec: Arc<ExecutionClient>,
    pub venue: Arc<PaperVenue>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<SimClock>,
    pub analysts: Vec<Arc<SimAnalyst>>,
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

/// One BTC instrument, thresholds tuned so a clean trending book emits.
pub fn base_config() -> Config {
    let mut config = Config::default();
    config.instruments.insert(
        "BTCUSD".into(),
        InstrumentConfig {
            enabled: true,
            timeframes: vec![Timeframe::M15, Timeframe::H1, Timeframe::H4, Timeframe::D1],
            tick: dec!(0.5),
            step: dec!(0.001),
            correlation_group: Some("majors".into()),
        },
    );
    config.scorer.entry_threshold = 40.0;
    config.scorer.min_calibrated_confidence = 0.5;
    config.scorer.min_risk_reward = 2.5;
    config.risk.kelly_scale = 1.0;
    config.risk.max_position_size_pct = 1.0;
    config
}

/// Two bullish analysts plus a neutral one, per the clean-entry setup.
pub fn default_analysts() -> Vec<Arc<SimAnalyst>> {
    vec![
        SimAnalyst::new("alpha", Sentiment::Bullish, 0.75),
        SimAnalyst::new("beta", Sentiment::Bullish, 0.82),
    ]
}

pub fn build(config: Config) -> Harness {
    build_with_analysts(config, default_analysts())
}

pub fn build_with_analysts(config: Config, analysts: Vec<Arc<SimAnalyst>>) -> Harness {
    let clock = Arc::new(SimClock::new(epoch()));
    let clock_dyn: Arc<dyn Clock> = clock.clone();
    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(MemoryStore::new());

    let venue = PaperVenue::new();
    for (symbol, instrument) in &config.instruments {
        venue.set_spec(symbol, instrument.tick, instrument.step);
    }

    let ctx = Arc::new(EngineContext::new(
        config.clone(),
        Arc::new(BarBuffer::new(500)),
        Arc::new(FeedHealth::new()),
        Arc::new(LearningMemory::new(BanditKind::Ucb1, 0.1)),
        Arc::new(RiskGate::new(config.risk.starting_equity, epoch())),
        Arc::new(PositionBook::default()),
        store.clone(),
        metrics.clone(),
        clock_dyn.clone(),
    ));

    let dyn_analysts: Vec<Arc<dyn Analyst>> = analysts
        .iter()
        .map(|a| a.clone() as Arc<dyn Analyst>)
        .collect();
    let router = Arc::new(AnalystRouter::new(
        dyn_analysts,
        RouterSettings::from_config(&config.router),
        clock_dyn.clone(),
        metrics.clone(),
    ));

    let exec = Arc::new(ExecutionClient::new(
        venue.clone(),
        store.clone(),
        RouterSettings::from_config(&config.router).circuit,
        RetrySettings {
            max_attempts: 4,
            base: std::time::Duration::from_millis(1),
            cap: std::time::Duration::from_millis(5),
        },
        clock_dyn,
        metrics,
    ));

    Harness {
        ctx,
        router,
        exec,
        venue,
        store,
        clock,
        analysts,
    }
}

/// A steadily accelerating uptrend: EMA stack aligned, MACD histogram
/// positive, oscillators pinned high. `count` bars per timeframe.
pub fn accelerating_bars(
    symbol: &str,
    timeframe: Timeframe,
    start: DateTime<Utc>,
    count: usize,
    base: f64,
) -> Vec<Bar> {
    let start = timeframe.align(start);
    let mut prev_close = base;
    (0..count)
        .map(|i| {
            let close = base * (1.0 + 1e-5 * (i * i) as f64);
            let open = prev_close;
            let spread = (close - open).abs().max(base * 0.0005);
            let high = open.max(close) + spread * 0.3;
            let low = open.min(close) - spread * 0.3;
            let volume = 100.0 + i as f64 * 0.5;
            prev_close = close;

            let d = |v: f64| Decimal::from_f64(v).unwrap().round_dp(2);
            Bar {
                symbol: symbol.to_string(),
                timeframe,
                open_time: start + timeframe.duration() * i as i32,
                open: d(open),
                high: d(high),
                low: d(low),
                close: d(close),
                volume: d(volume),
                trades_count: Some(500),
            }
        })
        .collect()
}

/// Seed all configured timeframes of one symbol with the accelerating trend,
/// ending just before the harness clock's notion of now.
pub fn seed_trending_book(harness: &Harness, symbol: &str, count: usize, base: f64) {
    for tf in Timeframe::ALL {
        let span = tf.duration() * count as i32;
        let start = harness.clock.now() - span;
        for bar in accelerating_bars(symbol, tf, start, count, base) {
            harness.ctx.bars.push(bar);
        }
    }
    // Venue marks track the freshest close.
    if let Some(last) = harness
        .ctx
        .bars
        .last(&meridian::feed::SeriesKey::new(symbol, Timeframe::M15))
    {
        harness.venue.set_mark(symbol, last.close);
    }
}
