// =============================================================================
// Meridian — Main Entry Point
// =============================================================================
//
// The binary wires the engine against the in-process demo collaborators
// (paper venue, scripted analysts, synthetic feed). Live deployments replace
// those with real implementations of the same traits; everything inside the
// orchestrator is identical either way.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal_macros::dec;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use meridian::analysts::{Analyst, AnalystRouter, RouterSettings};
use meridian::clock::{Clock, SystemClock};
use meridian::config::{Config, InstrumentConfig};
use meridian::context::EngineContext;
use meridian::execution::client::{ExecutionClient, RetrySettings};
use meridian::feed::{BarBuffer, FeedHealth, FeedIngestor, IngestorSettings, Timeframe};
use meridian::memory::LearningMemory;
use meridian::metrics::Metrics;
use meridian::orchestrator::Orchestrator;
use meridian::position::PositionBook;
use meridian::risk::RiskGate;
use meridian::sim::{synthetic_bars, PaperVenue, SimAnalyst, SimFeed};
use meridian::store::MemoryStore;
use meridian::types::Sentiment;

const CONFIG_PATH: &str = "meridian.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian orchestrator starting");

    // ── 1. Config ────────────────────────────────────────────────────────
    let config = Config::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "config unavailable — using demo defaults");
        demo_config()
    });
    let symbols = config.enabled_symbols();
    info!(symbols = ?symbols, "configured instruments");

    // ── 2. Shared engine state ───────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(MemoryStore::new());
    let bars = Arc::new(BarBuffer::new(500));
    let feed_health = Arc::new(FeedHealth::new());
    let memory = Arc::new(LearningMemory::new(
        config.orchestrator.bandit,
        config.orchestrator.bandit_epsilon,
    ));
    let risk_gate = Arc::new(RiskGate::new(config.risk.starting_equity, clock.now()));
    let positions = Arc::new(PositionBook::default());

    let ctx = Arc::new(EngineContext::new(
        config.clone(),
        bars.clone(),
        feed_health.clone(),
        memory,
        risk_gate,
        positions,
        store.clone(),
        metrics.clone(),
        clock.clone(),
    ));

    // ── 3. Demo collaborators ────────────────────────────────────────────
    let venue = PaperVenue::new();
    for (symbol, instrument) in &config.instruments {
        venue.set_spec(symbol, instrument.tick, instrument.step);
    }

    let analysts: Vec<Arc<dyn Analyst>> = vec![
        SimAnalyst::new("momentum-desk", Sentiment::Bullish, 0.72),
        SimAnalyst::new("macro-desk", Sentiment::Neutral, 0.55),
        SimAnalyst::new("flow-desk", Sentiment::Bullish, 0.64),
    ];
    let router = Arc::new(AnalystRouter::new(
        analysts,
        RouterSettings::from_config(&config.router),
        clock.clone(),
        metrics.clone(),
    ));

    let exec = Arc::new(ExecutionClient::new(
        venue.clone(),
        store,
        RouterSettings::from_config(&config.router).circuit,
        RetrySettings::default(),
        clock.clone(),
        metrics.clone(),
    ));

    // ── 4. Feed: synthetic generator through the real ingestor ──────────
    let feed = SimFeed::new({
        let clock = clock.clone();
        move || clock.now()
    });
    seed_history(&bars, &venue, &config);
    spawn_demo_feed(&feed, &venue, &config);

    let ingestor = FeedIngestor::new(
        feed,
        bars,
        feed_health,
        metrics,
        clock.clone(),
        IngestorSettings {
            max_gap_bars: config.orchestrator.max_gap_bars,
            ..IngestorSettings::default()
        },
    );
    let feed_symbols = symbols.clone();
    tokio::spawn(async move {
        ingestor.run(feed_symbols, Timeframe::ALL.to_vec()).await;
    });

    // ── 5. Orchestrator ─────────────────────────────────────────────────
    let (orchestrator, controller) =
        Orchestrator::new(ctx, router, exec, Some(CONFIG_PATH.into()));
    let engine = tokio::spawn(orchestrator.run());

    info!("all subsystems running — Ctrl+C to stop");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received");
    controller.stop(Duration::from_secs(30)).await;
    let _ = engine.await;

    info!("Meridian shut down complete");
    Ok(())
}

/// Demo defaults: two majors on the paper venue.
fn demo_config() -> Config {
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
    config.instruments.insert(
        "ETHUSD".into(),
        InstrumentConfig {
            enabled: true,
            timeframes: vec![Timeframe::M15, Timeframe::H1, Timeframe::H4, Timeframe::D1],
            tick: dec!(0.05),
            step: dec!(0.01),
            correlation_group: Some("majors".into()),
        },
    );
    config
}

fn demo_instruments(config: &Config) -> Vec<(String, f64)> {
    config
        .instruments
        .iter()
        .filter(|(_, i)| i.enabled)
        .enumerate()
        .map(|(n, (s, _))| (s.clone(), 50_000.0 / (n as f64 + 1.0)))
        .collect()
}

fn demo_start() -> chrono::DateTime<Utc> {
    Utc::now() - chrono::Duration::days(30)
}

fn demo_bar_count(tf: Timeframe) -> usize {
    ((chrono::Duration::days(30).num_milliseconds() / tf.millis()) as usize).min(400)
}

/// Load 30 days of synthetic history straight into the bar buffer so the
/// indicator warmup is satisfied from the first tick.
fn seed_history(bars: &Arc<BarBuffer>, venue: &Arc<PaperVenue>, config: &Config) {
    let start = demo_start();
    for (symbol, base) in demo_instruments(config) {
        for tf in Timeframe::ALL {
            let count = demo_bar_count(tf);
            let series = synthetic_bars(&symbol, tf, start, count, base, base * 0.0002, base * 0.004);
            if let Some(last) = series.last() {
                venue.set_mark(&symbol, last.close);
            }
            for bar in series {
                bars.push(bar);
            }
        }
    }
    info!("demo history seeded");
}

/// Keep pushing fresh bars through the live stream.
fn spawn_demo_feed(feed: &Arc<SimFeed>, venue: &Arc<PaperVenue>, config: &Config) {
    let feed = feed.clone();
    let venue = venue.clone();
    let instruments = demo_instruments(config);

    tokio::spawn(async move {
        let start = demo_start();
        let mut cursors: Vec<(String, Timeframe, usize, f64)> = instruments
            .iter()
            .flat_map(|(symbol, base)| {
                Timeframe::ALL
                    .into_iter()
                    .map(|tf| (symbol.clone(), tf, demo_bar_count(tf), *base))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            for (symbol, tf, cursor, base) in cursors.iter_mut() {
                let series = synthetic_bars(
                    symbol,
                    *tf,
                    start,
                    *cursor + 1,
                    *base,
                    *base * 0.0002,
                    *base * 0.004,
                );
                if let Some(bar) = series.last() {
                    venue.set_mark(symbol, bar.close);
                    feed.push_bar(bar.clone());
                }
                *cursor += 1;
            }
        }
    });
}
