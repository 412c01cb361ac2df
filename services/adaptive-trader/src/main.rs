//! Adaptive Trader - replay and live drivers
//!
//! `adaptive-trader replay [historical.csv]` runs the learning core over
//! historical candles and writes the tradebook, weights and model.
//! `adaptive-trader [live]` runs the feed, decision, reconciliation and
//! reporting workers against the configured venue.

use anyhow::{bail, Context};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use adaptive_trader::{
    AlpacaClient, Broker, Coordinator, DataStore, EngineConfig, FeedSet, HistoricalData,
    PaperBroker, ReplayDriver, RunOutcome, Schema, SharedFeed, SnapshotFeed, StateManager,
    TraderRunner, TradingMode, PRICE_KEY,
};

/// Default historical input under the data directory
const HISTORICAL_FILE: &str = "historical.csv";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::from_env().context("Failed to load configuration")?;
    let schema = Schema::new(config.signal_names.clone(), config.macro_names.clone())
        .context("Invalid signal schema")?;

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("replay") => run_replay(config, schema, args.next().map(PathBuf::from)),
        None | Some("live") => run_live(config, schema).await,
        Some(other) => bail!("Unknown command '{}', expected 'replay' or 'live'", other),
    }
}

fn run_replay(config: EngineConfig, schema: Schema, input: Option<PathBuf>) -> anyhow::Result<()> {
    let input = input.unwrap_or_else(|| config.data_dir.join(HISTORICAL_FILE));
    info!("Starting replay over {}", input.display());

    let data = HistoricalData::load(&input, &schema)
        .with_context(|| format!("Failed to load historical data from {}", input.display()))?;
    info!("Loaded {} historical rows", data.len());

    let mut driver = ReplayDriver::new(&config, schema.clone());
    let summary = driver.simulate(&data).context("Replay failed")?;

    let store = DataStore::new(&config.data_dir, schema);
    driver
        .persist(&store)
        .with_context(|| format!("Failed to persist replay to {}", store.root().display()))?;

    info!(
        "Replay complete: {} trades, {} closed batches, realized PnL {:.2}, cash {:.2}, position {}",
        summary.trades, summary.closed_batches, summary.realized_pnl, summary.cash, summary.position
    );
    info!("Final weights: {:?}", summary.weights);
    Ok(())
}

async fn run_live(config: EngineConfig, schema: Schema) -> anyhow::Result<()> {
    let store = DataStore::new(&config.data_dir, schema.clone());
    store
        .init()
        .with_context(|| format!("Failed to create data directory {}", store.root().display()))?;

    let (feeds, mut handles) = FeedSet::shared(&schema);
    let price_feed = SharedFeed::new(PRICE_KEY);
    handles.insert(PRICE_KEY.to_string(), price_feed.clone());
    let snapshot = SnapshotFeed::new(store.feed_snapshot_path(), handles);

    let broker: Arc<dyn Broker> = match config.trading_mode {
        TradingMode::Paper => {
            info!("Running in PAPER TRADING mode");
            Arc::new(
                PaperBroker::new(&config.symbol, &config.cash_asset, config.start_capital)
                    .with_price_feed(price_feed),
            )
        }
        TradingMode::Live => {
            warn!("Running in LIVE TRADING mode - REAL MONEY AT RISK");
            Arc::new(
                AlpacaClient::new(&config.venue, &config.cash_asset)
                    .context("Failed to create venue client")?,
            )
        }
    };

    let reporter = StateManager::new(store.state_dir(), config.trading_mode);
    let coordinator = Coordinator::open(config, schema, broker, store, feeds)
        .context("Failed to resume learning state")?;

    let runner = TraderRunner::new(Arc::new(coordinator), reporter).with_snapshot_feed(snapshot);
    match runner.run().await? {
        RunOutcome::RiskBreach(breach) => {
            warn!(
                kind = ?breach.kind,
                equity = breach.equity,
                threshold = breach.threshold,
                "Stopped on risk limit"
            );
            std::process::exit(1);
        }
        RunOutcome::Interrupted => Ok(()),
    }
}
