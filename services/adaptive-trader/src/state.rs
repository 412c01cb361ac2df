//! State reporting - write `state/now.json` for observability

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::config::TradingMode;
use crate::engine::Coordinator;

/// Writes the periodic status file
pub struct StateManager {
    state_dir: PathBuf,
    mode: TradingMode,
}

/// Current status (state/now.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NowState {
    pub timestamp: String,
    pub mode: TradingMode,
    pub status: String,
    pub symbol: String,
    pub price: Option<f64>,
    pub cash: Option<f64>,
    pub position: Option<f64>,
    pub equity: Option<f64>,
    pub weights: Vec<f64>,
    pub ledger_rows: usize,
    pub closed_trades: usize,
    pub open_buys: usize,
    pub realized_pnl: f64,
    pub classifier_trained: bool,
}

impl StateManager {
    pub fn new(state_dir: impl AsRef<Path>, mode: TradingMode) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
            mode,
        }
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.state_dir).await?;
        Ok(())
    }

    pub fn now_path(&self) -> PathBuf {
        self.state_dir.join("now.json")
    }

    /// Gather the current view; venue figures are left empty when the
    /// venue does not answer
    pub async fn collect(&self, coordinator: &Coordinator) -> NowState {
        let snapshot = coordinator.snapshot().await;
        let config = coordinator.config();
        let broker = coordinator.broker();

        let price = broker.latest_price(&config.symbol).await;
        let cash = broker.get_balance(&config.cash_asset).await;
        let position = broker.get_balance(&config.symbol).await;
        if let Err(e) = price.as_ref().and(cash.as_ref()).and(position.as_ref()) {
            warn!(error = %e, "Venue unavailable for status report");
        }
        let (price, cash, position) = (price.ok(), cash.ok(), position.ok());
        let equity = match (price, cash, position) {
            (Some(p), Some(c), Some(q)) => Some(c + q * p),
            _ => None,
        };

        NowState {
            timestamp: chrono::Utc::now().to_rfc3339(),
            mode: self.mode,
            status: if snapshot.stopped { "stopped" } else { "trading" }.to_string(),
            symbol: config.symbol.clone(),
            price,
            cash,
            position,
            equity,
            weights: snapshot.weights,
            ledger_rows: snapshot.ledger_rows,
            closed_trades: snapshot.closed_trades,
            open_buys: snapshot.open_buys,
            realized_pnl: snapshot.realized_pnl,
            classifier_trained: snapshot.classifier_trained,
        }
    }

    pub async fn write_now(&self, state: &NowState) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        fs::write(self.now_path(), json).await?;
        debug!("Wrote state/now.json");
        Ok(())
    }

    pub async fn report(&self, coordinator: &Coordinator) -> anyhow::Result<NowState> {
        let state = self.collect(coordinator).await;
        self.write_now(&state).await?;
        Ok(state)
    }
}
