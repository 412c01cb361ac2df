//! Engine Configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Default data directory (under the user's home)
const DEFAULT_DATA_DIR: &str = ".adaptive-trader";

/// Engine configuration shared by both drivers
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Tradable instrument
    #[serde(default = "default_symbol")]
    pub symbol: String,
    /// Balance key for cash at the venue
    #[serde(default = "default_cash_asset")]
    pub cash_asset: String,
    /// Signal names, fixed at startup
    #[serde(default = "default_signal_names")]
    pub signal_names: Vec<String>,
    /// Macro variables recorded with each trade
    #[serde(default = "default_macro_names")]
    pub macro_names: Vec<String>,
    /// Quantity proposed before CBR sizing
    #[serde(default = "default_base_quantity")]
    pub base_quantity: f64,
    #[serde(default = "default_start_capital")]
    pub start_capital: f64,
    /// Weight learner step
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// CBR quantity scaling step
    #[serde(default = "default_sizing_rate")]
    pub sizing_rate: f64,
    /// Closed trades required (strictly more than) before CBR retrains
    #[serde(default = "default_min_closed_trades")]
    pub min_closed_trades: usize,
    /// Take-profit multiplier on start capital
    #[serde(default = "default_take_profit")]
    pub take_profit: f64,
    /// Stop-loss multiplier on start capital
    #[serde(default = "default_stop_loss")]
    pub stop_loss: f64,
    /// Reconciliation / learning cycle period
    #[serde(default = "default_cycle_secs")]
    pub cycle_secs: u64,
    #[serde(default = "default_decision_secs")]
    pub decision_secs: u64,
    #[serde(default = "default_report_secs")]
    pub report_secs: u64,
    #[serde(default = "default_feed_secs")]
    pub feed_secs: u64,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub action_encoding: ActionEncoding,
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub venue: VenueConfig,
}

/// How the trade side is encoded as a classifier feature
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionEncoding {
    /// buy = +1, sell = -1
    #[default]
    Signed,
    /// Every side encodes to +1 (parity with the legacy tradebooks)
    Constant,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

/// Live venue connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VenueConfig {
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    #[serde(default = "default_market_data_url")]
    pub market_data_url: String,
    #[serde(default)]
    pub api_key_id: String,
    #[serde(default)]
    pub api_secret_key: String,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            market_data_url: default_market_data_url(),
            api_key_id: String::new(),
            api_secret_key: String::new(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            cash_asset: default_cash_asset(),
            signal_names: default_signal_names(),
            macro_names: default_macro_names(),
            base_quantity: default_base_quantity(),
            start_capital: default_start_capital(),
            learning_rate: default_learning_rate(),
            sizing_rate: default_sizing_rate(),
            min_closed_trades: default_min_closed_trades(),
            take_profit: default_take_profit(),
            stop_loss: default_stop_loss(),
            cycle_secs: default_cycle_secs(),
            decision_secs: default_decision_secs(),
            report_secs: default_report_secs(),
            feed_secs: default_feed_secs(),
            data_dir: default_data_dir(),
            action_encoding: ActionEncoding::default(),
            trading_mode: TradingMode::default(),
            venue: VenueConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from `TRADER_*` environment variables (after an optional `.env`)
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        // TRADER_LEARNING_RATE -> learning_rate, TRADER_VENUE__API_KEY_ID -> venue.api_key_id
        let settings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("TRADER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("signal_names")
                    .with_list_parse_key("macro_names"),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate once at startup
    pub fn validate(&self) -> EngineResult<()> {
        if self.signal_names.is_empty() {
            return Err(EngineError::Config("signal_names must not be empty".into()));
        }
        if !(self.base_quantity > 0.0) {
            return Err(EngineError::Config(format!(
                "base_quantity must be positive, got {}",
                self.base_quantity
            )));
        }
        if !(self.start_capital > 0.0) {
            return Err(EngineError::Config(format!(
                "start_capital must be positive, got {}",
                self.start_capital
            )));
        }
        if !(self.stop_loss > 0.0 && self.stop_loss < 1.0 && self.take_profit > 1.0) {
            return Err(EngineError::Config(format!(
                "risk limits must satisfy 0 < stop_loss < 1 < take_profit, got {} / {}",
                self.stop_loss, self.take_profit
            )));
        }
        if self.learning_rate < 0.0 || self.sizing_rate < 0.0 || self.sizing_rate >= 1.0 {
            return Err(EngineError::Config(format!(
                "rates out of range: learning_rate={}, sizing_rate={}",
                self.learning_rate, self.sizing_rate
            )));
        }
        Ok(())
    }

    pub fn cycle_period(&self) -> Duration {
        Duration::from_secs(self.cycle_secs.max(1))
    }

    pub fn decision_period(&self) -> Duration {
        Duration::from_secs(self.decision_secs.max(1))
    }

    pub fn report_period(&self) -> Duration {
        Duration::from_secs(self.report_secs.max(1))
    }

    pub fn feed_period(&self) -> Duration {
        Duration::from_secs(self.feed_secs.max(1))
    }
}

fn default_symbol() -> String { "BTC/USD".to_string() }
fn default_cash_asset() -> String { "cash".to_string() }
fn default_signal_names() -> Vec<String> {
    ["SentimentAgent", "MAAgent", "BollingerAgent", "RSIAgent"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_macro_names() -> Vec<String> {
    ["MACRO_0", "MACRO_1", "MACRO_2", "VaR"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_base_quantity() -> f64 { 1.0 }
fn default_start_capital() -> f64 { 10_000.0 }
fn default_learning_rate() -> f64 { 0.05 }
fn default_sizing_rate() -> f64 { 0.05 }
fn default_min_closed_trades() -> usize { 20 }
fn default_take_profit() -> f64 { 1.2 }
fn default_stop_loss() -> f64 { 0.8 }
fn default_cycle_secs() -> u64 { 60 }
fn default_decision_secs() -> u64 { 60 }
fn default_report_secs() -> u64 { 30 }
fn default_feed_secs() -> u64 { 10 }
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_DATA_DIR)
}
fn default_broker_url() -> String { "https://paper-api.alpaca.markets".to_string() }
fn default_market_data_url() -> String { "https://data.alpaca.markets".to_string() }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.signal_names.len(), 4);
        assert_eq!(config.min_closed_trades, 20);
        assert_eq!(config.action_encoding, ActionEncoding::Signed);
    }

    #[test]
    fn test_rejects_inverted_risk_limits() {
        let config = EngineConfig {
            take_profit: 0.9,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_rejects_empty_signals() {
        let config = EngineConfig {
            signal_names: vec![],
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
