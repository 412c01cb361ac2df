//! Adaptive Trader Library
//!
//! Signal aggregation, weight learning, case-based position sizing and
//! trade-ledger bookkeeping, driven either over historical data (replay)
//! or against a brokerage venue (live).

pub mod aggregator;
pub mod broker;
pub mod cbr;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod learner;
pub mod ledger;
pub mod matching;
pub mod paper;
pub mod portfolio;
pub mod replay;
pub mod runner;
pub mod schema;
pub mod signals;
pub mod state;
pub mod store;

#[cfg(test)]
mod tests;

// Re-export main types for convenience
pub use aggregator::{Availability, TradingSignal};
pub use broker::{Broker, Order, OrderSide, OrderStatus};
pub use cbr::{CbrClassifier, Prediction, RetrainOutcome};
pub use client::AlpacaClient;
pub use config::{ActionEncoding, EngineConfig, TradingMode, VenueConfig};
pub use engine::{Coordinator, CycleOutcome, DecisionOutcome, ReconcileReport, StateSnapshot};
pub use error::{EngineError, EngineResult};
pub use learner::{WeightHistory, WeightLearner, WeightVector};
pub use ledger::{Action, Ledger, OrderType, RecordStatus, TradeRecord};
pub use matching::{MatchPolicy, ReplayMatching, StackMatching};
pub use paper::PaperBroker;
pub use portfolio::{CapitalState, RiskBreach, RiskBreachKind, RiskLimits};
pub use replay::{HistoricalData, ReplayDriver, ReplaySummary};
pub use runner::{RunOutcome, TraderRunner};
pub use schema::{Schema, SignalReading};
pub use signals::{FeedSet, SharedFeed, SignalSource, SnapshotFeed, PRICE_KEY};
pub use state::{NowState, StateManager};
pub use store::DataStore;
