//! Replay driver - single-pass simulation over historical candles
//!
//! Row `i` only ever sees ledger rows created before it: the classifier
//! is refit from the ledger as it stands when a buy is proposed, and
//! weights move only when a sell closes a batch.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::aggregator::{self, Availability, TradingSignal};
use crate::cbr::{self, CbrClassifier, RetrainOutcome};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::learner::{WeightHistory, WeightLearner, WeightVector};
use crate::ledger::{Action, Ledger, TradeRecord};
use crate::matching::{MatchPolicy, ReplayMatching};
use crate::portfolio::CapitalState;
use crate::schema::{Schema, SignalReading};
use crate::store::DataStore;

/// Macro column converted to its percentage change before use
pub const VAR_COLUMN: &str = "VaR";

const DATETIME_COLUMN: &str = "datetime";
const CLOSE_COLUMN: &str = "Close";

/// Accepted naive datetime layouts, tried in order after RFC 3339
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d-%m-%Y", "%d/%m/%Y"];

/// One historical time step
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalRow {
    pub datetime: DateTime<Utc>,
    pub close: f64,
    pub signals: SignalReading,
    pub macros: Vec<f64>,
}

/// Chronologically ordered candles with signal and macro columns
#[derive(Debug, Clone)]
pub struct HistoricalData {
    rows: Vec<HistoricalRow>,
}

impl HistoricalData {
    pub fn load(path: impl AsRef<Path>, schema: &Schema) -> EngineResult<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let data = Self::from_reader(file, schema)?;
        info!(
            "Loaded {} historical rows from {}",
            data.len(),
            path.as_ref().display()
        );
        Ok(data)
    }

    pub fn from_reader<R: Read>(reader: R, schema: &Schema) -> EngineResult<Self> {
        let mut reader = csv::Reader::from_reader(reader);
        let headers = reader.headers()?.clone();
        let column = |name: &str| -> EngineResult<usize> {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or_else(|| EngineError::Schema(format!("historical data has no '{}' column", name)))
        };

        let datetime_col = column(DATETIME_COLUMN)?;
        let close_col = column(CLOSE_COLUMN)?;
        let signal_cols = schema
            .signals()
            .iter()
            .map(|s| column(s))
            .collect::<EngineResult<Vec<_>>>()?;
        let macro_cols = schema
            .macros()
            .iter()
            .map(|s| column(s))
            .collect::<EngineResult<Vec<_>>>()?;

        let mut rows = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let value = |col: usize| -> EngineResult<f64> {
                let raw = record.get(col).unwrap_or("").trim();
                let v: f64 = raw.parse().map_err(|_| {
                    EngineError::malformed(row, format!("{}: invalid number '{}'", &headers[col], raw))
                })?;
                if v.is_finite() {
                    Ok(v)
                } else {
                    Err(EngineError::malformed(row, format!("{}: non-finite value", &headers[col])))
                }
            };

            let close = value(close_col)?;
            if close <= 0.0 {
                return Err(EngineError::malformed(row, format!("non-positive close {}", close)));
            }
            rows.push(HistoricalRow {
                datetime: parse_datetime(record.get(datetime_col).unwrap_or(""), row)?,
                close,
                signals: SignalReading(
                    signal_cols.iter().map(|&c| value(c)).collect::<EngineResult<_>>()?,
                ),
                macros: macro_cols.iter().map(|&c| value(c)).collect::<EngineResult<_>>()?,
            });
        }

        rows.sort_by_key(|r| r.datetime);
        if let Some(var) = schema.macros().iter().position(|m| m == VAR_COLUMN) {
            var_to_pct_change(&mut rows, var);
        }
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[HistoricalRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn parse_datetime(raw: &str, row: usize) -> EngineResult<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(t.and_utc());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(raw, format) {
            if let Some(t) = d.and_hms_opt(0, 0, 0) {
                return Ok(t.and_utc());
            }
        }
    }
    Err(EngineError::malformed(row, format!("unrecognised datetime '{}'", raw)))
}

/// Replace the column by its step-over-step change; first row and
/// zero predecessors give 0.0
fn var_to_pct_change(rows: &mut [HistoricalRow], col: usize) {
    let mut previous: Option<f64> = None;
    for row in rows.iter_mut() {
        let current = row.macros[col];
        row.macros[col] = match previous {
            Some(p) if p != 0.0 => (current - p) / p,
            _ => 0.0,
        };
        previous = Some(current);
    }
}

/// End-of-run report
#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    pub realized_pnl: f64,
    pub cash: f64,
    pub position: f64,
    pub final_close: f64,
    pub weights: Vec<f64>,
    pub trades: usize,
    pub closed_batches: usize,
    pub marked_to_market: usize,
}

/// Historical driver owning its own ledger, weights, classifier and capital
pub struct ReplayDriver {
    schema: Schema,
    base_quantity: f64,
    sizing_rate: f64,
    capital: CapitalState,
    learner: WeightLearner,
    weights: WeightHistory,
    classifier: CbrClassifier,
    ledger: Ledger,
    matching: ReplayMatching,
    /// Closed-row count the classifier was last fit on
    fitted_on: Option<usize>,
    closed_batches: usize,
}

impl ReplayDriver {
    /// Uniform initial weights and a fresh ledger
    pub fn new(config: &EngineConfig, schema: Schema) -> Self {
        let weights = WeightHistory::new(WeightVector::uniform(&schema));
        Self::with_weights(config, schema, weights)
    }

    pub fn with_weights(config: &EngineConfig, schema: Schema, weights: WeightHistory) -> Self {
        Self {
            base_quantity: config.base_quantity,
            sizing_rate: config.sizing_rate,
            capital: CapitalState::new(config.start_capital),
            learner: WeightLearner::new(config.learning_rate),
            weights,
            classifier: CbrClassifier::new(&schema, config.action_encoding, config.min_closed_trades),
            ledger: Ledger::new(&schema),
            matching: ReplayMatching,
            fitted_on: None,
            closed_batches: 0,
            schema,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn weights(&self) -> &WeightHistory {
        &self.weights
    }

    pub fn capital(&self) -> CapitalState {
        self.capital
    }

    pub fn classifier(&self) -> &CbrClassifier {
        &self.classifier
    }

    /// Run every row once, then mark leftover buys to the final close
    pub fn simulate(&mut self, data: &HistoricalData) -> EngineResult<ReplaySummary> {
        let Some(last) = data.rows().last() else {
            return Err(EngineError::InsufficientData("no historical rows to replay".into()));
        };
        let final_close = last.close;

        for (i, row) in data.rows().iter().enumerate() {
            self.step(i, row)?;
        }

        let marked = self.ledger.mark_to_market(final_close);
        let summary = ReplaySummary {
            realized_pnl: self.ledger.realized_pnl(),
            cash: self.capital.cash,
            position: self.capital.position,
            final_close,
            weights: self.weights.latest().values().to_vec(),
            trades: self.ledger.len(),
            closed_batches: self.closed_batches,
            marked_to_market: marked,
        };
        info!(
            "Final PnL: {}, Capital: {}, Position: {} @ Price {}",
            summary.realized_pnl, summary.cash, summary.position, final_close
        );
        info!("Weights: {:?}", summary.weights);
        info!("# Trades {}", summary.trades);
        Ok(summary)
    }

    fn step(&mut self, i: usize, row: &HistoricalRow) -> EngineResult<()> {
        let available = Availability {
            cash: self.capital.cash,
            position: self.capital.position,
            price: row.close,
            base_quantity: self.base_quantity,
        };
        match aggregator::decide(self.weights.latest(), &row.signals, &available) {
            TradingSignal::Buy { score } => self.buy(i, row, score),
            TradingSignal::Sell { score } => self.sell(i, row, score),
            TradingSignal::Hold => Ok(()),
        }
    }

    fn buy(&mut self, i: usize, row: &HistoricalRow, score: f64) -> EngineResult<()> {
        let mut record = TradeRecord::new(
            row.datetime,
            Action::Buy,
            self.base_quantity,
            row.close,
            self.capital.cash - self.base_quantity * row.close,
            row.signals.values().to_vec(),
            row.macros.clone(),
        );

        self.refit()?;
        let prediction = self.classifier.predict(&self.classifier.features(&record));
        let quantity = cbr::adjust_quantity(
            self.base_quantity,
            prediction,
            self.sizing_rate,
            self.capital.affordable(row.close),
        );
        if quantity <= 0.0 {
            debug!(row = i, "Sized buy rounds to zero, skipping");
            return Ok(());
        }

        self.capital.apply_buy(quantity, row.close)?;
        record.quantity = quantity;
        record.balance = self.capital.cash;
        let index = self.ledger.append(record)?;
        info!(
            row = i,
            index,
            score,
            ?prediction,
            "Buy {} @ {} | cash {}",
            quantity,
            row.close,
            self.capital.cash
        );
        Ok(())
    }

    fn sell(&mut self, i: usize, row: &HistoricalRow, score: f64) -> EngineResult<()> {
        let quantity = self.capital.position;
        self.capital.apply_sell(quantity, row.close)?;
        let record = TradeRecord::new(
            row.datetime,
            Action::Sell,
            quantity,
            row.close,
            self.capital.cash,
            row.signals.values().to_vec(),
            row.macros.clone(),
        );
        let index = self.ledger.append(record)?;
        let close = self.matching.close(&mut self.ledger, index)?;
        self.closed_batches += 1;

        // Matched buys first, then the sell, in ledger order
        let mut batch = close.buys.clone();
        batch.push(index);
        let trades: Vec<&TradeRecord> = batch.iter().filter_map(|&b| self.ledger.get(b)).collect();
        let (updated, applied) = self.learner.update(self.weights.latest(), trades);
        for &b in &batch {
            self.ledger.mark_learned(b)?;
        }
        self.weights.push(updated);

        info!(
            row = i,
            index,
            score,
            pnl = close.pnl,
            matched = close.buys.len(),
            applied,
            "Sell {} @ {} | cash {}",
            quantity,
            row.close,
            self.capital.cash
        );
        Ok(())
    }

    /// Refit only when new closed rows arrived since the last fit
    fn refit(&mut self) -> EngineResult<()> {
        let closed = self.ledger.closed_count();
        if self.fitted_on == Some(closed) {
            return Ok(());
        }
        match self.classifier.retrain(self.ledger.records())? {
            RetrainOutcome::Trained { .. } => self.fitted_on = Some(closed),
            RetrainOutcome::Skipped { .. } if closed > 0 && self.classifier.is_trained() => {
                warn!("Keeping previous classifier: retrain skipped at {} closed rows", closed);
            }
            RetrainOutcome::Skipped { .. } => {}
        }
        Ok(())
    }

    /// Write tradebook, weight history and model
    pub fn persist(&self, store: &DataStore) -> EngineResult<()> {
        if store.schema() != &self.schema {
            return Err(EngineError::Schema("store schema differs from replay schema".into()));
        }
        store.save_tradebook(&self.ledger)?;
        store.save_weights(&self.weights)?;
        if let Some(model) = self.classifier.model() {
            store.save_model(model)?;
        }
        info!("Replay outputs written to {}", store.root().display());
        Ok(())
    }
}
