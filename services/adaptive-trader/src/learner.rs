//! Weight learner - perceptron-style credit assignment from realised PnL

use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::ledger::TradeRecord;
use crate::schema::Schema;

/// One weight per signal, schema order
#[derive(Debug, Clone, PartialEq)]
pub struct WeightVector(pub Vec<f64>);

impl WeightVector {
    /// Equal weights summing to one
    pub fn uniform(schema: &Schema) -> Self {
        let n = schema.signals().len();
        Self(vec![1.0 / n as f64; n])
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Append-only history of weight vectors; the last row is current
#[derive(Debug, Clone)]
pub struct WeightHistory {
    rows: Vec<WeightVector>,
}

impl WeightHistory {
    pub fn new(initial: WeightVector) -> Self {
        Self { rows: vec![initial] }
    }

    pub fn from_rows(schema: &Schema, rows: Vec<WeightVector>) -> EngineResult<Self> {
        if rows.is_empty() {
            return Ok(Self::new(WeightVector::uniform(schema)));
        }
        if let Some((i, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, r)| r.len() != schema.signals().len())
        {
            return Err(EngineError::malformed(
                i,
                format!(
                    "weight row has {} values, expected {}",
                    row.len(),
                    schema.signals().len()
                ),
            ));
        }
        Ok(Self { rows })
    }

    pub fn latest(&self) -> &WeightVector {
        // Never empty: constructed with at least one row
        &self.rows[self.rows.len() - 1]
    }

    pub fn push(&mut self, weights: WeightVector) {
        self.rows.push(weights);
    }

    pub fn rows(&self) -> &[WeightVector] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Sign of a realised PnL; zero PnL carries no credit
pub fn pnl_sign(pnl: f64) -> f64 {
    if pnl > 0.0 {
        1.0
    } else if pnl < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Additive, unbounded weight update from completed trades
#[derive(Debug, Clone, Copy)]
pub struct WeightLearner {
    learning_rate: f64,
}

impl WeightLearner {
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }

    /// Apply one completed trade in place; open rows are ignored
    pub fn apply_one(&self, weights: &mut WeightVector, trade: &TradeRecord) -> bool {
        let Some(pnl) = trade.pnl() else {
            return false;
        };
        let sign_factor = pnl_sign(pnl) * trade.action.direction();
        if sign_factor == 0.0 {
            debug!(seq = trade.seq, pnl, "No credit for trade");
            return false;
        }
        for (w, s) in weights.0.iter_mut().zip(trade.signals.iter()) {
            *w += sign_factor * self.learning_rate * s;
        }
        true
    }

    /// Apply trades in the given (ledger) order; returns the new vector
    /// and the number of trades that moved it
    pub fn update<'a>(
        &self,
        current: &WeightVector,
        trades: impl IntoIterator<Item = &'a TradeRecord>,
    ) -> (WeightVector, usize) {
        let mut weights = current.clone();
        let applied = trades
            .into_iter()
            .filter(|t| self.apply_one(&mut weights, t))
            .count();
        info!(
            "Weight update from {} trades: {:?} -> {:?}",
            applied, current.0, weights.0
        );
        (weights, applied)
    }
}
