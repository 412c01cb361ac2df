//! Case-based reasoning classifier
//!
//! A logistic regression retrained from scratch on every closed trade in
//! the accumulated ledger. It predicts whether a proposed trade would
//! close in profit and is used only to rescale the proposed quantity.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ActionEncoding;
use crate::error::{EngineError, EngineResult};
use crate::ledger::{Action, TradeRecord};
use crate::schema::Schema;

/// Gradient descent passes per fit
const FIT_ITERATIONS: usize = 1000;
/// Gradient descent step on standardised features
const FIT_STEP: f64 = 0.5;
/// Inverse regularisation strength, as in liblinear's `C`
const REGULARISATION_C: f64 = 1.0;

/// Numeric encoding of the trade side
pub fn encode_action(action: Action, encoding: ActionEncoding) -> f64 {
    match encoding {
        ActionEncoding::Signed => action.direction(),
        ActionEncoding::Constant => 1.0,
    }
}

/// One classifier input row, schema feature order
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow(pub Vec<f64>);

impl FeatureRow {
    pub fn from_record(record: &TradeRecord, encoding: ActionEncoding) -> Self {
        let mut values = Vec::with_capacity(4 + record.signals.len() + record.macros.len());
        values.push(encode_action(record.action, encoding));
        values.push(record.quantity);
        values.push(record.price);
        values.push(record.balance);
        values.extend_from_slice(&record.signals);
        values.extend_from_slice(&record.macros);
        Self(values)
    }
}

/// Predicted outcome of a proposed trade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prediction {
    Profit,
    Loss,
}

impl Prediction {
    /// +1 when a loss is expected, -1 when a profit is expected
    pub fn loss_indicator(&self) -> f64 {
        match self {
            Prediction::Loss => 1.0,
            Prediction::Profit => -1.0,
        }
    }
}

/// Training label: profit is +1, everything else (including zero) is -1
pub fn label(pnl: f64) -> f64 {
    if pnl > 0.0 {
        1.0
    } else {
        -1.0
    }
}

/// `quantity * (1 - loss_indicator * rate)`, rounded to 2 decimals and
/// clamped to `[0, max_quantity]`. No prediction leaves size unscaled and
/// unrounded, so sub-cent base sizes still trade.
pub fn adjust_quantity(
    quantity: f64,
    prediction: Option<Prediction>,
    sizing_rate: f64,
    max_quantity: f64,
) -> f64 {
    let sized = match prediction {
        Some(p) => (quantity * (1.0 - p.loss_indicator() * sizing_rate) * 100.0).round() / 100.0,
        None => quantity,
    };
    sized.max(0.0).min(max_quantity.max(0.0))
}

/// Fitted logistic regression over standardised features
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogisticModel {
    pub feature_names: Vec<String>,
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
    pub weights: Vec<f64>,
    pub bias: f64,
    pub samples: usize,
}

impl LogisticModel {
    /// Fit on rows `x` with labels `y` in {-1, +1}
    pub fn fit(feature_names: Vec<String>, x: &[FeatureRow], y: &[f64]) -> EngineResult<Self> {
        let n = x.len();
        let dim = feature_names.len();
        if n == 0 || n != y.len() {
            return Err(EngineError::InsufficientData(format!(
                "{} rows for {} labels",
                n,
                y.len()
            )));
        }
        if let Some(bad) = x.iter().position(|r| r.0.len() != dim) {
            return Err(EngineError::malformed(
                bad,
                format!("feature row has {} values, expected {}", x[bad].0.len(), dim),
            ));
        }
        if let Some(bad) = x.iter().position(|r| r.0.iter().any(|v| !v.is_finite())) {
            return Err(EngineError::malformed(bad, "non-finite feature value"));
        }

        let mut means = vec![0.0; dim];
        for row in x {
            for (m, v) in means.iter_mut().zip(&row.0) {
                *m += v / n as f64;
            }
        }
        let mut scales = vec![0.0; dim];
        for row in x {
            for ((s, v), m) in scales.iter_mut().zip(&row.0).zip(&means) {
                *s += (v - m).powi(2) / n as f64;
            }
        }
        for s in scales.iter_mut() {
            *s = if *s > 1e-12 { s.sqrt() } else { 1.0 };
        }

        let z: Vec<Vec<f64>> = x
            .iter()
            .map(|row| standardise(&row.0, &means, &scales))
            .collect();

        let mut weights = vec![0.0; dim];
        let mut bias = 0.0;
        let l2 = 1.0 / (REGULARISATION_C * n as f64);
        for _ in 0..FIT_ITERATIONS {
            let mut grad_w = vec![0.0; dim];
            let mut grad_b = 0.0;
            for (zi, &yi) in z.iter().zip(y) {
                let margin = yi * (dot(&weights, zi) + bias);
                // d/dm log(1 + e^-m) = -sigmoid(-m)
                let g = -yi / (1.0 + margin.exp());
                for (gw, v) in grad_w.iter_mut().zip(zi) {
                    *gw += g * v / n as f64;
                }
                grad_b += g / n as f64;
            }
            for (w, gw) in weights.iter_mut().zip(&grad_w) {
                *w -= FIT_STEP * (gw + l2 * *w);
            }
            bias -= FIT_STEP * grad_b;
        }

        Ok(Self {
            feature_names,
            means,
            scales,
            weights,
            bias,
            samples: n,
        })
    }

    pub fn decision(&self, row: &FeatureRow) -> f64 {
        dot(&self.weights, &standardise(&row.0, &self.means, &self.scales)) + self.bias
    }

    /// Positive decision predicts profit; ties fall to loss
    pub fn predict(&self, row: &FeatureRow) -> Prediction {
        if self.decision(row) > 0.0 {
            Prediction::Profit
        } else {
            Prediction::Loss
        }
    }
}

fn standardise(values: &[f64], means: &[f64], scales: &[f64]) -> Vec<f64> {
    values
        .iter()
        .zip(means)
        .zip(scales)
        .map(|((v, m), s)| (v - m) / s)
        .collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Outcome of a retrain request
#[derive(Debug, Clone, PartialEq)]
pub enum RetrainOutcome {
    /// Too few closed trades, or only one outcome class
    Skipped { closed: usize, reason: String },
    Trained { samples: usize, accuracy: f64 },
}

/// Profit/loss classifier owned by the learning state
#[derive(Debug, Clone)]
pub struct CbrClassifier {
    feature_names: Vec<String>,
    encoding: ActionEncoding,
    min_closed_trades: usize,
    model: Option<LogisticModel>,
}

impl CbrClassifier {
    pub fn new(schema: &Schema, encoding: ActionEncoding, min_closed_trades: usize) -> Self {
        Self {
            feature_names: schema.feature_names(),
            encoding,
            min_closed_trades,
            model: None,
        }
    }

    pub fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    pub fn model(&self) -> Option<&LogisticModel> {
        self.model.as_ref()
    }

    /// Install a persisted model after checking its feature layout
    pub fn restore(&mut self, model: LogisticModel) -> EngineResult<()> {
        if model.feature_names != self.feature_names {
            return Err(EngineError::Schema(format!(
                "persisted model features {:?} do not match {:?}",
                model.feature_names, self.feature_names
            )));
        }
        self.model = Some(model);
        Ok(())
    }

    pub fn features(&self, record: &TradeRecord) -> FeatureRow {
        FeatureRow::from_record(record, self.encoding)
    }

    /// Refit on every closed row; the new model fully replaces the old one
    pub fn retrain<'a>(
        &mut self,
        rows: impl IntoIterator<Item = &'a TradeRecord>,
    ) -> EngineResult<RetrainOutcome> {
        let closed: Vec<&TradeRecord> = rows.into_iter().filter(|r| r.is_closed()).collect();
        if closed.len() <= self.min_closed_trades {
            debug!(
                "CBR retrain skipped: {} closed trades (need more than {})",
                closed.len(),
                self.min_closed_trades
            );
            return Ok(RetrainOutcome::Skipped {
                closed: closed.len(),
                reason: "insufficient closed trades".to_string(),
            });
        }

        let x: Vec<FeatureRow> = closed.iter().map(|r| self.features(r)).collect();
        let y: Vec<f64> = closed
            .iter()
            .map(|r| label(r.pnl().unwrap_or_default()))
            .collect();

        if y.iter().all(|&l| l == y[0]) {
            warn!(
                "CBR retrain skipped: all {} closed trades share one outcome",
                closed.len()
            );
            return Ok(RetrainOutcome::Skipped {
                closed: closed.len(),
                reason: "single outcome class".to_string(),
            });
        }

        let model = LogisticModel::fit(self.feature_names.clone(), &x, &y)?;
        let correct = x
            .iter()
            .zip(&y)
            .filter(|(row, &l)| {
                let p = model.predict(row);
                (p == Prediction::Profit) == (l > 0.0)
            })
            .count();
        let accuracy = correct as f64 / x.len() as f64;

        info!(
            "CBR retrained on {} closed trades (training accuracy {:.3})",
            x.len(),
            accuracy
        );
        self.model = Some(model);
        Ok(RetrainOutcome::Trained {
            samples: x.len(),
            accuracy,
        })
    }

    /// Predicted outcome, or None while untrained
    pub fn predict(&self, row: &FeatureRow) -> Option<Prediction> {
        self.model.as_ref().map(|m| m.predict(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn schema() -> Schema {
        Schema::new(vec!["s".into()], vec![]).unwrap()
    }

    fn closed(signal: f64, pnl: f64) -> TradeRecord {
        let mut r = TradeRecord::new(Utc::now(), Action::Buy, 1.0, 100.0, 1000.0, vec![signal], vec![]);
        r.pnl = Some(pnl);
        r
    }

    #[test]
    fn test_skips_at_threshold() {
        let mut cbr = CbrClassifier::new(&schema(), ActionEncoding::Signed, 20);
        let rows: Vec<_> = (0..20)
            .map(|i| closed(i as f64, if i % 2 == 0 { 1.0 } else { -1.0 }))
            .collect();
        let outcome = cbr.retrain(&rows).unwrap();
        assert!(matches!(outcome, RetrainOutcome::Skipped { closed: 20, .. }));
        assert!(!cbr.is_trained());
        assert_eq!(cbr.predict(&cbr.features(&rows[0])), None);
    }

    #[test]
    fn test_learns_separable_outcomes() {
        let mut cbr = CbrClassifier::new(&schema(), ActionEncoding::Signed, 20);
        let rows: Vec<_> = (0..30)
            .map(|i| {
                let s = if i % 2 == 0 { 1.0 } else { -1.0 };
                closed(s + (i as f64) * 0.01, s * 5.0)
            })
            .collect();
        let outcome = cbr.retrain(&rows).unwrap();
        assert!(matches!(outcome, RetrainOutcome::Trained { samples: 30, .. }));

        let winner = closed(1.2, 0.0);
        let loser = closed(-1.2, 0.0);
        assert_eq!(cbr.predict(&cbr.features(&winner)), Some(Prediction::Profit));
        assert_eq!(cbr.predict(&cbr.features(&loser)), Some(Prediction::Loss));
    }

    #[test]
    fn test_single_class_is_skipped() {
        let mut cbr = CbrClassifier::new(&schema(), ActionEncoding::Signed, 2);
        let rows: Vec<_> = (0..5).map(|i| closed(i as f64, 3.0)).collect();
        assert!(matches!(
            cbr.retrain(&rows).unwrap(),
            RetrainOutcome::Skipped { closed: 5, .. }
        ));
    }

    #[test]
    fn test_zero_pnl_labels_as_loss() {
        assert_eq!(label(0.0), -1.0);
        assert_eq!(label(0.01), 1.0);
    }

    #[test]
    fn test_action_encoding() {
        assert_eq!(encode_action(Action::Sell, ActionEncoding::Signed), -1.0);
        assert_eq!(encode_action(Action::Sell, ActionEncoding::Constant), 1.0);
        let mut r = closed(0.3, 1.0);
        r.action = Action::Sell;
        let row = FeatureRow::from_record(&r, ActionEncoding::Signed);
        assert_eq!(row.0, vec![-1.0, 1.0, 100.0, 1000.0, 0.3]);
    }

    #[test]
    fn test_adjust_quantity() {
        assert_eq!(adjust_quantity(1.0, None, 0.05, 10.0), 1.0);
        assert_eq!(adjust_quantity(1.0, Some(Prediction::Loss), 0.05, 10.0), 0.95);
        assert_eq!(adjust_quantity(1.0, Some(Prediction::Profit), 0.05, 10.0), 1.05);
        // Bounded by what the account can carry
        assert_eq!(adjust_quantity(1.0, Some(Prediction::Profit), 0.05, 1.0), 1.0);
        assert_eq!(adjust_quantity(1.0, Some(Prediction::Loss), 0.05, -3.0), 0.0);
        // Untrained sizing keeps sub-cent quantities intact
        assert_eq!(adjust_quantity(0.004, None, 0.05, 100.0), 0.004);
        assert_eq!(adjust_quantity(0.004, None, 0.05, 0.001), 0.001);
    }

    #[test]
    fn test_restore_checks_features() {
        let mut cbr = CbrClassifier::new(&schema(), ActionEncoding::Signed, 0);
        let model = LogisticModel {
            feature_names: vec!["other".into()],
            means: vec![],
            scales: vec![],
            weights: vec![],
            bias: 0.0,
            samples: 0,
        };
        assert!(cbr.restore(model).is_err());
    }
}
