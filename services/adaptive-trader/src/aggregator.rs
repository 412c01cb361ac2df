//! Signal aggregation - weighted vote of the signal readings

use tracing::info;

use crate::learner::WeightVector;
use crate::schema::SignalReading;

/// Direction proposed by the aggregate score
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TradingSignal {
    Buy { score: f64 },
    Sell { score: f64 },
    Hold,
}

impl TradingSignal {
    pub fn is_hold(&self) -> bool {
        matches!(self, TradingSignal::Hold)
    }
}

/// Funds available when a proposal is checked
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Availability {
    pub cash: f64,
    pub position: f64,
    pub price: f64,
    pub base_quantity: f64,
}

/// `sum(W[name] * S[name])`
pub fn score(weights: &WeightVector, reading: &SignalReading) -> f64 {
    weights
        .values()
        .iter()
        .zip(reading.values())
        .map(|(w, s)| w * s)
        .sum()
}

/// Sign of the score picks the direction; exactly zero holds
pub fn propose(weights: &WeightVector, reading: &SignalReading) -> TradingSignal {
    let score = score(weights, reading);
    if score > 0.0 {
        TradingSignal::Buy { score }
    } else if score < 0.0 {
        TradingSignal::Sell { score }
    } else {
        TradingSignal::Hold
    }
}

/// Downgrade a proposal the account cannot carry out
pub fn check_availability(signal: TradingSignal, available: &Availability) -> TradingSignal {
    match signal {
        TradingSignal::Buy { .. } => {
            let needed = available.base_quantity * available.price;
            if available.cash >= needed {
                signal
            } else {
                info!(
                    "Insufficient balance to buy {} @ {}, available cash: {}",
                    available.base_quantity, available.price, available.cash
                );
                TradingSignal::Hold
            }
        }
        TradingSignal::Sell { .. } => {
            if available.position > 0.0 {
                signal
            } else {
                info!("No position to sell, holding");
                TradingSignal::Hold
            }
        }
        TradingSignal::Hold => TradingSignal::Hold,
    }
}

/// Full aggregator decision: propose, then gate on availability
pub fn decide(
    weights: &WeightVector,
    reading: &SignalReading,
    available: &Availability,
) -> TradingSignal {
    check_availability(propose(weights, reading), available)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn available(cash: f64, position: f64) -> Availability {
        Availability {
            cash,
            position,
            price: 100.0,
            base_quantity: 1.0,
        }
    }

    #[test]
    fn test_score_is_weighted_sum() {
        let w = WeightVector(vec![0.5, 0.25]);
        let s = SignalReading(vec![1.0, -2.0]);
        assert_eq!(score(&w, &s), 0.0);
        assert_eq!(propose(&w, &s), TradingSignal::Hold);

        let s = SignalReading(vec![1.0, 0.5]);
        assert_eq!(propose(&w, &s), TradingSignal::Buy { score: 0.625 });

        let s = SignalReading(vec![-1.0, 0.0]);
        assert_eq!(propose(&w, &s), TradingSignal::Sell { score: -0.5 });
    }

    #[test]
    fn test_buy_needs_cash_for_base_quantity() {
        let w = WeightVector(vec![1.0]);
        let s = SignalReading(vec![1.0]);
        assert!(decide(&w, &s, &available(99.0, 0.0)).is_hold());
        assert!(matches!(
            decide(&w, &s, &available(100.0, 0.0)),
            TradingSignal::Buy { .. }
        ));
    }

    #[test]
    fn test_sell_needs_position() {
        let w = WeightVector(vec![1.0]);
        let s = SignalReading(vec![-1.0]);
        assert!(decide(&w, &s, &available(1000.0, 0.0)).is_hold());
        assert!(matches!(
            decide(&w, &s, &available(0.0, 0.5)),
            TradingSignal::Sell { .. }
        ));
    }
}
