//! Capital tracking - cash, position and risk limits for one instrument

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};

/// Cash and position for a long/flat book
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapitalState {
    pub cash: f64,
    pub position: f64,
    /// Fixed at initialisation; reference for take-profit/stop-loss
    pub start_capital: f64,
}

impl CapitalState {
    /// Create new state with starting cash
    pub fn new(start_capital: f64) -> Self {
        Self {
            cash: start_capital,
            position: 0.0,
            start_capital,
        }
    }

    /// Capital as reported by a venue
    pub fn from_balances(cash: f64, position: f64, start_capital: f64) -> Self {
        Self {
            cash,
            position,
            start_capital,
        }
    }

    /// Debit `quantity * price` and add `quantity` to the position
    pub fn apply_buy(&mut self, quantity: f64, price: f64) -> EngineResult<()> {
        let cost = quantity * price;
        if cost > self.cash {
            return Err(EngineError::InsufficientFunds {
                asset: "cash".to_string(),
                needed: cost,
                available: self.cash,
            });
        }
        self.cash -= cost;
        self.position += quantity;
        debug!(
            "Buy {} @ {} | cash {} | position {}",
            quantity, price, self.cash, self.position
        );
        Ok(())
    }

    /// Credit `quantity * price` and reduce the position
    pub fn apply_sell(&mut self, quantity: f64, price: f64) -> EngineResult<()> {
        if quantity > self.position {
            return Err(EngineError::InsufficientFunds {
                asset: "position".to_string(),
                needed: quantity,
                available: self.position,
            });
        }
        self.cash += quantity * price;
        self.position -= quantity;
        // Full exit returns exactly to flat
        if self.position.abs() < 1e-12 {
            self.position = 0.0;
        }
        debug!(
            "Sell {} @ {} | cash {} | position {}",
            quantity, price, self.cash, self.position
        );
        Ok(())
    }

    /// Largest quantity purchasable at `price`
    pub fn affordable(&self, price: f64) -> f64 {
        if price > 0.0 {
            self.cash / price
        } else {
            0.0
        }
    }

    /// Cash plus position marked at `price`
    pub fn equity(&self, price: f64) -> f64 {
        self.cash + self.position * price
    }
}

/// Which limit was crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskBreachKind {
    TakeProfit,
    StopLoss,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskBreach {
    pub kind: RiskBreachKind,
    pub equity: f64,
    pub threshold: f64,
}

/// Take-profit and stop-loss multipliers on start capital
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub take_profit: f64,
    pub stop_loss: f64,
}

impl RiskLimits {
    pub fn new(take_profit: f64, stop_loss: f64) -> Self {
        Self {
            take_profit,
            stop_loss,
        }
    }

    pub fn check(&self, equity: f64, start_capital: f64) -> Option<RiskBreach> {
        let upper = start_capital * self.take_profit;
        let lower = start_capital * self.stop_loss;
        if equity >= upper {
            info!("Take profit reached: equity {} >= {}", equity, upper);
            Some(RiskBreach {
                kind: RiskBreachKind::TakeProfit,
                equity,
                threshold: upper,
            })
        } else if equity <= lower {
            warn!("Stop loss reached: equity {} <= {}", equity, lower);
            Some(RiskBreach {
                kind: RiskBreachKind::StopLoss,
                equity,
                threshold: lower,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capital_new() {
        let capital = CapitalState::new(10_000.0);
        assert_eq!(capital.cash, 10_000.0);
        assert_eq!(capital.position, 0.0);
        assert_eq!(capital.start_capital, 10_000.0);
    }

    #[test]
    fn test_buy_then_full_sell_conserves_capital() {
        let mut capital = CapitalState::new(10_000.0);
        capital.apply_buy(2.0, 150.0).unwrap();
        assert_eq!(capital.cash, 9_700.0);
        assert_eq!(capital.position, 2.0);

        capital.apply_sell(2.0, 160.0).unwrap();
        assert_eq!(capital.position, 0.0);
        assert_eq!(capital.cash, 10_020.0);
    }

    #[test]
    fn test_rejects_overspend_and_oversell() {
        let mut capital = CapitalState::new(100.0);
        assert!(capital.apply_buy(2.0, 60.0).is_err());
        assert!(capital.apply_sell(0.1, 60.0).is_err());
        assert_eq!(capital, CapitalState::new(100.0));
    }

    #[test]
    fn test_risk_limits() {
        let limits = RiskLimits::new(1.2, 0.8);
        assert_eq!(limits.check(11_999.0, 10_000.0), None);
        assert_eq!(
            limits.check(12_000.0, 10_000.0).map(|b| b.kind),
            Some(RiskBreachKind::TakeProfit)
        );
        assert_eq!(
            limits.check(8_000.0, 10_000.0).map(|b| b.kind),
            Some(RiskBreachKind::StopLoss)
        );
    }

    #[test]
    fn test_equity_marks_position() {
        let mut capital = CapitalState::new(1_000.0);
        capital.apply_buy(1.0, 500.0).unwrap();
        assert_eq!(capital.equity(600.0), 1_100.0);
        assert_eq!(CapitalState::from_balances(9_900.0, 1.0, 10_000.0).equity(2_200.0), 12_100.0);
        assert_eq!(capital.affordable(250.0), 2.0);
    }
}
