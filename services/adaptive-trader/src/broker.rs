//! Execution venue boundary
//!
//! The coordinator only talks to the venue through [`Broker`], so the
//! live REST client and the in-memory paper venue are interchangeable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::ledger::{Action, OrderType};

/// Order side at the venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    pub fn action(&self) -> Action {
        match self {
            OrderSide::Buy => Action::Buy,
            OrderSide::Sell => Action::Sell,
        }
    }
}

/// Venue order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Accepted,
    New,
    PartiallyFilled,
    Filled,
    #[serde(alias = "canceled")]
    Cancelled,
    Rejected,
    Expired,
    #[serde(other)]
    Other,
}

impl OrderStatus {
    /// Resting at the venue without a fill. Alpaca reports a resting
    /// unfilled order as `new` as well as `accepted`, so both are cancelled.
    pub fn is_unfilled(&self) -> bool {
        matches!(self, OrderStatus::Accepted | OrderStatus::New)
    }
}

/// Order as reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub qty: f64,
    pub filled_qty: f64,
    pub filled_avg_price: Option<f64>,
    pub limit_price: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Brokerage capability handed to the coordinator
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Venue name for logs
    fn name(&self) -> &str;

    /// Last traded price of `symbol`
    async fn latest_price(&self, symbol: &str) -> EngineResult<f64>;

    /// Cash balance for the cash asset, position quantity otherwise
    async fn get_balance(&self, asset: &str) -> EngineResult<f64>;

    async fn place_market_order(
        &self,
        side: OrderSide,
        symbol: &str,
        qty: f64,
    ) -> EngineResult<Order>;

    async fn place_limit_order(
        &self,
        side: OrderSide,
        symbol: &str,
        qty: f64,
        limit_price: f64,
    ) -> EngineResult<Order>;

    /// Every order the venue knows about for this account
    async fn list_orders(&self) -> EngineResult<Vec<Order>>;

    async fn cancel_order(&self, id: &str) -> EngineResult<()>;
}
