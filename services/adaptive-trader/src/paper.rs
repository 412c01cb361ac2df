//! Paper venue - in-memory execution for paper mode and tests

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, Order, OrderSide, OrderStatus};
use crate::error::{EngineError, EngineResult};
use crate::ledger::OrderType;
use crate::portfolio::CapitalState;
use crate::signals::{SharedFeed, SignalSource};

struct PaperBook {
    capital: CapitalState,
    price: f64,
    orders: Vec<Order>,
    fail_next: Option<String>,
}

/// Simulated venue: market orders fill immediately at the latest price,
/// limit orders rest until the price crosses them or they are cancelled
pub struct PaperBroker {
    symbol: String,
    cash_asset: String,
    price_feed: Option<SharedFeed>,
    book: Mutex<PaperBook>,
}

impl PaperBroker {
    pub fn new(symbol: impl Into<String>, cash_asset: impl Into<String>, start_capital: f64) -> Self {
        Self {
            symbol: symbol.into(),
            cash_asset: cash_asset.into(),
            price_feed: None,
            book: Mutex::new(PaperBook {
                capital: CapitalState::new(start_capital),
                price: 0.0,
                orders: Vec::new(),
                fail_next: None,
            }),
        }
    }

    /// Read prices from a shared feed instead of `set_price`
    pub fn with_price_feed(mut self, feed: SharedFeed) -> Self {
        self.price_feed = Some(feed);
        self
    }

    /// Move the simulated price and fill any resting limit orders it crosses
    pub async fn set_price(&self, price: f64) {
        let mut book = self.book.lock().await;
        book.price = price;
        fill_crossed(&mut book, price);
    }

    /// Make the next order placement fail with `reason`
    pub async fn fail_next_order(&self, reason: impl Into<String>) {
        self.book.lock().await.fail_next = Some(reason.into());
    }

    pub async fn capital(&self) -> CapitalState {
        self.book.lock().await.capital
    }

    fn current_price(&self, book: &PaperBook) -> EngineResult<f64> {
        let price = match &self.price_feed {
            Some(feed) if !feed.is_empty() => feed.latest(),
            _ => book.price,
        };
        if price > 0.0 && price.is_finite() {
            Ok(price)
        } else {
            Err(EngineError::Execution(format!(
                "no price available for {}",
                self.symbol
            )))
        }
    }

    fn check_symbol(&self, symbol: &str) -> EngineResult<()> {
        if symbol == self.symbol {
            Ok(())
        } else {
            Err(EngineError::Execution(format!(
                "paper venue only trades {}, got {}",
                self.symbol, symbol
            )))
        }
    }

    fn new_order(
        &self,
        book: &PaperBook,
        side: OrderSide,
        order_type: OrderType,
        qty: f64,
        limit_price: Option<f64>,
    ) -> Order {
        let now = Utc::now();
        Order {
            id: format!("paper-{}", book.orders.len() + 1),
            client_order_id: Uuid::new_v4().to_string(),
            symbol: self.symbol.clone(),
            side,
            order_type,
            status: OrderStatus::Accepted,
            qty,
            filled_qty: 0.0,
            filled_avg_price: None,
            limit_price,
            created_at: now,
            updated_at: now,
        }
    }
}

fn take_failure(book: &mut PaperBook) -> EngineResult<()> {
    match book.fail_next.take() {
        Some(reason) => Err(EngineError::Execution(reason)),
        None => Ok(()),
    }
}

fn apply_fill(capital: &mut CapitalState, order: &mut Order, price: f64) -> EngineResult<()> {
    match order.side {
        OrderSide::Buy => capital.apply_buy(order.qty, price)?,
        OrderSide::Sell => capital.apply_sell(order.qty, price)?,
    }
    order.status = OrderStatus::Filled;
    order.filled_qty = order.qty;
    order.filled_avg_price = Some(price);
    order.updated_at = Utc::now();
    Ok(())
}

fn fill_crossed(book: &mut PaperBook, price: f64) {
    let PaperBook {
        capital, orders, ..
    } = book;
    for order in orders.iter_mut().filter(|o| o.status.is_unfilled()) {
        let Some(limit) = order.limit_price else {
            continue;
        };
        let crossed = match order.side {
            OrderSide::Buy => price <= limit,
            OrderSide::Sell => price >= limit,
        };
        if !crossed {
            continue;
        }
        match apply_fill(capital, order, limit) {
            Ok(()) => info!(id = %order.id, price = limit, "Paper limit order filled"),
            Err(e) => warn!(id = %order.id, error = %e, "Paper limit order left resting"),
        }
    }
}

#[async_trait::async_trait]
impl Broker for PaperBroker {
    fn name(&self) -> &str {
        "paper"
    }

    async fn latest_price(&self, symbol: &str) -> EngineResult<f64> {
        self.check_symbol(symbol)?;
        let book = self.book.lock().await;
        self.current_price(&book)
    }

    async fn get_balance(&self, asset: &str) -> EngineResult<f64> {
        let book = self.book.lock().await;
        if asset == self.cash_asset {
            Ok(book.capital.cash)
        } else if asset == self.symbol {
            Ok(book.capital.position)
        } else {
            Ok(0.0)
        }
    }

    async fn place_market_order(
        &self,
        side: OrderSide,
        symbol: &str,
        qty: f64,
    ) -> EngineResult<Order> {
        self.check_symbol(symbol)?;
        let mut book = self.book.lock().await;
        take_failure(&mut book)?;
        let price = self.current_price(&book)?;

        let mut order = self.new_order(&book, side, OrderType::Market, qty, None);
        apply_fill(&mut book.capital, &mut order, price)?;
        debug!(
            id = %order.id,
            side = side.as_str(),
            qty,
            price,
            "Paper market order filled"
        );
        book.orders.push(order.clone());
        Ok(order)
    }

    async fn place_limit_order(
        &self,
        side: OrderSide,
        symbol: &str,
        qty: f64,
        limit_price: f64,
    ) -> EngineResult<Order> {
        self.check_symbol(symbol)?;
        let mut book = self.book.lock().await;
        take_failure(&mut book)?;
        if !(limit_price > 0.0) {
            return Err(EngineError::Execution(format!(
                "invalid limit price {}",
                limit_price
            )));
        }
        let mut order = self.new_order(&book, side, OrderType::Limit, qty, Some(limit_price));

        // Marketable limits fill at once at the current price
        if let Ok(price) = self.current_price(&book) {
            let marketable = match side {
                OrderSide::Buy => price <= limit_price,
                OrderSide::Sell => price >= limit_price,
            };
            if marketable {
                apply_fill(&mut book.capital, &mut order, price)?;
            }
        }
        debug!(
            id = %order.id,
            side = side.as_str(),
            qty,
            limit_price,
            status = ?order.status,
            "Paper limit order placed"
        );
        book.orders.push(order.clone());
        Ok(order)
    }

    async fn list_orders(&self) -> EngineResult<Vec<Order>> {
        Ok(self.book.lock().await.orders.clone())
    }

    async fn cancel_order(&self, id: &str) -> EngineResult<()> {
        let mut book = self.book.lock().await;
        let order = book
            .orders
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| EngineError::Execution(format!("unknown order {}", id)))?;
        if !order.status.is_unfilled() {
            return Err(EngineError::Execution(format!(
                "order {} is {:?}, cannot cancel",
                id, order.status
            )));
        }
        order.status = OrderStatus::Cancelled;
        order.updated_at = Utc::now();
        info!(id, "Paper order cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> PaperBroker {
        PaperBroker::new("BTC/USD", "cash", 10_000.0)
    }

    #[tokio::test]
    async fn test_market_orders_move_capital() {
        let broker = broker();
        broker.set_price(100.0).await;

        let order = broker
            .place_market_order(OrderSide::Buy, "BTC/USD", 2.0)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_avg_price, Some(100.0));
        assert_eq!(broker.get_balance("cash").await.unwrap(), 9_800.0);
        assert_eq!(broker.get_balance("BTC/USD").await.unwrap(), 2.0);

        broker.set_price(110.0).await;
        broker
            .place_market_order(OrderSide::Sell, "BTC/USD", 2.0)
            .await
            .unwrap();
        assert_eq!(broker.get_balance("cash").await.unwrap(), 10_020.0);
        assert_eq!(broker.get_balance("BTC/USD").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_rejects_without_price_or_funds() {
        let broker = broker();
        assert!(broker.latest_price("BTC/USD").await.is_err());
        broker.set_price(20_000.0).await;
        let err = broker
            .place_market_order(OrderSide::Buy, "BTC/USD", 1.0)
            .await
            .unwrap_err();
        assert!(err.is_skip());
        assert!(broker.list_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_limit_orders_rest_and_cancel() {
        let broker = broker();
        broker.set_price(100.0).await;
        let resting = broker
            .place_limit_order(OrderSide::Buy, "BTC/USD", 1.0, 90.0)
            .await
            .unwrap();
        let crossing = broker
            .place_limit_order(OrderSide::Buy, "BTC/USD", 1.0, 95.0)
            .await
            .unwrap();
        assert_eq!(resting.status, OrderStatus::Accepted);

        broker.cancel_order(&resting.id).await.unwrap();
        broker.set_price(94.0).await;

        let orders = broker.list_orders().await.unwrap();
        assert_eq!(orders[0].status, OrderStatus::Cancelled);
        assert_eq!(orders[1].id, crossing.id);
        assert_eq!(orders[1].status, OrderStatus::Filled);
        assert_eq!(broker.capital().await.cash, 9_905.0);
        assert!(broker.cancel_order(&crossing.id).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let broker = broker();
        broker.set_price(100.0).await;
        broker.fail_next_order("venue down").await;
        assert!(broker
            .place_market_order(OrderSide::Buy, "BTC/USD", 1.0)
            .await
            .is_err());
        assert!(broker
            .place_market_order(OrderSide::Buy, "BTC/USD", 1.0)
            .await
            .is_ok());
    }
}
