//! Scriptable venue for driving the coordinator without a network

use adaptive_trader::{
    Broker, CapitalState, EngineError, EngineResult, Order, OrderSide, OrderStatus, OrderType,
};
use chrono::Utc;
use std::sync::Mutex;

struct VenueBook {
    capital: CapitalState,
    price: f64,
    orders: Vec<Order>,
    /// Leave new orders accepted instead of filling them
    rest_orders: bool,
    fail_listing: bool,
    cancel_requests: Vec<String>,
}

/// Venue whose fills, listings and failures are driven by the test
pub struct MockVenue {
    symbol: String,
    book: Mutex<VenueBook>,
}

impl MockVenue {
    pub fn new(symbol: &str, start_capital: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            book: Mutex::new(VenueBook {
                capital: CapitalState::new(start_capital),
                price: 100.0,
                orders: Vec::new(),
                rest_orders: false,
                fail_listing: false,
                cancel_requests: Vec::new(),
            }),
        }
    }

    pub fn set_price(&self, price: f64) {
        self.book.lock().unwrap().price = price;
    }

    pub fn rest_orders(&self, rest: bool) {
        self.book.lock().unwrap().rest_orders = rest;
    }

    pub fn fail_listing(&self, fail: bool) {
        self.book.lock().unwrap().fail_listing = fail;
    }

    pub fn cancel_requests(&self) -> Vec<String> {
        self.book.lock().unwrap().cancel_requests.clone()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.book.lock().unwrap().orders.clone()
    }

    /// Fill a resting order at `price`
    pub fn fill(&self, id: &str, price: f64) {
        let mut book = self.book.lock().unwrap();
        let VenueBook {
            capital, orders, ..
        } = &mut *book;
        let order = orders.iter_mut().find(|o| o.id == id).expect("unknown order");
        match order.side {
            OrderSide::Buy => capital.apply_buy(order.qty, price).unwrap(),
            OrderSide::Sell => capital.apply_sell(order.qty, price).unwrap(),
        }
        order.status = OrderStatus::Filled;
        order.filled_qty = order.qty;
        order.filled_avg_price = Some(price);
        order.updated_at = Utc::now();
    }

    fn place(
        &self,
        side: OrderSide,
        qty: f64,
        order_type: OrderType,
        limit_price: Option<f64>,
    ) -> EngineResult<Order> {
        let mut book = self.book.lock().unwrap();
        let now = Utc::now();
        let mut order = Order {
            id: format!("mock-{}", book.orders.len() + 1),
            client_order_id: uuid::Uuid::new_v4().to_string(),
            symbol: self.symbol.clone(),
            side,
            order_type,
            status: OrderStatus::New,
            qty,
            filled_qty: 0.0,
            filled_avg_price: None,
            limit_price,
            created_at: now,
            updated_at: now,
        };
        if !book.rest_orders {
            let price = book.price;
            match side {
                OrderSide::Buy => book.capital.apply_buy(qty, price)?,
                OrderSide::Sell => book.capital.apply_sell(qty, price)?,
            }
            order.status = OrderStatus::Filled;
            order.filled_qty = qty;
            order.filled_avg_price = Some(price);
        }
        book.orders.push(order.clone());
        Ok(order)
    }
}

#[async_trait::async_trait]
impl Broker for MockVenue {
    fn name(&self) -> &str {
        "mock"
    }

    async fn latest_price(&self, _symbol: &str) -> EngineResult<f64> {
        Ok(self.book.lock().unwrap().price)
    }

    async fn get_balance(&self, asset: &str) -> EngineResult<f64> {
        let book = self.book.lock().unwrap();
        Ok(if asset == self.symbol {
            book.capital.position
        } else {
            book.capital.cash
        })
    }

    async fn place_market_order(
        &self,
        side: OrderSide,
        _symbol: &str,
        qty: f64,
    ) -> EngineResult<Order> {
        self.place(side, qty, OrderType::Market, None)
    }

    async fn place_limit_order(
        &self,
        side: OrderSide,
        _symbol: &str,
        qty: f64,
        limit_price: f64,
    ) -> EngineResult<Order> {
        self.place(side, qty, OrderType::Limit, Some(limit_price))
    }

    async fn list_orders(&self) -> EngineResult<Vec<Order>> {
        let book = self.book.lock().unwrap();
        if book.fail_listing {
            return Err(EngineError::Execution("order listing unavailable".into()));
        }
        Ok(book.orders.clone())
    }

    async fn cancel_order(&self, id: &str) -> EngineResult<()> {
        let mut book = self.book.lock().unwrap();
        book.cancel_requests.push(id.to_string());
        let order = book
            .orders
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| EngineError::Execution(format!("unknown order {}", id)))?;
        order.status = OrderStatus::Cancelled;
        order.updated_at = Utc::now();
        Ok(())
    }
}
