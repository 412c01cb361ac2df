//! Alpaca REST client - live execution venue

use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::broker::{Broker, Order, OrderSide, OrderStatus};
use crate::config::VenueConfig;
use crate::error::{EngineError, EngineResult};
use crate::ledger::OrderType;

/// Orders fetched per listing call
const ORDER_PAGE_LIMIT: u32 = 500;

/// Client for the brokerage and market data APIs
pub struct AlpacaClient {
    client: Client,
    broker_url: String,
    market_data_url: String,
    cash_asset: String,
}

impl AlpacaClient {
    /// Create new venue client
    pub fn new(venue: &VenueConfig, cash_asset: &str) -> anyhow::Result<Self> {
        if venue.api_key_id.is_empty() || venue.api_secret_key.is_empty() {
            return Err(anyhow::anyhow!(
                "live trading requires TRADER_VENUE__API_KEY_ID and TRADER_VENUE__API_SECRET_KEY"
            ));
        }

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("apca-api-key-id", venue.api_key_id.parse()?);
        headers.insert("apca-api-secret-key", venue.api_secret_key.parse()?);

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            broker_url: venue.broker_url.trim_end_matches('/').to_string(),
            market_data_url: venue.market_data_url.trim_end_matches('/').to_string(),
            cash_asset: cash_asset.to_string(),
        })
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> EngineResult<T> {
        let response = request.send().await.map_err(|e| venue_error(what, e))?;
        if response.status().is_success() {
            response.json().await.map_err(|e| venue_error(what, e))
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(EngineError::Execution(format!(
                "{} failed: {} - {}",
                what, status, text
            )))
        }
    }

    async fn account_cash(&self) -> EngineResult<f64> {
        let url = format!("{}/v2/account", self.broker_url);
        let account: AccountResponse = self.send(self.client.get(&url), "Account query").await?;
        parse_amount(&account.cash)
    }

    async fn position_qty(&self, symbol: &str) -> EngineResult<f64> {
        let url = format!("{}/v2/positions/{}", self.broker_url, position_symbol(symbol));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| venue_error("Position query", e))?;

        match response.status() {
            StatusCode::OK => {
                let position: PositionResponse = response
                    .json()
                    .await
                    .map_err(|e| venue_error("Position query", e))?;
                parse_amount(&position.qty)
            }
            StatusCode::NOT_FOUND => {
                debug!("No open position in {}", symbol);
                Ok(0.0)
            }
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(EngineError::Execution(format!(
                    "Position query failed: {} - {}",
                    status, text
                )))
            }
        }
    }

    /// Newest orders first: the page limit must cut off old history, never
    /// recent fills. Callers re-sort by `updated_at`.
    fn order_listing(&self) -> RequestBuilder {
        let limit = ORDER_PAGE_LIMIT.to_string();
        self.client
            .get(format!("{}/v2/orders", self.broker_url))
            .query(&[("status", "all"), ("limit", limit.as_str()), ("direction", "desc")])
    }

    async fn submit(&self, request: &OrderRequest) -> EngineResult<Order> {
        let url = format!("{}/v2/orders", self.broker_url);
        let raw: AlpacaOrder = self
            .send(self.client.post(&url).json(request), "Order placement")
            .await?;
        info!(
            "Order {} accepted: {} {} {} ({})",
            raw.client_order_id, raw.side, raw.qty.as_deref().unwrap_or("?"), raw.symbol, raw.status
        );
        raw.into_order()
    }
}

#[async_trait::async_trait]
impl Broker for AlpacaClient {
    fn name(&self) -> &str {
        "alpaca"
    }

    async fn latest_price(&self, symbol: &str) -> EngineResult<f64> {
        let url = format!("{}/v1beta3/crypto/us/latest/bars", self.market_data_url);
        let bars: LatestBarsResponse = self
            .send(self.client.get(&url).query(&[("symbols", symbol)]), "Latest bar")
            .await?;
        let bar = bars
            .bars
            .get(symbol)
            .ok_or_else(|| EngineError::Execution(format!("no latest bar for {}", symbol)))?;
        debug!("Latest {} close: {}", symbol, bar.c);
        Ok(bar.c)
    }

    async fn get_balance(&self, asset: &str) -> EngineResult<f64> {
        if asset == self.cash_asset {
            self.account_cash().await
        } else {
            self.position_qty(asset).await
        }
    }

    async fn place_market_order(
        &self,
        side: OrderSide,
        symbol: &str,
        qty: f64,
    ) -> EngineResult<Order> {
        self.submit(&OrderRequest::new(side, symbol, qty, OrderType::Market, None)?)
            .await
    }

    async fn place_limit_order(
        &self,
        side: OrderSide,
        symbol: &str,
        qty: f64,
        limit_price: f64,
    ) -> EngineResult<Order> {
        self.submit(&OrderRequest::new(
            side,
            symbol,
            qty,
            OrderType::Limit,
            Some(limit_price),
        )?)
        .await
    }

    async fn list_orders(&self) -> EngineResult<Vec<Order>> {
        let raw: Vec<AlpacaOrder> = self
            .send(self.order_listing(), "Order listing")
            .await?;
        debug!("Fetched {} orders", raw.len());
        raw.into_iter().map(AlpacaOrder::into_order).collect()
    }

    async fn cancel_order(&self, id: &str) -> EngineResult<()> {
        let url = format!("{}/v2/orders/{}", self.broker_url, id);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| venue_error("Order cancel", e))?;

        if response.status().is_success() {
            info!("Cancelled order {}", id);
            Ok(())
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(EngineError::Execution(format!(
                "Order cancel failed: {} - {}",
                status, text
            )))
        }
    }
}

fn venue_error(what: &str, e: reqwest::Error) -> EngineError {
    EngineError::Execution(format!("{}: {}", what, e))
}

/// Positions are keyed without the pair separator ("BTC/USD" -> "BTCUSD")
fn position_symbol(symbol: &str) -> String {
    symbol.replace('/', "")
}

/// Venue amounts arrive as decimal strings
pub fn parse_amount(raw: &str) -> EngineResult<f64> {
    Decimal::from_str(raw.trim())
        .ok()
        .and_then(|d| d.to_f64())
        .ok_or_else(|| EngineError::Execution(format!("unparseable amount '{}'", raw)))
}

fn format_amount(value: f64) -> EngineResult<String> {
    Decimal::from_f64_retain(value)
        .map(|d| d.round_dp(9).normalize().to_string())
        .ok_or_else(|| EngineError::Execution(format!("unrepresentable amount {}", value)))
}

// Request/Response types

#[derive(Debug, Clone, Serialize)]
struct OrderRequest {
    symbol: String,
    qty: String,
    side: OrderSide,
    #[serde(rename = "type")]
    order_type: OrderType,
    time_in_force: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<String>,
    client_order_id: String,
}

impl OrderRequest {
    fn new(
        side: OrderSide,
        symbol: &str,
        qty: f64,
        order_type: OrderType,
        limit_price: Option<f64>,
    ) -> EngineResult<Self> {
        Ok(Self {
            symbol: symbol.to_string(),
            qty: format_amount(qty)?,
            side,
            order_type,
            time_in_force: "gtc",
            limit_price: limit_price.map(format_amount).transpose()?,
            client_order_id: Uuid::new_v4().to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    cash: String,
}

#[derive(Debug, Deserialize)]
struct PositionResponse {
    qty: String,
}

#[derive(Debug, Deserialize)]
struct LatestBarsResponse {
    bars: HashMap<String, Bar>,
}

#[derive(Debug, Deserialize)]
struct Bar {
    c: f64,
}

#[derive(Debug, Deserialize)]
struct AlpacaOrder {
    id: String,
    client_order_id: String,
    symbol: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    status: String,
    qty: Option<String>,
    filled_qty: Option<String>,
    filled_avg_price: Option<String>,
    limit_price: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AlpacaOrder {
    fn into_order(self) -> EngineResult<Order> {
        let side = match self.side.as_str() {
            "buy" => OrderSide::Buy,
            "sell" => OrderSide::Sell,
            other => {
                return Err(EngineError::Execution(format!(
                    "order {} has unknown side '{}'",
                    self.id, other
                )))
            }
        };
        let order_type = OrderType::from_str(&self.order_type).unwrap_or(OrderType::Market);
        let status: OrderStatus = serde_json::from_value(serde_json::Value::String(self.status))?;
        let opt = |v: Option<String>| v.as_deref().map(parse_amount).transpose();

        Ok(Order {
            qty: opt(self.qty)?.unwrap_or(0.0),
            filled_qty: opt(self.filled_qty)?.unwrap_or(0.0),
            filled_avg_price: opt(self.filled_avg_price)?,
            limit_price: opt(self.limit_price)?,
            id: self.id,
            client_order_id: self.client_order_id,
            symbol: self.symbol,
            side,
            order_type,
            status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("1234.50").unwrap(), 1234.5);
        assert_eq!(parse_amount(" 0.001 ").unwrap(), 0.001);
        assert!(parse_amount("n/a").is_err());
    }

    #[test]
    fn test_order_conversion() {
        let raw: AlpacaOrder = serde_json::from_value(serde_json::json!({
            "id": "61e69015-8549-4bfd-b9c3-01e75843f47d",
            "client_order_id": "eb9e2aaa-f71a-4f51-b5b4-52a6c565dad4",
            "symbol": "BTC/USD",
            "side": "buy",
            "type": "market",
            "status": "filled",
            "qty": "0.5",
            "filled_qty": "0.5",
            "filled_avg_price": "64000.25",
            "limit_price": null,
            "created_at": "2024-03-01T10:00:00Z",
            "updated_at": "2024-03-01T10:00:01Z"
        }))
        .unwrap();
        let order = raw.into_order().unwrap();
        assert_eq!(order.side, OrderSide::Buy);
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.qty, 0.5);
        assert_eq!(order.filled_avg_price, Some(64000.25));
        assert_eq!(order.limit_price, None);
    }

    #[test]
    fn test_order_request_body() {
        let req = OrderRequest::new(OrderSide::Sell, "BTC/USD", 0.25, OrderType::Limit, Some(65000.0))
            .unwrap();
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["side"], "sell");
        assert_eq!(body["type"], "limit");
        assert_eq!(body["qty"], "0.25");
        assert_eq!(body["limit_price"], "65000");
        assert_eq!(position_symbol("BTC/USD"), "BTCUSD");
    }

    #[test]
    fn test_order_listing_fetches_newest_first() {
        let venue = VenueConfig {
            api_key_id: "key".into(),
            api_secret_key: "secret".into(),
            broker_url: "https://paper-api.example.com/".into(),
            ..VenueConfig::default()
        };
        let client = AlpacaClient::new(&venue, "USD").unwrap();
        let request = client.order_listing().build().unwrap();
        assert_eq!(request.url().path(), "/v2/orders");

        let query: HashMap<String, String> = request.url().query_pairs().into_owned().collect();
        assert_eq!(query["direction"], "desc");
        assert_eq!(query["status"], "all");
        assert_eq!(query["limit"], ORDER_PAGE_LIMIT.to_string());
    }

    #[test]
    fn test_requires_credentials() {
        assert!(AlpacaClient::new(&VenueConfig::default(), "cash").is_err());
    }
}
