//! Trade ledger - append-only, chronological record of trades
//!
//! Rows are never removed. A row's PnL moves from unset to a concrete
//! value exactly once; status, fill price and the learned flag may be
//! updated as the venue confirms the order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::schema::Schema;

/// Trade side as recorded in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
    None,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "buy",
            Action::Sell => "sell",
            Action::None => "none",
        }
    }

    /// +1 for buy, -1 for sell, 0 for no action
    pub fn direction(&self) -> f64 {
        match self {
            Action::Buy => 1.0,
            Action::Sell => -1.0,
            Action::None => 0.0,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(Action::Buy),
            "sell" => Ok(Action::Sell),
            "none" | "" => Ok(Action::None),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    #[default]
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        }
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "market" | "" => Ok(OrderType::Market),
            "limit" => Ok(OrderType::Limit),
            other => Err(format!("unknown order type '{}'", other)),
        }
    }
}

/// Lifecycle of a ledger row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Executed by the replay driver
    Simulated,
    /// Placed at the venue, not yet filled
    Accepted,
    Filled,
    Cancelled,
    /// Open buy priced at the final close of a replay
    MarkedToMarket,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Simulated => "simulated",
            RecordStatus::Accepted => "accepted",
            RecordStatus::Filled => "filled",
            RecordStatus::Cancelled => "cancelled",
            RecordStatus::MarkedToMarket => "marked_to_market",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simulated" => Ok(RecordStatus::Simulated),
            "accepted" | "new" => Ok(RecordStatus::Accepted),
            "filled" => Ok(RecordStatus::Filled),
            "cancelled" | "canceled" => Ok(RecordStatus::Cancelled),
            "marked_to_market" => Ok(RecordStatus::MarkedToMarket),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// One row of the ledger
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    /// Position in the ledger, assigned on append
    pub seq: usize,
    pub timestamp: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub client_order_id: Option<String>,
    pub action: Action,
    pub order_type: OrderType,
    pub status: RecordStatus,
    pub quantity: f64,
    pub price: f64,
    /// Cash after the trade
    pub balance: f64,
    pub(crate) pnl: Option<f64>,
    /// Already consumed by the weight learner
    pub learned: bool,
    /// Signal values at trade time, schema order
    pub signals: Vec<f64>,
    /// Macro variables at trade time, schema order
    pub macros: Vec<f64>,
}

impl TradeRecord {
    pub fn new(
        timestamp: DateTime<Utc>,
        action: Action,
        quantity: f64,
        price: f64,
        balance: f64,
        signals: Vec<f64>,
        macros: Vec<f64>,
    ) -> Self {
        Self {
            seq: 0,
            timestamp,
            updated_at: None,
            client_order_id: None,
            action,
            order_type: OrderType::Market,
            status: RecordStatus::Simulated,
            quantity,
            price,
            balance,
            pnl: None,
            learned: false,
            signals,
            macros,
        }
    }

    pub fn with_order(mut self, client_order_id: impl Into<String>, order_type: OrderType) -> Self {
        self.client_order_id = Some(client_order_id.into());
        self.order_type = order_type;
        self
    }

    pub fn with_status(mut self, status: RecordStatus) -> Self {
        self.status = status;
        self
    }

    pub fn pnl(&self) -> Option<f64> {
        self.pnl
    }

    pub fn is_closed(&self) -> bool {
        self.pnl.is_some()
    }

    /// Quantity times price
    pub fn notional(&self) -> f64 {
        self.quantity * self.price
    }
}

/// Result of closing a batch of buys against one sell
#[derive(Debug, Clone, PartialEq)]
pub struct BatchClose {
    pub buys: Vec<usize>,
    pub sell: usize,
    pub pnl: f64,
}

/// Append-only chronological trade ledger
#[derive(Debug, Clone)]
pub struct Ledger {
    signal_len: usize,
    macro_len: usize,
    records: Vec<TradeRecord>,
}

impl Ledger {
    pub fn new(schema: &Schema) -> Self {
        Self {
            signal_len: schema.signals().len(),
            macro_len: schema.macros().len(),
            records: Vec::new(),
        }
    }

    /// Rebuild from persisted rows; `seq` must match row position
    pub fn from_records(schema: &Schema, records: Vec<TradeRecord>) -> EngineResult<Self> {
        let mut ledger = Self::new(schema);
        for (i, record) in records.into_iter().enumerate() {
            if record.seq != i {
                return Err(EngineError::ledger(
                    i,
                    format!("persisted seq {} out of order", record.seq),
                ));
            }
            ledger.validate(&record, i)?;
            ledger.records.push(record);
        }
        Ok(ledger)
    }

    fn validate(&self, record: &TradeRecord, index: usize) -> EngineResult<()> {
        if record.signals.len() != self.signal_len || record.macros.len() != self.macro_len {
            return Err(EngineError::ledger(
                index,
                format!(
                    "expected {} signals and {} macros, got {} and {}",
                    self.signal_len,
                    self.macro_len,
                    record.signals.len(),
                    record.macros.len()
                ),
            ));
        }
        if !(record.quantity >= 0.0) || !record.quantity.is_finite() {
            return Err(EngineError::ledger(
                index,
                format!("invalid quantity {}", record.quantity),
            ));
        }
        if !(record.price > 0.0) || !record.price.is_finite() {
            return Err(EngineError::ledger(index, format!("invalid price {}", record.price)));
        }
        Ok(())
    }

    /// Append a row; returns its index
    pub fn append(&mut self, mut record: TradeRecord) -> EngineResult<usize> {
        let index = self.records.len();
        self.validate(&record, index)?;
        record.seq = index;
        debug!(
            index,
            action = %record.action,
            quantity = record.quantity,
            price = record.price,
            "Ledger append"
        );
        self.records.push(record);
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TradeRecord> {
        self.records.get(index)
    }

    pub fn records(&self) -> &[TradeRecord] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &TradeRecord> {
        self.records.iter()
    }

    /// Rows with a known PnL
    pub fn closed(&self) -> impl Iterator<Item = &TradeRecord> {
        self.records.iter().filter(|r| r.is_closed())
    }

    pub fn closed_count(&self) -> usize {
        self.closed().count()
    }

    pub fn has_closed(&self) -> bool {
        self.records.iter().any(|r| r.is_closed())
    }

    /// Buy rows still waiting for a matching sell, oldest first
    pub fn open_buys(&self) -> Vec<usize> {
        self.records
            .iter()
            .filter(|r| r.action == Action::Buy && !r.is_closed() && r.status != RecordStatus::Cancelled)
            .map(|r| r.seq)
            .collect()
    }

    /// Closed rows the weight learner has not consumed yet
    pub fn unlearned_closed(&self) -> Vec<usize> {
        self.records
            .iter()
            .filter(|r| r.is_closed() && !r.learned)
            .map(|r| r.seq)
            .collect()
    }

    pub fn find_by_order_id(&self, client_order_id: &str) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.client_order_id.as_deref() == Some(client_order_id))
    }

    /// Sum of PnL over sell rows
    pub fn realized_pnl(&self) -> f64 {
        self.records
            .iter()
            .filter(|r| r.action == Action::Sell)
            .filter_map(|r| r.pnl)
            .sum()
    }

    fn row_mut(&mut self, index: usize) -> EngineResult<&mut TradeRecord> {
        self.records
            .get_mut(index)
            .ok_or_else(|| EngineError::ledger(index, "no such row"))
    }

    /// Close `buys` against the sell at `sell`: every row receives
    /// `sell proceeds - total buy cost`. Validated before any write.
    pub fn close_batch(&mut self, buys: &[usize], sell: usize) -> EngineResult<BatchClose> {
        let sell_row = self
            .records
            .get(sell)
            .ok_or_else(|| EngineError::ledger(sell, "no such row"))?;
        if sell_row.action != Action::Sell {
            return Err(EngineError::ledger(sell, "batch must close against a sell"));
        }
        if sell_row.is_closed() {
            return Err(EngineError::ledger(sell, "sell already closed"));
        }
        let proceeds = sell_row.notional();

        let mut cost = 0.0;
        for (pos, &i) in buys.iter().enumerate() {
            if buys[..pos].contains(&i) {
                return Err(EngineError::ledger(i, "buy listed twice in batch"));
            }
            let row = self
                .records
                .get(i)
                .ok_or_else(|| EngineError::ledger(i, "no such row"))?;
            if row.action != Action::Buy {
                return Err(EngineError::ledger(i, "batch member is not a buy"));
            }
            if row.is_closed() {
                return Err(EngineError::ledger(i, "buy already closed"));
            }
            cost += row.notional();
        }

        if buys.is_empty() {
            warn!(sell, "Closing sell with no matching buys");
        }

        let pnl = proceeds - cost;
        for &i in buys {
            self.row_mut(i)?.pnl = Some(pnl);
        }
        self.row_mut(sell)?.pnl = Some(pnl);

        info!(
            sell,
            buys = buys.len(),
            proceeds,
            cost,
            pnl,
            "Closed batch"
        );

        Ok(BatchClose {
            buys: buys.to_vec(),
            sell,
            pnl,
        })
    }

    /// Record a venue fill
    pub fn record_fill(
        &mut self,
        index: usize,
        price: f64,
        updated_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        if !(price > 0.0) || !price.is_finite() {
            return Err(EngineError::ledger(index, format!("invalid fill price {}", price)));
        }
        let row = self.row_mut(index)?;
        row.price = price;
        row.status = RecordStatus::Filled;
        row.updated_at = Some(updated_at);
        Ok(())
    }

    pub fn mark_cancelled(&mut self, index: usize, updated_at: DateTime<Utc>) -> EngineResult<()> {
        let row = self.row_mut(index)?;
        if row.is_closed() {
            return Err(EngineError::ledger(index, "cannot cancel a closed row"));
        }
        row.status = RecordStatus::Cancelled;
        row.updated_at = Some(updated_at);
        Ok(())
    }

    pub fn mark_learned(&mut self, index: usize) -> EngineResult<()> {
        let row = self.row_mut(index)?;
        if !row.is_closed() {
            return Err(EngineError::ledger(index, "cannot learn from an open row"));
        }
        row.learned = true;
        Ok(())
    }

    /// Price every still-open buy at `final_price`; returns rows touched
    pub fn mark_to_market(&mut self, final_price: f64) -> usize {
        let open = self.open_buys();
        for &i in &open {
            let row = &mut self.records[i];
            row.pnl = Some((final_price - row.price) * row.quantity);
            row.status = RecordStatus::MarkedToMarket;
        }
        if !open.is_empty() {
            info!(
                "Marked {} open buys to market at {}",
                open.len(),
                final_price
            );
        }
        open.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec!["a".into(), "b".into()], vec!["VaR".into()]).unwrap()
    }

    fn row(action: Action, quantity: f64, price: f64) -> TradeRecord {
        TradeRecord::new(Utc::now(), action, quantity, price, 0.0, vec![0.1, 0.2], vec![0.0])
    }

    #[test]
    fn test_append_assigns_sequence() {
        let mut ledger = Ledger::new(&schema());
        assert_eq!(ledger.append(row(Action::Buy, 1.0, 100.0)).unwrap(), 0);
        assert_eq!(ledger.append(row(Action::Buy, 1.0, 101.0)).unwrap(), 1);
        assert_eq!(ledger.get(1).unwrap().seq, 1);
        assert_eq!(ledger.open_buys(), vec![0, 1]);
    }

    #[test]
    fn test_rejects_schema_mismatch_and_bad_price() {
        let mut ledger = Ledger::new(&schema());
        let mut bad = row(Action::Buy, 1.0, 100.0);
        bad.signals.pop();
        assert!(ledger.append(bad).is_err());
        assert!(ledger.append(row(Action::Buy, 1.0, 0.0)).is_err());
        assert!(ledger.append(row(Action::Buy, -1.0, 10.0)).is_err());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_batch_close_shares_pnl() {
        let mut ledger = Ledger::new(&schema());
        ledger.append(row(Action::Buy, 1.0, 100.0)).unwrap();
        ledger.append(row(Action::Buy, 2.0, 110.0)).unwrap();
        let sell = ledger.append(row(Action::Sell, 3.0, 120.0)).unwrap();

        let close = ledger.close_batch(&[0, 1], sell).unwrap();
        // 360 - (100 + 220)
        assert!((close.pnl - 40.0).abs() < 1e-9);
        for i in 0..3 {
            assert_eq!(ledger.get(i).unwrap().pnl(), Some(close.pnl));
        }
        assert_eq!(ledger.closed_count(), 3);
        assert!((ledger.realized_pnl() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_pnl_is_never_reassigned() {
        let mut ledger = Ledger::new(&schema());
        ledger.append(row(Action::Buy, 1.0, 100.0)).unwrap();
        let sell = ledger.append(row(Action::Sell, 1.0, 90.0)).unwrap();
        ledger.close_batch(&[0], sell).unwrap();

        let second = ledger.append(row(Action::Sell, 1.0, 95.0)).unwrap();
        let err = ledger.close_batch(&[0], second).unwrap_err();
        assert!(matches!(err, EngineError::Ledger { index: 0, .. }));
        // Failed close leaves the new sell untouched
        assert_eq!(ledger.get(second).unwrap().pnl(), None);
        assert_eq!(ledger.get(0).unwrap().pnl(), Some(-10.0));
    }

    #[test]
    fn test_mark_to_market_only_open_buys() {
        let mut ledger = Ledger::new(&schema());
        ledger.append(row(Action::Buy, 1.0, 100.0)).unwrap();
        let sell = ledger.append(row(Action::Sell, 1.0, 105.0)).unwrap();
        ledger.close_batch(&[0], sell).unwrap();
        ledger.append(row(Action::Buy, 2.0, 100.0)).unwrap();

        assert_eq!(ledger.mark_to_market(110.0), 1);
        assert_eq!(ledger.get(0).unwrap().pnl(), Some(5.0));
        assert_eq!(ledger.get(2).unwrap().pnl(), Some(20.0));
        assert_eq!(ledger.get(2).unwrap().status, RecordStatus::MarkedToMarket);
    }

    #[test]
    fn test_learned_requires_closed() {
        let mut ledger = Ledger::new(&schema());
        ledger.append(row(Action::Buy, 1.0, 100.0)).unwrap();
        assert!(ledger.mark_learned(0).is_err());
        let sell = ledger.append(row(Action::Sell, 1.0, 101.0)).unwrap();
        ledger.close_batch(&[0], sell).unwrap();
        assert_eq!(ledger.unlearned_closed(), vec![0, 1]);
        ledger.mark_learned(0).unwrap();
        assert_eq!(ledger.unlearned_closed(), vec![1]);
    }
}
