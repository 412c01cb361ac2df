//! Learning coordinator - the live engine's guarded aggregate
//!
//! Ledger, weight history and classifier are one unit behind a single
//! async mutex. Placing an order and running a reconciliation/learning
//! cycle both hold it from first read to last write, so a decision can
//! never interleave with a cycle and no cycle overlaps itself.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::aggregator::{self, Availability, TradingSignal};
use crate::broker::{Broker, Order, OrderSide, OrderStatus};
use crate::cbr::{self, CbrClassifier, RetrainOutcome};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::learner::{WeightHistory, WeightLearner};
use crate::ledger::{Action, Ledger, OrderType, RecordStatus, TradeRecord};
use crate::matching::{MatchPolicy, StackMatching};
use crate::portfolio::{CapitalState, RiskBreach, RiskLimits};
use crate::schema::Schema;
use crate::signals::FeedSet;
use crate::store::DataStore;

/// Everything a learning cycle reads and writes
#[derive(Debug, Clone)]
pub struct LearningState {
    /// Live ledger, resumed from the persisted account book
    pub ledger: Ledger,
    pub weights: WeightHistory,
    pub classifier: CbrClassifier,
    /// Long-term history (replay tradebook), read-only
    pub history: Ledger,
    /// Set once a risk limit is breached
    pub stopped: bool,
}

/// What a decision tick did
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionOutcome {
    Held,
    Placed {
        index: usize,
        action: Action,
        order_type: OrderType,
        quantity: f64,
        price: f64,
        client_order_id: String,
    },
    Stopped,
}

/// Order reconciliation counts for one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub matched: usize,
    pub cancelled: usize,
    pub filled: usize,
    pub closed_batches: usize,
}

/// What a reconciliation/learning cycle did
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// A risk limit was already breached; nothing ran
    Stopped,
    NoCompletedTrades {
        reconciled: ReconcileReport,
    },
    Learned {
        reconciled: ReconcileReport,
        applied: usize,
        weights: Vec<f64>,
        retrain: RetrainOutcome,
    },
    /// Breached on this cycle; the caller must shut down
    RiskBreach {
        breach: RiskBreach,
    },
}

/// Read-only view for reporting
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub weights: Vec<f64>,
    pub ledger_rows: usize,
    pub closed_trades: usize,
    pub open_buys: usize,
    pub realized_pnl: f64,
    pub classifier_trained: bool,
    pub stopped: bool,
}

/// Owns the learning state together with the venue capability
pub struct Coordinator {
    config: EngineConfig,
    schema: Schema,
    broker: Arc<dyn Broker>,
    store: DataStore,
    feeds: FeedSet,
    learner: WeightLearner,
    limits: RiskLimits,
    state: Mutex<LearningState>,
}

impl Coordinator {
    /// Resume from whatever the store holds
    pub fn open(
        config: EngineConfig,
        schema: Schema,
        broker: Arc<dyn Broker>,
        store: DataStore,
        feeds: FeedSet,
    ) -> EngineResult<Self> {
        store.init()?;
        let weights = store.load_weights()?;
        let ledger = store.load_account_book()?;
        let history = store.load_tradebook()?;

        let mut classifier =
            CbrClassifier::new(&schema, config.action_encoding, config.min_closed_trades);
        if let Some(model) = store.load_model()? {
            classifier.restore(model)?;
        }

        info!(
            "Coordinator ready: {} ledger rows, {} history rows, {} weight rows, classifier {}",
            ledger.len(),
            history.len(),
            weights.len(),
            if classifier.is_trained() { "restored" } else { "untrained" }
        );

        Ok(Self {
            learner: WeightLearner::new(config.learning_rate),
            limits: RiskLimits::new(config.take_profit, config.stop_loss),
            state: Mutex::new(LearningState {
                ledger,
                weights,
                classifier,
                history,
                stopped: false,
            }),
            config,
            schema,
            broker,
            store,
            feeds,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        let state = self.state.lock().await;
        StateSnapshot {
            weights: state.weights.latest().values().to_vec(),
            ledger_rows: state.ledger.len(),
            closed_trades: state.ledger.closed_count(),
            open_buys: state.ledger.open_buys().len(),
            realized_pnl: state.ledger.realized_pnl(),
            classifier_trained: state.classifier.is_trained(),
            stopped: state.stopped,
        }
    }

    pub async fn ledger(&self) -> Ledger {
        self.state.lock().await.ledger.clone()
    }

    pub async fn weights(&self) -> WeightHistory {
        self.state.lock().await.weights.clone()
    }

    pub async fn is_stopped(&self) -> bool {
        self.state.lock().await.stopped
    }

    /// Decision worker body: aggregate, size, check funds, place, record
    pub async fn decide_and_trade(&self) -> EngineResult<DecisionOutcome> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Ok(DecisionOutcome::Stopped);
        }

        let reading = self.feeds.reading(&self.schema)?;
        let macros = self.feeds.macro_values(&self.schema)?;
        let symbol = self.config.symbol.as_str();
        let price = self.broker.latest_price(symbol).await?;
        let cash = self.broker.get_balance(&self.config.cash_asset).await?;
        let position = self.broker.get_balance(symbol).await?;
        let base_quantity = self.config.base_quantity;

        let available = Availability {
            cash,
            position,
            price,
            base_quantity,
        };
        let signal = aggregator::decide(state.weights.latest(), &reading, &available);
        debug!(?signal, price, cash, position, "Aggregated signal");

        let draft = |action: Action, quantity: f64| {
            TradeRecord::new(
                Utc::now(),
                action,
                quantity,
                price,
                cash - action.direction() * quantity * price,
                reading.values().to_vec(),
                macros.clone(),
            )
        };

        match signal {
            TradingSignal::Buy { score } => {
                let record = draft(Action::Buy, base_quantity);
                let prediction = state.classifier.predict(&state.classifier.features(&record));
                let quantity = cbr::adjust_quantity(
                    base_quantity,
                    prediction,
                    self.config.sizing_rate,
                    cash / price,
                );
                if quantity <= 0.0 {
                    info!(score, ?prediction, "Sized buy rounds to zero, holding");
                    return Ok(DecisionOutcome::Held);
                }
                info!(score, ?prediction, "Buying {} {} @ ~{}", quantity, symbol, price);
                let order = self
                    .broker
                    .place_market_order(OrderSide::Buy, symbol, quantity)
                    .await?;
                self.record_order(&mut state, draft(Action::Buy, quantity), order, price)
                    .await
            }
            TradingSignal::Sell { score } => {
                info!(score, "Selling {} {} @ ~{}", position, symbol, price);
                let order = self
                    .broker
                    .place_market_order(OrderSide::Sell, symbol, position)
                    .await?;
                self.record_order(&mut state, draft(Action::Sell, position), order, price)
                    .await
            }
            TradingSignal::Hold => {
                let capital = CapitalState::from_balances(cash, position, self.config.start_capital);
                match self.limits.check(capital.equity(price), capital.start_capital) {
                    Some(breach) if position > 0.0 => {
                        warn!(
                            kind = ?breach.kind,
                            "Risk limit crossed, exiting {} {} with a limit sell @ {}",
                            position,
                            symbol,
                            price
                        );
                        let order = self
                            .broker
                            .place_limit_order(OrderSide::Sell, symbol, position, price)
                            .await?;
                        self.record_order(&mut state, draft(Action::Sell, position), order, price)
                            .await
                    }
                    _ => {
                        debug!("No trade action @ {}", price);
                        Ok(DecisionOutcome::Held)
                    }
                }
            }
        }
    }

    /// Append the placed order and persist the ledger
    async fn record_order(
        &self,
        state: &mut LearningState,
        mut record: TradeRecord,
        order: Order,
        quoted_price: f64,
    ) -> EngineResult<DecisionOutcome> {
        record.price = order.filled_avg_price.unwrap_or(quoted_price);
        record.quantity = order.qty;
        record.status = match order.status {
            OrderStatus::Filled => RecordStatus::Filled,
            OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired => {
                RecordStatus::Cancelled
            }
            _ => RecordStatus::Accepted,
        };
        record.updated_at = Some(order.updated_at);
        let mut record = record.with_order(order.client_order_id.clone(), order.order_type);

        // The order is live at the venue; a failed balance read must not lose the row
        match self.broker.get_balance(&self.config.cash_asset).await {
            Ok(balance) => record.balance = balance,
            Err(e) => warn!(error = %e, "Balance refresh failed, keeping estimate"),
        }

        let (action, quantity, price) = (record.action, record.quantity, record.price);
        let index = state.ledger.append(record)?;
        info!(
            index,
            client_order_id = %order.client_order_id,
            status = ?order.status,
            "Recorded {} {} @ {}",
            action,
            quantity,
            price
        );

        if let Err(e) = self.store.save_account_book(&state.ledger) {
            error!(index, error = %e, "Failed to persist account book after order");
            return Err(e);
        }

        Ok(DecisionOutcome::Placed {
            index,
            action,
            order_type: order.order_type,
            quantity,
            price,
            client_order_id: order.client_order_id,
        })
    }

    /// Reconciliation worker body: sync orders, learn, persist, check risk
    pub async fn reconcile_cycle(&self) -> EngineResult<CycleOutcome> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Ok(CycleOutcome::Stopped);
        }

        // Work on copies so a failure leaves the committed state untouched
        let mut ledger = state.ledger.clone();
        let reconciled = self.reconcile_orders(&mut ledger).await?;

        let outcome = if ledger.has_closed() {
            let mut weights = state.weights.clone();
            let mut classifier = state.classifier.clone();

            let pending = ledger.unlearned_closed();
            let (updated, applied) = self
                .learner
                .update(weights.latest(), pending.iter().filter_map(|&i| ledger.get(i)));
            if !pending.is_empty() {
                weights.push(updated);
                for &i in &pending {
                    ledger.mark_learned(i)?;
                }
            }

            let retrain = match classifier.retrain(state.history.iter().chain(ledger.iter())) {
                Ok(outcome) => outcome,
                Err(e) if e.is_skip() => {
                    warn!(error = %e, "Classifier retrain skipped");
                    RetrainOutcome::Skipped {
                        closed: ledger.closed_count(),
                        reason: e.to_string(),
                    }
                }
                Err(e) => return Err(e),
            };

            self.store
                .save_learning_state(&ledger, &weights, classifier.model())?;

            let latest = weights.latest().values().to_vec();
            info!(
                "Recalculated weights and CBR: {} trades learned, weights {:?}",
                applied, latest
            );
            state.weights = weights;
            state.classifier = classifier;
            CycleOutcome::Learned {
                reconciled,
                applied,
                weights: latest,
                retrain,
            }
        } else {
            self.store.save_account_book(&ledger)?;
            info!("No completed trades to update");
            CycleOutcome::NoCompletedTrades { reconciled }
        };
        state.ledger = ledger;

        let symbol = self.config.symbol.as_str();
        let price = self.broker.latest_price(symbol).await?;
        let cash = self.broker.get_balance(&self.config.cash_asset).await?;
        let position = self.broker.get_balance(symbol).await?;
        let capital = CapitalState::from_balances(cash, position, self.config.start_capital);
        let equity = capital.equity(price);
        if let Some(breach) = self.limits.check(equity, capital.start_capital) {
            warn!(
                kind = ?breach.kind,
                equity,
                threshold = breach.threshold,
                "Stop trading"
            );
            state.stopped = true;
            return Ok(CycleOutcome::RiskBreach { breach });
        }
        debug!(equity, "Risk limits hold");
        Ok(outcome)
    }

    /// Sync ledger rows with venue orders, oldest update first
    async fn reconcile_orders(&self, ledger: &mut Ledger) -> EngineResult<ReconcileReport> {
        let mut orders = self.broker.list_orders().await?;
        orders.sort_by_key(|o| o.updated_at);

        let mut report = ReconcileReport::default();
        let mut stack = StackMatching::new();
        for order in &orders {
            let Some(index) = ledger.find_by_order_id(&order.client_order_id) else {
                continue;
            };
            report.matched += 1;
            let status = ledger.get(index).map(|r| r.status);

            match order.status {
                s if s.is_unfilled() => {
                    if status == Some(RecordStatus::Cancelled) {
                        continue;
                    }
                    self.broker.cancel_order(&order.id).await?;
                    ledger.mark_cancelled(index, Utc::now())?;
                    report.cancelled += 1;
                    info!(index, client_order_id = %order.client_order_id, "Cancelled unfilled order");
                }
                OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired => {
                    if status != Some(RecordStatus::Cancelled) {
                        ledger.mark_cancelled(index, order.updated_at)?;
                        report.cancelled += 1;
                    }
                }
                OrderStatus::Filled => {
                    let price = order.filled_avg_price.ok_or_else(|| {
                        EngineError::Execution(format!(
                            "filled order {} has no fill price",
                            order.client_order_id
                        ))
                    })?;
                    ledger.record_fill(index, price, order.updated_at)?;
                    report.filled += 1;

                    let closed = ledger.get(index).map(|r| r.is_closed()).unwrap_or(false);
                    match order.side {
                        OrderSide::Buy if !closed => stack.push_buy(ledger, index),
                        OrderSide::Buy => {}
                        // Already matched in an earlier cycle
                        OrderSide::Sell if closed => stack.reset(),
                        OrderSide::Sell => {
                            stack.close(ledger, index)?;
                            report.closed_batches += 1;
                        }
                    }
                }
                _ => debug!(index, status = ?order.status, "Order still in flight"),
            }
        }

        debug!(?report, "Orders reconciled");
        Ok(report)
    }

    /// Persist everything; called on shutdown
    pub async fn flush(&self) -> EngineResult<()> {
        let state = self.state.lock().await;
        self.store
            .save_learning_state(&state.ledger, &state.weights, state.classifier.model())?;
        info!("Flushed state to {}", self.store.root().display());
        Ok(())
    }
}
