//! Batch matching - decide which buys a sell closes
//!
//! Both drivers close "a batch of prior buys against one sell" and give
//! every row in the batch the same PnL. They differ in how the batch
//! boundary is found: the replay driver counts back by size, the
//! reconciliation driver drains a stack of confirmed fills.

use tracing::debug;

use crate::error::EngineResult;
use crate::ledger::{Action, BatchClose, Ledger};

/// Strategy for choosing the buys closed by a sell
pub trait MatchPolicy {
    /// Ledger indices of the buys closed by the sell at `sell`
    fn batch(&mut self, ledger: &Ledger, sell: usize) -> Vec<usize>;

    /// Select the batch and write the shared PnL
    fn close(&mut self, ledger: &mut Ledger, sell: usize) -> EngineResult<BatchClose> {
        let buys = self.batch(ledger, sell);
        ledger.close_batch(&buys, sell)
    }
}

/// Size-based boundary: a sell of quantity Q closes the most recent
/// `round(Q)` open buys (one unit per prior buy row)
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayMatching;

impl MatchPolicy for ReplayMatching {
    fn batch(&mut self, ledger: &Ledger, sell: usize) -> Vec<usize> {
        let Some(row) = ledger.get(sell) else {
            return Vec::new();
        };
        let count = (row.quantity.round_ties_even() as usize).max(1);

        let open: Vec<usize> = ledger
            .open_buys()
            .into_iter()
            .filter(|&i| i < sell)
            .collect();
        let start = open.len().saturating_sub(count);
        debug!(
            sell,
            quantity = row.quantity,
            matched = open.len() - start,
            "Replay batch"
        );
        open[start..].to_vec()
    }
}

/// Stack-based boundary: filled buys accumulate until a filled sell
/// closes all of them and resets the stack
#[derive(Debug, Default, Clone)]
pub struct StackMatching {
    stack: Vec<usize>,
}

impl StackMatching {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a confirmed buy fill
    pub fn push_buy(&mut self, ledger: &Ledger, index: usize) {
        if ledger.get(index).map(|r| r.action) == Some(Action::Buy) && !self.stack.contains(&index) {
            self.stack.push(index);
        }
    }

    pub fn pending(&self) -> &[usize] {
        &self.stack
    }

    pub fn reset(&mut self) {
        self.stack.clear();
    }
}

impl MatchPolicy for StackMatching {
    fn batch(&mut self, _ledger: &Ledger, sell: usize) -> Vec<usize> {
        let batch = std::mem::take(&mut self.stack);
        debug!(sell, matched = batch.len(), "Stack batch");
        batch
    }
}
