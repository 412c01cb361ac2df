//! Error types for the learning core

/// Result alias used across the library core
pub type EngineResult<T> = Result<T, EngineError>;

/// Error types for the decision/learning engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Schema violation: {0}")]
    Schema(String),

    #[error("Malformed row {row}: {reason}")]
    MalformedRow { row: usize, reason: String },

    #[error("Ledger invariant violated at row {index}: {reason}")]
    Ledger { index: usize, reason: String },

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Insufficient {asset}: need {needed}, have {available}")]
    InsufficientFunds {
        asset: String,
        needed: f64,
        available: f64,
    },

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn malformed(row: usize, reason: impl Into<String>) -> Self {
        Self::MalformedRow {
            row,
            reason: reason.into(),
        }
    }

    pub fn ledger(index: usize, reason: impl Into<String>) -> Self {
        Self::Ledger {
            index,
            reason: reason.into(),
        }
    }

    /// True for the non-fatal skips that only downgrade a proposal
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientData(_) | EngineError::InsufficientFunds { .. }
        )
    }
}
