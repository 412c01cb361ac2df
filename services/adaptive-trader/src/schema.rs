//! Fixed column schema shared by weights, ledger rows and classifier features

use std::collections::{HashMap, HashSet};

use crate::error::{EngineError, EngineResult};

/// Ledger columns that signal and macro names may not shadow
pub const RESERVED_COLUMNS: &[&str] = &[
    "seq",
    "timestamp",
    "updated_at",
    "client_order_id",
    "action",
    "order_type",
    "status",
    "quantity",
    "price",
    "balance",
    "pnl",
    "learned",
    "datetime",
    "Open",
    "High",
    "Low",
    "Close",
    "Volume",
];

/// Leading classifier features, before the signal and macro columns
pub const BASE_FEATURES: &[&str] = &["action", "quantity", "price", "balance"];

/// Ordered signal and macro names, validated once at construction
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    signals: Vec<String>,
    macros: Vec<String>,
}

impl Schema {
    pub fn new(signals: Vec<String>, macros: Vec<String>) -> EngineResult<Self> {
        if signals.is_empty() {
            return Err(EngineError::Schema("at least one signal is required".into()));
        }

        let mut seen = HashSet::new();
        for name in signals.iter().chain(macros.iter()) {
            if name.trim().is_empty() {
                return Err(EngineError::Schema("empty column name".into()));
            }
            if RESERVED_COLUMNS.contains(&name.as_str()) {
                return Err(EngineError::Schema(format!(
                    "'{}' clashes with a ledger column",
                    name
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(EngineError::Schema(format!("duplicate column '{}'", name)));
            }
        }

        Ok(Self { signals, macros })
    }

    pub fn signals(&self) -> &[String] {
        &self.signals
    }

    pub fn macros(&self) -> &[String] {
        &self.macros
    }

    /// Classifier feature names in matrix column order
    pub fn feature_names(&self) -> Vec<String> {
        BASE_FEATURES
            .iter()
            .map(|s| s.to_string())
            .chain(self.signals.iter().cloned())
            .chain(self.macros.iter().cloned())
            .collect()
    }

    pub fn feature_len(&self) -> usize {
        BASE_FEATURES.len() + self.signals.len() + self.macros.len()
    }

    /// Align a name->value map to the signal order
    pub fn reading(&self, values: &HashMap<String, f64>) -> EngineResult<SignalReading> {
        align(&self.signals, values, "signal").map(SignalReading)
    }

    /// Align a name->value map to the macro order
    pub fn macro_values(&self, values: &HashMap<String, f64>) -> EngineResult<Vec<f64>> {
        align(&self.macros, values, "macro variable")
    }
}

fn align(names: &[String], values: &HashMap<String, f64>, kind: &str) -> EngineResult<Vec<f64>> {
    if let Some(unknown) = values.keys().find(|k| !names.contains(k)) {
        return Err(EngineError::Schema(format!("unknown {} '{}'", kind, unknown)));
    }
    names
        .iter()
        .map(|name| {
            values
                .get(name)
                .copied()
                .ok_or_else(|| EngineError::Schema(format!("missing {} '{}'", kind, name)))
        })
        .collect()
}

/// One value per signal, in schema order
#[derive(Debug, Clone, PartialEq)]
pub struct SignalReading(pub Vec<f64>);

impl SignalReading {
    pub fn values(&self) -> &[f64] {
        &self.0
    }
}
