//! Signal feeds - adapters for the external signal producers

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::error::EngineResult;
use crate::schema::{Schema, SignalReading};

/// Values kept per feed
const MAX_FEED_HISTORY: usize = 1024;

/// Feed key carrying the last traded price (consumed by the paper venue)
pub const PRICE_KEY: &str = "price";

/// A named producer of one scalar per time step
pub trait SignalSource: Send + Sync {
    fn name(&self) -> &str;

    /// Most recent value, 0.0 when nothing has been produced yet
    fn latest(&self) -> f64;
}

/// Buffered feed that producers push into and the engine reads from
#[derive(Debug, Clone)]
pub struct SharedFeed {
    name: String,
    values: Arc<RwLock<VecDeque<f64>>>,
}

impl SharedFeed {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    pub fn push(&self, value: f64) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        if values.len() == MAX_FEED_HISTORY {
            values.pop_front();
        }
        values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.read().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SignalSource for SharedFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn latest(&self) -> f64 {
        self.values
            .read()
            .ok()
            .and_then(|v| v.back().copied())
            .unwrap_or(0.0)
    }
}

/// All feeds the live engine reads, keyed by schema
#[derive(Clone)]
pub struct FeedSet {
    signals: Vec<Arc<dyn SignalSource>>,
    macros: Vec<Arc<dyn SignalSource>>,
}

impl FeedSet {
    pub fn new(signals: Vec<Arc<dyn SignalSource>>, macros: Vec<Arc<dyn SignalSource>>) -> Self {
        Self { signals, macros }
    }

    /// Shared feeds for every schema column, returned alongside the set so
    /// producers can push into them
    pub fn shared(schema: &Schema) -> (Self, HashMap<String, SharedFeed>) {
        let mut handles = HashMap::new();
        let mut make = |names: &[String]| -> Vec<Arc<dyn SignalSource>> {
            names
                .iter()
                .map(|name| {
                    let feed = SharedFeed::new(name.clone());
                    handles.insert(name.clone(), feed.clone());
                    Arc::new(feed) as Arc<dyn SignalSource>
                })
                .collect()
        };
        let signals = make(schema.signals());
        let macros = make(schema.macros());
        (Self { signals, macros }, handles)
    }

    /// Snapshot the latest signal values in schema order
    pub fn reading(&self, schema: &Schema) -> EngineResult<SignalReading> {
        schema.reading(&snapshot(&self.signals))
    }

    pub fn macro_values(&self, schema: &Schema) -> EngineResult<Vec<f64>> {
        schema.macro_values(&snapshot(&self.macros))
    }
}

fn snapshot(sources: &[Arc<dyn SignalSource>]) -> HashMap<String, f64> {
    sources
        .iter()
        .map(|s| (s.name().to_string(), s.latest()))
        .collect()
}

/// Polls a JSON snapshot file (`{"MAAgent": 0.4, ...}`) and pushes the
/// values into the matching feeds
pub struct SnapshotFeed {
    path: PathBuf,
    feeds: HashMap<String, SharedFeed>,
}

impl SnapshotFeed {
    pub fn new(path: impl AsRef<Path>, feeds: HashMap<String, SharedFeed>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            feeds,
        }
    }

    /// Read the snapshot once; returns the number of feeds updated
    pub async fn poll(&self) -> anyhow::Result<usize> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No feed snapshot at {}", self.path.display());
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let values: HashMap<String, f64> = serde_json::from_str(&raw)?;
        let mut updated = 0;
        for (name, value) in values {
            match self.feeds.get(&name) {
                Some(feed) if value.is_finite() => {
                    feed.push(value);
                    updated += 1;
                }
                Some(_) => warn!(feed = %name, "Ignoring non-finite feed value"),
                None => debug!(feed = %name, "Snapshot key has no feed"),
            }
        }
        Ok(updated)
    }
}
