//! Persistence - weight history, ledgers and the classifier model
//!
//! Every table is read back in full on startup. Writes go to a sibling
//! `.tmp` file that is renamed over the target, so a failed write leaves
//! the previously persisted copy in place.

use chrono::{DateTime, Utc};
use csv::StringRecord;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::cbr::LogisticModel;
use crate::error::{EngineError, EngineResult};
use crate::learner::{WeightHistory, WeightVector};
use crate::ledger::{Action, Ledger, OrderType, RecordStatus, TradeRecord};
use crate::schema::Schema;

pub const WEIGHTS_FILE: &str = "agent_weights.csv";
pub const ACCOUNT_BOOK_FILE: &str = "account_book.csv";
pub const TRADEBOOK_FILE: &str = "tradebook.csv";
pub const MODEL_FILE: &str = "cbr.json";

/// Fixed leading ledger columns
const LEDGER_COLUMNS: &[&str] = &[
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
];

/// File-backed store rooted at the data directory
#[derive(Debug, Clone)]
pub struct DataStore {
    root: PathBuf,
    schema: Schema,
}

impl DataStore {
    pub fn new(root: impl AsRef<Path>, schema: Schema) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            schema,
        }
    }

    pub fn init(&self) -> EngineResult<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.feeds_dir())?;
        fs::create_dir_all(self.state_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn feeds_dir(&self) -> PathBuf {
        self.root.join("feeds")
    }

    /// JSON snapshot polled by the feed worker
    pub fn feed_snapshot_path(&self) -> PathBuf {
        self.feeds_dir().join("latest.json")
    }

    // Weights

    /// Full weight history; uniform weights when nothing is persisted
    pub fn load_weights(&self) -> EngineResult<WeightHistory> {
        let path = self.root.join(WEIGHTS_FILE);
        let header: Vec<String> = self.schema.signals().to_vec();
        let Some(records) = read_table(&path, &header)? else {
            info!("No weight history at {}, starting uniform", path.display());
            return WeightHistory::from_rows(&self.schema, Vec::new());
        };

        let rows = records
            .iter()
            .enumerate()
            .map(|(row, rec)| {
                rec.iter()
                    .enumerate()
                    .map(|(col, v)| parse_f64(v, row, &header[col]))
                    .collect::<EngineResult<Vec<f64>>>()
                    .map(WeightVector)
            })
            .collect::<EngineResult<Vec<_>>>()?;
        debug!("Loaded {} weight rows", rows.len());
        WeightHistory::from_rows(&self.schema, rows)
    }

    pub fn save_weights(&self, history: &WeightHistory) -> EngineResult<()> {
        commit_all(vec![self.stage_weights(history)?])
    }

    fn stage_weights(&self, history: &WeightHistory) -> EngineResult<Staged> {
        let rows = history
            .rows()
            .iter()
            .map(|w| w.values().iter().map(|v| v.to_string()).collect());
        stage_table(
            &self.root.join(WEIGHTS_FILE),
            self.schema.signals(),
            rows,
        )
    }

    /// Persist the outcome of a learning cycle as one unit.
    ///
    /// All three files are written to temp siblings first; nothing is renamed
    /// unless every write succeeded. Renames run account book first and
    /// weights last, so an interrupted commit can lose the newest weight row
    /// but never leaves persisted weights ahead of the `learned` flags.
    pub fn save_learning_state(
        &self,
        ledger: &Ledger,
        weights: &WeightHistory,
        model: Option<&LogisticModel>,
    ) -> EngineResult<()> {
        let staged = [
            Some(self.stage_ledger(&self.root.join(ACCOUNT_BOOK_FILE), ledger)),
            model.map(|m| self.stage_model(m)),
            Some(self.stage_weights(weights)),
        ];

        let mut ready = Vec::with_capacity(staged.len());
        let mut failure = None;
        for result in staged.into_iter().flatten() {
            match result {
                Ok(file) => ready.push(file),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            ready.into_iter().for_each(Staged::discard);
            return Err(e);
        }
        commit_all(ready)
    }

    // Ledgers

    /// Live ledger, resumed across restarts
    pub fn load_account_book(&self) -> EngineResult<Ledger> {
        self.load_ledger(&self.root.join(ACCOUNT_BOOK_FILE))
    }

    pub fn save_account_book(&self, ledger: &Ledger) -> EngineResult<()> {
        self.save_ledger(&self.root.join(ACCOUNT_BOOK_FILE), ledger)
    }

    /// Replay output; also the long-term history for live retraining
    pub fn load_tradebook(&self) -> EngineResult<Ledger> {
        self.load_ledger(&self.root.join(TRADEBOOK_FILE))
    }

    pub fn save_tradebook(&self, ledger: &Ledger) -> EngineResult<()> {
        self.save_ledger(&self.root.join(TRADEBOOK_FILE), ledger)
    }

    fn ledger_header(&self) -> Vec<String> {
        LEDGER_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(self.schema.signals().iter().cloned())
            .chain(self.schema.macros().iter().cloned())
            .collect()
    }

    fn load_ledger(&self, path: &Path) -> EngineResult<Ledger> {
        let header = self.ledger_header();
        let Some(records) = read_table(path, &header)? else {
            debug!("No ledger at {}", path.display());
            return Ok(Ledger::new(&self.schema));
        };
        let rows = records
            .iter()
            .enumerate()
            .map(|(row, rec)| self.parse_record(row, rec, &header))
            .collect::<EngineResult<Vec<_>>>()?;
        info!("Loaded {} ledger rows from {}", rows.len(), path.display());
        Ledger::from_records(&self.schema, rows)
    }

    fn save_ledger(&self, path: &Path, ledger: &Ledger) -> EngineResult<()> {
        commit_all(vec![self.stage_ledger(path, ledger)?])
    }

    fn stage_ledger(&self, path: &Path, ledger: &Ledger) -> EngineResult<Staged> {
        let rows = ledger.iter().map(format_record);
        stage_table(path, &self.ledger_header(), rows)
    }

    fn parse_record(
        &self,
        row: usize,
        rec: &StringRecord,
        header: &[String],
    ) -> EngineResult<TradeRecord> {
        let get = |col: usize| rec.get(col).unwrap_or("");
        let num = |col: usize| parse_f64(get(col), row, &header[col]);

        let seq = get(0)
            .parse::<usize>()
            .map_err(|e| EngineError::malformed(row, format!("seq: {}", e)))?;
        let timestamp = parse_time(get(1), row)?;
        let updated_at = match get(2) {
            "" => None,
            raw => Some(parse_time(raw, row)?),
        };
        let client_order_id = match get(3) {
            "" => None,
            id => Some(id.to_string()),
        };
        let action = Action::from_str(get(4)).map_err(|e| EngineError::malformed(row, e))?;
        let order_type =
            OrderType::from_str(get(5)).map_err(|e| EngineError::malformed(row, e))?;
        let status =
            RecordStatus::from_str(get(6)).map_err(|e| EngineError::malformed(row, e))?;
        let pnl = match get(10) {
            "" => None,
            _ => Some(num(10)?),
        };
        let learned = match get(11) {
            "true" | "1" => true,
            "false" | "0" | "" => false,
            other => {
                return Err(EngineError::malformed(
                    row,
                    format!("learned: expected a boolean, got '{}'", other),
                ))
            }
        };

        let n_signals = self.schema.signals().len();
        let base = LEDGER_COLUMNS.len();
        let signals = (base..base + n_signals)
            .map(num)
            .collect::<EngineResult<Vec<_>>>()?;
        let macros = (base + n_signals..header.len())
            .map(num)
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(TradeRecord {
            seq,
            timestamp,
            updated_at,
            client_order_id,
            action,
            order_type,
            status,
            quantity: num(7)?,
            price: num(8)?,
            balance: num(9)?,
            pnl,
            learned,
            signals,
            macros,
        })
    }

    // Model

    pub fn load_model(&self) -> EngineResult<Option<LogisticModel>> {
        let path = self.root.join(MODEL_FILE);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_model(&self, model: &LogisticModel) -> EngineResult<()> {
        commit_all(vec![self.stage_model(model)?])
    }

    fn stage_model(&self, model: &LogisticModel) -> EngineResult<Staged> {
        let json = serde_json::to_string_pretty(model)?;
        stage(&self.root.join(MODEL_FILE), |tmp| {
            fs::write(tmp, json.as_bytes())?;
            Ok(())
        })
    }
}

fn format_record(r: &TradeRecord) -> Vec<String> {
    let mut out = vec![
        r.seq.to_string(),
        r.timestamp.to_rfc3339(),
        r.updated_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        r.client_order_id.clone().unwrap_or_default(),
        r.action.as_str().to_string(),
        r.order_type.as_str().to_string(),
        r.status.as_str().to_string(),
        r.quantity.to_string(),
        r.price.to_string(),
        r.balance.to_string(),
        r.pnl().map(|p| p.to_string()).unwrap_or_default(),
        r.learned.to_string(),
    ];
    out.extend(r.signals.iter().map(|v| v.to_string()));
    out.extend(r.macros.iter().map(|v| v.to_string()));
    out
}

fn parse_f64(raw: &str, row: usize, column: &str) -> EngineResult<f64> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| EngineError::malformed(row, format!("{}: invalid number '{}'", column, raw)))
}

fn parse_time(raw: &str, row: usize) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EngineError::malformed(row, format!("timestamp '{}': {}", raw, e)))
}

/// Read a CSV table whose header must equal `expected`; None when absent
fn read_table(path: &Path, expected: &[String]) -> EngineResult<Option<Vec<StringRecord>>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut reader = csv::Reader::from_path(path)?;
    let header: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    if header != expected {
        return Err(EngineError::Schema(format!(
            "{} has columns {:?}, expected {:?}",
            path.display(),
            header,
            expected
        )));
    }
    let records = reader.records().collect::<Result<Vec<_>, csv::Error>>()?;
    Ok(Some(records))
}

fn stage_table(
    path: &Path,
    header: &[String],
    rows: impl Iterator<Item = Vec<String>>,
) -> EngineResult<Staged> {
    stage(path, |tmp| {
        let mut writer = csv::Writer::from_path(tmp)?;
        writer.write_record(header)?;
        for row in rows {
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    })
}

/// Fully written temp sibling waiting to be renamed over its target
struct Staged {
    tmp: PathBuf,
    path: PathBuf,
}

impl Staged {
    fn commit(self) -> EngineResult<()> {
        if let Err(e) = fs::rename(&self.tmp, &self.path) {
            warn!("Failed to persist {}: {}", self.path.display(), e);
            self.discard();
            return Err(e.into());
        }
        debug!("Persisted {}", self.path.display());
        Ok(())
    }

    fn discard(self) {
        let _ = fs::remove_file(&self.tmp);
    }
}

/// Write through `write` into a temp sibling of `path`
fn stage(path: &Path, write: impl FnOnce(&Path) -> EngineResult<()>) -> EngineResult<Staged> {
    let mut name: OsString = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    let staged = Staged {
        tmp: path.with_file_name(name),
        path: path.to_path_buf(),
    };

    if let Err(e) = write(&staged.tmp) {
        warn!("Failed to write {}: {}", staged.tmp.display(), e);
        staged.discard();
        return Err(e);
    }
    Ok(staged)
}

/// Rename staged files in order; the rest are dropped on the first failure
fn commit_all(staged: Vec<Staged>) -> EngineResult<()> {
    let mut pending = staged.into_iter();
    while let Some(file) = pending.next() {
        if let Err(e) = file.commit() {
            pending.for_each(Staged::discard);
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec!["MAAgent".into(), "RSIAgent".into()], vec!["VaR".into()]).unwrap()
    }

    fn store() -> (tempfile::TempDir, DataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::new(dir.path(), schema());
        store.init().unwrap();
        (dir, store)
    }

    fn sample_ledger() -> Ledger {
        let mut ledger = Ledger::new(&schema());
        let buy = TradeRecord::new(Utc::now(), Action::Buy, 1.5, 100.0, 850.0, vec![0.4, -0.2], vec![0.01])
            .with_order("abc", OrderType::Market)
            .with_status(RecordStatus::Filled);
        ledger.append(buy).unwrap();
        ledger
            .append(TradeRecord::new(Utc::now(), Action::Sell, 1.5, 110.0, 1015.0, vec![-0.1, 0.3], vec![0.02]))
            .unwrap();
        ledger.append(TradeRecord::new(Utc::now(), Action::Buy, 1.0, 105.0, 910.0, vec![0.2, 0.2], vec![0.0]))
            .unwrap();
        ledger.close_batch(&[0], 1).unwrap();
        ledger.mark_learned(0).unwrap();
        ledger
    }

    #[test]
    fn test_missing_files_give_fresh_state() {
        let (_dir, store) = store();
        assert_eq!(store.load_weights().unwrap().latest().0, vec![0.5, 0.5]);
        assert!(store.load_account_book().unwrap().is_empty());
        assert!(store.load_model().unwrap().is_none());
    }

    #[test]
    fn test_ledger_survives_restart() {
        let (_dir, store) = store();
        let ledger = sample_ledger();
        store.save_account_book(&ledger).unwrap();

        let loaded = store.load_account_book().unwrap();
        assert_eq!(loaded.len(), 3);
        let first = loaded.get(0).unwrap();
        assert_eq!(first.client_order_id.as_deref(), Some("abc"));
        assert_eq!(first.status, RecordStatus::Filled);
        assert!(first.learned);
        assert_eq!(first.pnl(), Some(15.0));
        assert_eq!(loaded.get(2).unwrap().pnl(), None);
        assert_eq!(loaded.get(1).unwrap().signals, vec![-0.1, 0.3]);
        assert_eq!(loaded.unlearned_closed(), vec![1]);
    }

    #[test]
    fn test_weight_history_appends() {
        let (_dir, store) = store();
        let mut history = store.load_weights().unwrap();
        history.push(WeightVector(vec![0.55, 0.45]));
        store.save_weights(&history).unwrap();

        let loaded = store.load_weights().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.latest().0, vec![0.55, 0.45]);
    }

    #[test]
    fn test_header_mismatch_rejected() {
        let (dir, store) = store();
        fs::write(dir.path().join(WEIGHTS_FILE), "MAAgent,Other\n0.5,0.5\n").unwrap();
        assert!(matches!(store.load_weights(), Err(EngineError::Schema(_))));
    }

    #[test]
    fn test_malformed_row_reports_position() {
        let (dir, store) = store();
        fs::write(dir.path().join(WEIGHTS_FILE), "MAAgent,RSIAgent\n0.5,0.5\n0.5,oops\n").unwrap();
        assert!(matches!(
            store.load_weights(),
            Err(EngineError::MalformedRow { row: 1, .. })
        ));
    }

    #[test]
    fn test_failed_write_keeps_previous_copy() {
        let (dir, store) = store();
        let ledger = sample_ledger();
        store.save_account_book(&ledger).unwrap();

        // A directory where the temp file should go makes the write fail
        fs::create_dir(dir.path().join(format!("{}.tmp", ACCOUNT_BOOK_FILE))).unwrap();
        assert!(store.save_account_book(&Ledger::new(&schema())).is_err());
        assert_eq!(store.load_account_book().unwrap().len(), 3);
    }

    #[test]
    fn test_learning_state_is_all_or_nothing() {
        let (dir, store) = store();
        let ledger = sample_ledger();
        let mut weights = store.load_weights().unwrap();
        store.save_learning_state(&ledger, &weights, None).unwrap();

        // The weights write fails after the account book was staged
        weights.push(WeightVector(vec![0.6, 0.4]));
        let mut relearned = ledger.clone();
        relearned.mark_learned(1).unwrap();
        fs::create_dir(dir.path().join(format!("{}.tmp", WEIGHTS_FILE))).unwrap();
        assert!(store.save_learning_state(&relearned, &weights, None).is_err());

        assert_eq!(store.load_weights().unwrap().len(), 1);
        assert_eq!(store.load_account_book().unwrap().unlearned_closed(), vec![1]);
        assert!(!dir.path().join(format!("{}.tmp", ACCOUNT_BOOK_FILE)).exists());

        fs::remove_dir(dir.path().join(format!("{}.tmp", WEIGHTS_FILE))).unwrap();
        store.save_learning_state(&relearned, &weights, None).unwrap();
        assert_eq!(store.load_weights().unwrap().len(), 2);
        assert!(store.load_account_book().unwrap().unlearned_closed().is_empty());
    }

    #[test]
    fn test_model_round_trip() {
        let (_dir, store) = store();
        let model = LogisticModel {
            feature_names: schema().feature_names(),
            means: vec![0.0; 7],
            scales: vec![1.0; 7],
            weights: vec![0.1; 7],
            bias: -0.2,
            samples: 21,
        };
        store.save_model(&model).unwrap();
        assert_eq!(store.load_model().unwrap(), Some(model));
    }
}
