//! Cross-module tests for the learning core

#[cfg(test)]
mod tests {
    use crate::config::EngineConfig;
    use crate::ledger::{Action, RecordStatus};
    use crate::replay::{HistoricalData, ReplayDriver};
    use crate::schema::Schema;
    use crate::store::DataStore;

    fn schema() -> Schema {
        Schema::new(vec!["a".into(), "b".into()], vec!["VaR".into()]).unwrap()
    }

    fn config() -> EngineConfig {
        EngineConfig {
            learning_rate: 0.05,
            // Keep sizing unscaled so every sell closes every open buy
            min_closed_trades: 1_000,
            ..EngineConfig::default()
        }
    }

    /// Deterministic candles with signals that flip every few rows
    fn history(rows: usize) -> HistoricalData {
        let mut csv = String::from("datetime,Open,High,Low,Close,Volume,a,b,VaR\n");
        for i in 0..rows {
            let close = 100.0 + ((i * 7) % 11) as f64 * 2.5;
            let a = if (i / 3) % 2 == 0 { 0.8 } else { -0.6 };
            let b = if i % 4 == 0 { -0.3 } else { 0.4 };
            let var = 50.0 + (i % 5) as f64;
            csv.push_str(&format!(
                "2024-01-{:02}T{:02}:00:00Z,0,0,0,{},0,{},{},{}\n",
                1 + i / 24,
                i % 24,
                close,
                a,
                b,
                var
            ));
        }
        HistoricalData::from_reader(csv.as_bytes(), &schema()).unwrap()
    }

    #[test]
    fn test_replay_conserves_capital() {
        let config = config();
        let data = history(60);
        let mut driver = ReplayDriver::new(&config, schema());
        let summary = driver.simulate(&data).unwrap();
        assert!(summary.trades > 4);

        let (mut cash, mut position) = (config.start_capital, 0.0);
        for row in driver.ledger().iter() {
            match row.action {
                Action::Buy => {
                    cash -= row.notional();
                    position += row.quantity;
                }
                Action::Sell => {
                    cash += row.notional();
                    position -= row.quantity;
                }
                Action::None => {}
            }
            assert!((row.balance - cash).abs() < 1e-6, "balance drift at row {}", row.seq);
        }
        assert!((summary.cash - cash).abs() < 1e-6);
        assert!((summary.position - position).abs() < 1e-9);
    }

    #[test]
    fn test_batch_rows_share_one_pnl() {
        let data = history(60);
        let mut driver = ReplayDriver::new(&config(), schema());
        driver.simulate(&data).unwrap();
        let ledger = driver.ledger();

        let mut checked = 0;
        for buy in ledger.iter().filter(|r| r.action == Action::Buy) {
            if buy.status == RecordStatus::MarkedToMarket {
                assert_eq!(ledger.iter().skip(buy.seq).find(|r| r.action == Action::Sell), None);
                continue;
            }
            let sell = ledger
                .iter()
                .skip(buy.seq)
                .find(|r| r.action == Action::Sell)
                .expect("closed buy without a later sell");
            assert_eq!(buy.pnl(), sell.pnl());
            checked += 1;
        }
        assert!(checked > 0);

        // Each sell's PnL is its proceeds minus the cost of the buys it closed
        let mut open_cost = 0.0;
        for row in ledger.iter() {
            match row.action {
                Action::Buy => open_cost += row.notional(),
                Action::Sell => {
                    let expected = row.notional() - open_cost;
                    assert!((row.pnl().unwrap() - expected).abs() < 1e-9);
                    open_cost = 0.0;
                }
                Action::None => {}
            }
        }
    }

    #[test]
    fn test_replay_has_no_lookahead() {
        let full = history(60);
        let prefix = history(35);

        let mut long = ReplayDriver::new(&config(), schema());
        long.simulate(&full).unwrap();
        let mut short = ReplayDriver::new(&config(), schema());
        short.simulate(&prefix).unwrap();

        // Weight rows and trade decisions up to row 35 must not depend on later rows
        let short_weights = short.weights().rows();
        assert_eq!(&long.weights().rows()[..short_weights.len()], short_weights);
        for (a, b) in short.ledger().iter().zip(long.ledger().iter()) {
            assert_eq!(a.action, b.action);
            assert_eq!(a.quantity, b.quantity);
            assert_eq!(a.price, b.price);
            assert_eq!(a.timestamp, b.timestamp);
        }
    }

    #[test]
    fn test_replay_outputs_feed_live_resume() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::new(dir.path(), schema());
        store.init().unwrap();

        let mut driver = ReplayDriver::new(&config(), schema());
        driver.simulate(&history(40)).unwrap();
        driver.persist(&store).unwrap();

        let tradebook = store.load_tradebook().unwrap();
        assert_eq!(tradebook.len(), driver.ledger().len());
        assert_eq!(tradebook.closed_count(), driver.ledger().closed_count());

        let weights = store.load_weights().unwrap();
        assert_eq!(weights.len(), driver.weights().len());
        for (a, b) in weights.latest().values().iter().zip(driver.weights().latest().values()) {
            assert!((a - b).abs() < 1e-9);
        }
    }
}
