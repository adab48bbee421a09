use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::broker::OrderAction;
use crate::order::FillKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLeg {
    pub pair_key: String,
    pub symbol: String,
    pub action: OrderAction,
    pub quantity: u32,
    pub entry_price: Decimal,
    pub fill_kind: FillKind,
    pub entry_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedLeg {
    pub symbol: String,
    pub action: OrderAction,
    pub quantity: u32,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub profit: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitRecord {
    pub pair_key: String,
    pub leg1: ClosedLeg,
    pub leg2: ClosedLeg,
    pub net_profit: Decimal,
    pub entry_time: i64,
    pub exit_time: i64,
}

/// Durable open-legs list plus the append-only profit ledger. Legs are
/// always appended and removed as pairs, so a consistent store has even
/// length. Writes go through a tmp file and rename so a concurrent `load`
/// never observes a torn file.
pub struct TradeStateStore {
    trades_path: PathBuf,
    profits_path: PathBuf,
}

impl TradeStateStore {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(trades_path: P, profits_path: Q) -> Self {
        Self {
            trades_path: trades_path.into(),
            profits_path: profits_path.into(),
        }
    }

    /// Missing or corrupt files read as empty; recovery never fails here.
    pub fn load(&self) -> Vec<TradeLeg> {
        load_json_list(&self.trades_path)
    }

    /// Stamps both legs with the pair key and a shared entry time before the
    /// append, so a restart can re-associate them.
    pub fn append_pair(
        &self,
        mut leg1: TradeLeg,
        mut leg2: TradeLeg,
        pair_key: &str,
    ) -> Result<()> {
        let entry_time = Utc::now().timestamp();
        leg1.pair_key = pair_key.to_string();
        leg2.pair_key = pair_key.to_string();
        leg1.entry_time = entry_time;
        leg2.entry_time = entry_time;

        let mut trades = self.load();
        trades.push(leg1);
        trades.push(leg2);
        self.save(&trades)
    }

    pub fn append_profit(&self, record: ProfitRecord) -> Result<()> {
        let mut profits: Vec<ProfitRecord> = load_json_list(&self.profits_path);
        profits.push(record);
        write_json_atomic(&self.profits_path, &profits)
            .with_context(|| format!("failed to write {}", self.profits_path.display()))
    }

    /// Removes the given positions, applied in descending index order so the
    /// earlier indices stay valid during a multi-index removal.
    pub fn remove(&self, indices: &[usize]) -> Result<()> {
        let mut trades = self.load();
        let mut ordered: Vec<usize> = indices.to_vec();
        ordered.sort_unstable();
        ordered.dedup();
        for index in ordered.into_iter().rev() {
            if index < trades.len() {
                trades.remove(index);
            } else {
                log::warn!("[STORE] remove index {} out of range, ignoring", index);
            }
        }
        self.save(&trades)
    }

    pub fn profit_summary(&self) -> (usize, Decimal) {
        let profits: Vec<ProfitRecord> = load_json_list(&self.profits_path);
        let total = profits.iter().map(|r| r.net_profit).sum();
        (profits.len(), total)
    }

    fn save(&self, trades: &[TradeLeg]) -> Result<()> {
        write_json_atomic(&self.trades_path, &trades)
            .with_context(|| format!("failed to write {}", self.trades_path.display()))
    }
}

fn load_json_list<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    match serde_json::from_str(&content) {
        Ok(items) => items,
        Err(e) => {
            log::warn!(
                "[STORE] {} unreadable ({}); treating as empty",
                path.display(),
                e
            );
            Vec::new()
        }
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn leg(symbol: &str, action: OrderAction, price: Decimal) -> TradeLeg {
        TradeLeg {
            pair_key: String::new(),
            symbol: symbol.to_string(),
            action,
            quantity: 10,
            entry_price: price,
            fill_kind: FillKind::Limit,
            entry_time: 0,
        }
    }

    fn store(dir: &TempDir) -> TradeStateStore {
        TradeStateStore::new(
            dir.path().join("trades.json"),
            dir.path().join("profits.json"),
        )
    }

    #[test]
    fn load_is_empty_for_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).load().is_empty());
    }

    #[test]
    fn load_is_empty_for_corrupt_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("trades.json"), "not json{{").unwrap();
        assert!(store(&dir).load().is_empty());
    }

    #[test]
    fn append_pair_stamps_key_and_time() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .append_pair(
                leg("AAA", OrderAction::Sell, dec!(30.00)),
                leg("BBB", OrderAction::Buy, dec!(25.00)),
                "AAA_BBB",
            )
            .unwrap();
        let trades = store.load();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].pair_key, "AAA_BBB");
        assert_eq!(trades[1].pair_key, "AAA_BBB");
        assert!(trades[0].entry_time > 0);
        assert_eq!(trades[0].entry_time, trades[1].entry_time);
    }

    #[test]
    fn remove_keeps_later_records_in_order() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .append_pair(
                leg("AAA", OrderAction::Sell, dec!(30.00)),
                leg("BBB", OrderAction::Buy, dec!(25.00)),
                "AAA_BBB",
            )
            .unwrap();
        store
            .append_pair(
                leg("CCC", OrderAction::Buy, dec!(11.00)),
                leg("DDD", OrderAction::Sell, dec!(12.00)),
                "CCC_DDD",
            )
            .unwrap();

        store.remove(&[0, 1]).unwrap();
        let trades = store.load();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].symbol, "CCC");
        assert_eq!(trades[1].symbol, "DDD");
    }

    #[test]
    fn remove_tolerates_out_of_range_and_duplicate_indices() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .append_pair(
                leg("AAA", OrderAction::Sell, dec!(30.00)),
                leg("BBB", OrderAction::Buy, dec!(25.00)),
                "AAA_BBB",
            )
            .unwrap();
        store.remove(&[1, 1, 9]).unwrap();
        let trades = store.load();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].symbol, "AAA");
    }

    #[test]
    fn profit_ledger_appends_and_sums() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let record = |key: &str, net: Decimal| ProfitRecord {
            pair_key: key.to_string(),
            leg1: ClosedLeg {
                symbol: "AAA".to_string(),
                action: OrderAction::Sell,
                quantity: 10,
                entry_price: dec!(30.00),
                exit_price: dec!(29.00),
                profit: dec!(10.00),
            },
            leg2: ClosedLeg {
                symbol: "BBB".to_string(),
                action: OrderAction::Buy,
                quantity: 10,
                entry_price: dec!(25.00),
                exit_price: dec!(25.50),
                profit: dec!(5.00),
            },
            net_profit: net,
            entry_time: 1,
            exit_time: 2,
        };
        store.append_profit(record("AAA_BBB", dec!(15.00))).unwrap();
        store.append_profit(record("CCC_DDD", dec!(-3.00))).unwrap();
        assert_eq!(store.profit_summary(), (2, dec!(12.00)));
    }
}
