//! 学習メトリクスのログ
//!
//! `training_metrics.json` をエポックごとに全体を書き直します。同じ系列を
//! `history.csv` にも書き出します。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::checkpoint_storage::write_atomic;

pub const METRICS_FILE: &str = "training_metrics.json";
pub const HISTORY_FILE: &str = "history.csv";

/// クラス別のテスト結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassAccuracy {
    pub label: String,
    pub correct: usize,
    pub total: usize,
    /// パーセント
    pub accuracy: f64,
}

/// 1エポック分の統計
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 1始まり
    pub epoch: usize,
    pub train_loss: f64,
    pub train_acc: f64,
    pub val_loss: f64,
    pub val_acc: f64,
    pub learning_rate: f64,
}

/// 学習ランのメトリクス（精度はパーセント）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub train_loss: Vec<f64>,
    pub train_acc: Vec<f64>,
    pub val_loss: Vec<f64>,
    pub val_acc: Vec<f64>,
    pub learning_rates: Vec<f64>,
    pub test_acc: Option<f64>,
    /// 0 はベスト未確定
    pub best_epoch: usize,
    #[serde(default)]
    pub test_per_class: Vec<ClassAccuracy>,
}

impl TrainingMetrics {
    pub fn push(&mut self, record: EpochRecord) {
        self.train_loss.push(record.train_loss);
        self.train_acc.push(record.train_acc);
        self.val_loss.push(record.val_loss);
        self.val_acc.push(record.val_acc);
        self.learning_rates.push(record.learning_rate);
    }

    /// 記録済みのエポック数
    pub fn epochs(&self) -> usize {
        self.val_acc.len()
    }

    /// 先頭 `epochs` 件だけを残す（再開時に使用）
    pub fn truncate(&mut self, epochs: usize) {
        self.train_loss.truncate(epochs);
        self.train_acc.truncate(epochs);
        self.val_loss.truncate(epochs);
        self.val_acc.truncate(epochs);
        self.learning_rates.truncate(epochs);
        if self.best_epoch > epochs {
            self.best_epoch = 0;
        }
        self.test_acc = None;
        self.test_per_class.clear();
    }

    pub fn records(&self) -> Vec<EpochRecord> {
        (0..self.epochs())
            .map(|i| EpochRecord {
                epoch: i + 1,
                train_loss: self.train_loss.get(i).copied().unwrap_or(f64::NAN),
                train_acc: self.train_acc.get(i).copied().unwrap_or(f64::NAN),
                val_loss: self.val_loss.get(i).copied().unwrap_or(f64::NAN),
                val_acc: self.val_acc[i],
                learning_rate: self.learning_rates.get(i).copied().unwrap_or(f64::NAN),
            })
            .collect()
    }

    /// 記録済みの最高検証精度
    pub fn best_val_acc(&self) -> Option<f64> {
        self.val_acc.iter().copied().fold(None, |best, v| match best {
            Some(b) if b >= v => Some(b),
            _ => Some(v),
        })
    }

    /// ランディレクトリに JSON と CSV を書き出す
    pub fn save(&self, run_dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(&run_dir.join(METRICS_FILE), json.as_bytes())?;

        let mut writer = csv::Writer::from_writer(Vec::new());
        for record in self.records() {
            writer.serialize(record)?;
        }
        let csv_bytes = writer.into_inner().map_err(|e| e.into_error())?;
        write_atomic(&run_dir.join(HISTORY_FILE), &csv_bytes)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn metrics_path(run_dir: &Path) -> PathBuf {
        run_dir.join(METRICS_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(epoch: usize, val_acc: f64) -> EpochRecord {
        EpochRecord {
            epoch,
            train_loss: 1.0 / epoch as f64,
            train_acc: 50.0,
            val_loss: 0.9,
            val_acc,
            learning_rate: 1e-4,
        }
    }

    #[test]
    fn test_save_writes_json_and_csv() {
        let dir = tempfile::tempdir().unwrap();
        let mut metrics = TrainingMetrics::default();
        metrics.push(record(1, 40.0));
        metrics.push(record(2, 60.0));
        metrics.best_epoch = 2;
        metrics.save(dir.path()).unwrap();

        let json = std::fs::read_to_string(dir.path().join(METRICS_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["val_acc"].as_array().unwrap().len(), 2);
        assert!(value["test_acc"].is_null());
        assert_eq!(value["best_epoch"], 2);

        let mut reader = csv::Reader::from_path(dir.path().join(HISTORY_FILE)).unwrap();
        let rows: Vec<EpochRecord> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].epoch, 2);
        assert_eq!(rows[1].val_acc, 60.0);

        assert_eq!(TrainingMetrics::load(&dir.path().join(METRICS_FILE)).unwrap(), metrics);
    }

    #[test]
    fn test_truncate_drops_later_epochs() {
        let mut metrics = TrainingMetrics::default();
        for (i, acc) in [10.0, 30.0, 20.0].into_iter().enumerate() {
            metrics.push(record(i + 1, acc));
        }
        metrics.best_epoch = 2;
        metrics.test_acc = Some(25.0);
        metrics.truncate(1);

        assert_eq!(metrics.epochs(), 1);
        assert_eq!(metrics.best_epoch, 0);
        assert!(metrics.test_acc.is_none());
        assert_eq!(metrics.best_val_acc(), Some(10.0));
    }

    #[test]
    fn test_best_val_acc_is_maximum() {
        let mut metrics = TrainingMetrics::default();
        assert_eq!(metrics.best_val_acc(), None);
        for (i, acc) in [10.0, 30.0, 20.0].into_iter().enumerate() {
            metrics.push(record(i + 1, acc));
        }
        assert_eq!(metrics.best_val_acc(), Some(30.0));
    }
}
