//! チェックポイントのメタデータ
//!
//! tar.gz 内の `metadata.json` として保存され、重みを読み込まずに
//! エポック、精度、モデル構成、クラス順序を確認できます。

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ml::ml_model::ModelConfig;

/// チェックポイントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointKind {
    /// 検証精度が更新されるたびに上書きされる
    Best,
    /// 学習終了時に1回だけ書かれる
    Final,
}

impl CheckpointKind {
    /// ファイル名の接頭辞
    pub fn file_prefix(self) -> &'static str {
        match self {
            CheckpointKind::Best => "best_model",
            CheckpointKind::Final => "final_model",
        }
    }
}

impl std::fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CheckpointKind::Best => "best",
            CheckpointKind::Final => "final",
        })
    }
}

/// チェックポイントメタデータ
///
/// 精度はすべてパーセント (0..100)。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub kind: CheckpointKind,
    /// 学習ランのID（`%Y%m%d_%H%M%S`）
    pub run_id: String,
    /// 完了したエポック数（1始まり）
    pub epoch: usize,
    pub val_accuracy: f64,
    pub train_accuracy: f64,
    /// final のみ: 最終エポックの検証精度
    #[serde(default)]
    pub final_val_acc: Option<f64>,
    /// final のみ: ラン全体での最高検証精度
    #[serde(default)]
    pub best_val_acc: Option<f64>,
    /// このエポックの学習で使った学習率
    pub learning_rate: f64,
    /// モデル構成
    pub architecture: ModelConfig,
    /// パラメータ数（構成の整合確認用）
    pub num_params: usize,
    /// クラスインデックス順のラベル
    pub class_names: Vec<String>,
    /// 作成時刻（RFC3339）
    pub created_at: String,
}

impl CheckpointMetadata {
    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// 再開時に引き継ぐ最高検証精度
    pub fn best_so_far(&self) -> f64 {
        self.best_val_acc.unwrap_or(self.val_accuracy)
    }
}

#[cfg(test)]
pub(crate) fn sample_metadata(kind: CheckpointKind) -> CheckpointMetadata {
    CheckpointMetadata {
        kind,
        run_id: "20240101_120000".to_string(),
        epoch: 3,
        val_accuracy: 75.0,
        train_accuracy: 80.0,
        final_val_acc: None,
        best_val_acc: None,
        learning_rate: 1e-4,
        architecture: ModelConfig::new(3),
        num_params: 1234,
        class_names: vec!["Arch".into(), "Loop".into(), "Whorl".into()],
        created_at: chrono::Local::now().to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip_keeps_architecture() {
        let mut meta = sample_metadata(CheckpointKind::Final);
        meta.best_val_acc = Some(90.0);
        let json = meta.to_json_string().unwrap();
        assert!(json.contains("\"kind\": \"final\""));

        let back = CheckpointMetadata::from_json_string(&json).unwrap();
        assert_eq!(back.kind, CheckpointKind::Final);
        assert_eq!(back.architecture.num_classes, 3);
        assert_eq!(back.architecture.embed_dim, 96);
        assert_eq!(back.best_so_far(), 90.0);
    }

    #[test]
    fn test_best_so_far_falls_back_to_val_accuracy() {
        assert_eq!(sample_metadata(CheckpointKind::Best).best_so_far(), 75.0);
    }
}
