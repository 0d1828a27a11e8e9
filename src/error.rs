//! 分類パイプライン全体のエラー型
//!
//! サンプル単位のデコード失敗 (`ImageDecode`) だけはローダー内で回復され、
//! それ以外はすべて呼び出し元へ伝播します。

use std::path::PathBuf;

use thiserror::Error;

use crate::types::Split;

pub type Result<T, E = ClassifierError> = std::result::Result<T, E>;

/// 学習・推論で発生するエラー
#[derive(Debug, Error)]
pub enum ClassifierError {
    /// デコードできない、または面積ゼロの入力画像
    #[error("invalid image: {reason}")]
    InvalidImage { reason: String },

    /// 分割ディレクトリに読み込める画像が1枚もない
    #[error("no readable images in {split} split at {dir:?}")]
    DatasetEmpty { split: Split, dir: PathBuf },

    /// 単一サンプルのデコード失敗（ログ出力してスキップ）
    #[error("failed to decode {path:?}: {source}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// 分割間でクラス集合が一致しない
    #[error("class set of {split} split {found:?} does not match training classes {expected:?}")]
    ClassSetMismatch {
        split: Split,
        expected: Vec<String>,
        found: Vec<String>,
    },

    /// チェックポイントのアーキテクチャと構築したモデルが一致しない
    #[error("checkpoint architecture mismatch: {details}")]
    ArchitectureMismatch { details: String },

    #[error("model file not found: {0:?}")]
    ModelFileNotFound(PathBuf),

    #[error("image file not found: {0:?}")]
    ImageFileNotFound(PathBuf),

    /// 損失が有限値でなくなった（学習を中断する）
    #[error("non-finite loss {loss} during {phase} at epoch {epoch}, batch {batch}")]
    NumericInstability {
        phase: &'static str,
        epoch: usize,
        batch: usize,
        loss: f64,
    },

    /// ベストチェックポイント未作成のままテストを実行しようとした
    #[error("no best checkpoint has been written for this run")]
    MissingBestCheckpoint,

    #[error("malformed checkpoint {path:?}: {reason}")]
    CheckpointFormat { path: PathBuf, reason: String },

    #[error("record error: {0}")]
    Record(#[from] burn::record::RecorderError),

    #[error("tensor data error: {0}")]
    Tensor(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl ClassifierError {
    pub(crate) fn invalid_image(reason: impl Into<String>) -> Self {
        Self::InvalidImage {
            reason: reason.into(),
        }
    }

    pub(crate) fn checkpoint_format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CheckpointFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
