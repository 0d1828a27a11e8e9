//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、モデル構成、学習ハイパーパラメータ、正規化パラメータ、
//! 入出力ディレクトリをJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::Result;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// モデル構成
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelSettings {
    /// バックボーン先頭の埋め込みチャネル数（最終段は8倍）
    pub embed_dim: usize,
    /// バックボーンを凍結して分類部のみ学習する
    pub freeze_backbone: bool,
    /// チャネルアテンションの縮小率
    pub attention_reduction: usize,
    /// 分類ヘッドの中間次元
    pub hidden_dim: usize,
    /// ドロップアウト率
    pub dropout: f64,
    /// 事前学習済みバックボーンの重みファイル
    pub pretrained_backbone: Option<PathBuf>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            embed_dim: 96,
            freeze_backbone: false,
            attention_reduction: 16,
            hidden_dim: 256,
            dropout: 0.3,
            pretrained_backbone: None,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 初期学習率
    pub learning_rate: f64,
    /// AdamW の重み減衰
    pub weight_decay: f32,
    /// 学習率を減衰させる間隔（エポック）
    pub lr_step_size: usize,
    /// 減衰率
    pub lr_gamma: f64,
    /// ランダムシード
    pub seed: u64,
    /// 画像デコードのスレッド数（0 は rayon の既定値）
    pub decode_threads: usize,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 20,
            batch_size: 16,
            learning_rate: 1e-4,
            weight_decay: 0.01,
            lr_step_size: 10,
            lr_gamma: 0.5,
            seed: 42,
            decode_threads: 0,
        }
    }
}

/// 画像正規化パラメータ
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NormalizerSettings {
    pub clahe_clip_limit: f32,
    pub clahe_tile_grid: u32,
    /// 適応二値化のブロックサイズ（奇数）
    pub block_size: usize,
    /// 適応二値化のオフセット C
    pub threshold_offset: i32,
    /// クロージングの構造要素サイズ
    pub closing_kernel: usize,
    pub final_threshold: u8,
}

impl Default for NormalizerSettings {
    fn default() -> Self {
        Self {
            clahe_clip_limit: 2.0,
            clahe_tile_grid: 8,
            block_size: 11,
            threshold_offset: 2,
            closing_kernel: 2,
            final_threshold: 128,
        }
    }
}

/// 入出力ディレクトリ
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathSettings {
    /// `train_set` / `val_set` / `test_set` を含むコーパスのルート
    pub data_root: PathBuf,
    /// チェックポイントの保存先
    pub weights_dir: PathBuf,
    /// 学習ログの保存先
    pub logs_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("preprocessed_data"),
            weights_dir: PathBuf::from("model_weights"),
            logs_dir: PathBuf::from("training_logs"),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    pub model: ModelSettings,
    pub training: TrainingSettings,
    pub normalizer: NormalizerSettings,
    pub paths: PathSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            info!(path = %path.display(), "設定ファイルが存在しません。デフォルト設定を使用します");
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => {
                info!(path = %path.display(), "設定ファイルを読み込みました");
                config
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "設定ファイルの読み込みに失敗しました。デフォルト設定を使用します");
                Self::default()
            }
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("埋め込み次元: {}", self.model.embed_dim);
        println!("バックボーン凍結: {}", self.model.freeze_backbone);
        println!("ドロップアウト率: {}", self.model.dropout);
        if let Some(ref path) = self.model.pretrained_backbone {
            println!("事前学習済み重み: {}", path.display());
        }
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!(
            "学習率減衰: {} エポックごとに x{}",
            self.training.lr_step_size, self.training.lr_gamma
        );
        println!("シード: {}", self.training.seed);
        println!("\n--- 正規化設定 ---");
        println!(
            "CLAHE: clip {} / {}x{} タイル",
            self.normalizer.clahe_clip_limit, self.normalizer.clahe_tile_grid, self.normalizer.clahe_tile_grid
        );
        println!(
            "適応二値化: ブロック {} / C={}",
            self.normalizer.block_size, self.normalizer.threshold_offset
        );
        println!("\n--- パス ---");
        println!("データ: {}", self.paths.data_root.display());
        println!("重み: {}", self.paths.weights_dir.display());
        println!("ログ: {}", self.paths.logs_dir.display());
        println!("========================\n");
    }
}
