//! 指紋パターン分類モデル
//!
//! 階層型の畳み込みバックボーン、チャネルアテンション、分類ヘッドで構成します。
//!
//! # アーキテクチャ
//! - Stem: Conv 4x4 stride 4 (3 -> d)
//! - Stage x4: 残差 {Conv 3x3 + GELU}、段の間で Conv 2x2 stride 2 によりチャネル倍増
//! - Channel attention: GAP -> FC(C, C/r) -> ReLU -> FC(C/r, C) -> sigmoid -> 乗算
//! - 空間平均プーリング
//! - Head: FC(C, hidden) -> ReLU -> Dropout -> FC(hidden, num_classes)
//!
//! d=96, 入力224の場合: 56 -> 28 -> 14 -> 7、最終特徴 768ch x 7x7

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Dropout, DropoutConfig, Gelu, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    record::{BinBytesRecorder, DefaultFileRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        activation::{sigmoid, softmax},
        backend::Backend,
        Tensor,
    },
};
use tracing::{debug, info};

use crate::error::{ClassifierError, Result};

/// バックボーンの段数
pub const NUM_STAGES: usize = 4;

/// バックボーン設定
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// 先頭段のチャネル数（段ごとに倍増）
    #[config(default = 96)]
    pub embed_dim: usize,
}

impl BackboneConfig {
    /// 出力特徴マップのチャネル数
    pub fn out_channels(&self) -> usize {
        self.embed_dim << (NUM_STAGES - 1)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        let dims: Vec<usize> = (0..NUM_STAGES).map(|i| self.embed_dim << i).collect();

        let stem = Conv2dConfig::new([3, dims[0]], [4, 4])
            .with_stride([4, 4])
            .init(device);
        let blocks = dims
            .iter()
            .map(|&d| {
                Conv2dConfig::new([d, d], [3, 3])
                    .with_padding(PaddingConfig2d::Same)
                    .init(device)
            })
            .collect();
        let downsamples = dims
            .windows(2)
            .map(|w| {
                Conv2dConfig::new([w[0], w[1]], [2, 2])
                    .with_stride([2, 2])
                    .init(device)
            })
            .collect();

        Backbone {
            stem,
            blocks,
            downsamples,
            activation: Gelu::new(),
        }
    }
}

/// 正規化済み画像テンソルから特徴マップを作る特徴抽出器
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    stem: Conv2d<B>,
    blocks: Vec<Conv2d<B>>,
    downsamples: Vec<Conv2d<B>>,
    activation: Gelu,
}

impl<B: Backend> Backbone<B> {
    /// [batch, 3, H, W] -> [batch, C, H/32, W/32]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.stem.forward(images);
        for (i, block) in self.blocks.iter().enumerate() {
            let residual = x.clone();
            x = residual + self.activation.forward(block.forward(x));
            if let Some(down) = self.downsamples.get(i) {
                x = down.forward(x);
            }
        }
        x
    }
}

/// Squeeze-and-Excitation 型のチャネルアテンション
#[derive(Module, Debug)]
pub struct ChannelAttention<B: Backend> {
    squeeze: Linear<B>,
    excite: Linear<B>,
    activation: Relu,
}

impl<B: Backend> ChannelAttention<B> {
    pub fn new(channels: usize, reduction: usize, device: &B::Device) -> Self {
        let reduced = (channels / reduction.max(1)).max(1);
        Self {
            squeeze: LinearConfig::new(channels, reduced).init(device),
            excite: LinearConfig::new(reduced, channels).init(device),
            activation: Relu::new(),
        }
    }

    /// チャネルごとのゲート値 [batch, C]（0..1）
    pub fn gate(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let pooled = global_average_pool(x);
        let s = self.activation.forward(self.squeeze.forward(pooled));
        sigmoid(self.excite.forward(s))
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, c, h, w] = x.dims();
        let gate = self.gate(x.clone()).reshape([b, c, 1, 1]).expand([b, c, h, w]);
        x * gate
    }
}

/// 空間方向の平均 [batch, C, H, W] -> [batch, C]
pub fn global_average_pool<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 2> {
    let [b, c, _, _] = x.dims();
    x.mean_dim(3).mean_dim(2).reshape([b, c])
}

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    #[config(default = 96)]
    pub embed_dim: usize,
    /// バックボーンを学習対象から外す
    #[config(default = false)]
    pub freeze_backbone: bool,
    #[config(default = 16)]
    pub attention_reduction: usize,
    #[config(default = 256)]
    pub hidden_dim: usize,
    /// ドロップアウト率（学習時のみ有効）
    #[config(default = 0.3)]
    pub dropout: f64,
}

impl ModelConfig {
    pub fn backbone(&self) -> BackboneConfig {
        BackboneConfig::new().with_embed_dim(self.embed_dim)
    }

    /// 特徴ベクトルの次元
    pub fn feature_dim(&self) -> usize {
        self.backbone().out_channels()
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<PatternClassifier<B>> {
        if self.num_classes == 0 {
            return Err(ClassifierError::Config("num_classes must be positive".to_string()));
        }
        let features = self.feature_dim();
        info!(
            num_classes = self.num_classes,
            features,
            hidden = self.hidden_dim,
            frozen = self.freeze_backbone,
            "initializing pattern classifier"
        );

        let model = PatternClassifier {
            backbone: self.backbone().init(device),
            attention: ChannelAttention::new(features, self.attention_reduction, device),
            fc1: LinearConfig::new(features, self.hidden_dim).init(device),
            fc2: LinearConfig::new(self.hidden_dim, self.num_classes).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            activation: Relu::new(),
        };
        Ok(model.with_frozen_backbone(self.freeze_backbone))
    }

    /// チェックポイントの構成と一致するか確認する
    pub fn ensure_compatible(&self, stored: &ModelConfig) -> Result<()> {
        let mut diffs = Vec::new();
        if self.num_classes != stored.num_classes {
            diffs.push(format!("num_classes {} != {}", self.num_classes, stored.num_classes));
        }
        if self.freeze_backbone != stored.freeze_backbone {
            diffs.push(format!(
                "freeze_backbone {} != {}",
                self.freeze_backbone, stored.freeze_backbone
            ));
        }
        if self.embed_dim != stored.embed_dim {
            diffs.push(format!("embed_dim {} != {}", self.embed_dim, stored.embed_dim));
        }
        if self.hidden_dim != stored.hidden_dim {
            diffs.push(format!("hidden_dim {} != {}", self.hidden_dim, stored.hidden_dim));
        }
        if self.attention_reduction != stored.attention_reduction {
            diffs.push(format!(
                "attention_reduction {} != {}",
                self.attention_reduction, stored.attention_reduction
            ));
        }
        if diffs.is_empty() {
            Ok(())
        } else {
            Err(ClassifierError::ArchitectureMismatch {
                details: diffs.join(", "),
            })
        }
    }
}

/// 指紋パターン分類モデル
#[derive(Module, Debug)]
pub struct PatternClassifier<B: Backend> {
    backbone: Backbone<B>,
    attention: ChannelAttention<B>,
    fc1: Linear<B>,
    fc2: Linear<B>,
    dropout: Dropout,
    activation: Relu,
}

impl<B: Backend> PatternClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, 224, 224]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        let features = self.attention.forward(features);
        let x = global_average_pool(features);

        let x = self.activation.forward(self.fc1.forward(x));
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }

    /// クラス確率 [batch_size, num_classes]
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// `freeze` が真ならバックボーンを勾配計算から外す
    pub fn with_frozen_backbone(mut self, freeze: bool) -> Self {
        if freeze {
            self.backbone = self.backbone.no_grad();
        }
        self
    }

    /// 事前学習済みのバックボーン重みを読み込む
    pub fn load_pretrained_backbone(mut self, path: &Path, device: &B::Device) -> Result<Self> {
        if !path.exists() {
            return Err(ClassifierError::ModelFileNotFound(path.to_path_buf()));
        }
        let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
        self.backbone = self.backbone.load_file(path.to_path_buf(), &recorder, device)?;
        info!(path = %path.display(), "pretrained backbone loaded");
        Ok(self)
    }

    /// 重みをバイト列に変換
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let bytes = Recorder::<B>::record(&recorder, self.clone().into_record(), ())?;
        debug!(bytes = bytes.len(), "model serialized");
        Ok(bytes)
    }

    /// バイト列から重みを復元
    pub fn load_bytes(self, bytes: Vec<u8>, device: &B::Device) -> Result<Self> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = Recorder::<B>::load(&recorder, bytes, device)?;
        Ok(self.load_record(record))
    }
}

/// 行ごとの最大値インデックス（同値は先頭を採用）
pub fn argmax_rows(values: &[f32], num_classes: usize) -> Vec<usize> {
    if num_classes == 0 {
        return Vec::new();
    }
    values
        .chunks(num_classes)
        .map(|row| {
            let mut best = 0;
            for (i, &v) in row.iter().enumerate().skip(1) {
                if v > row[best] {
                    best = i;
                }
            }
            best
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn tiny_config(num_classes: usize) -> ModelConfig {
        ModelConfig::new(num_classes)
            .with_embed_dim(4)
            .with_hidden_dim(8)
            .with_attention_reduction(4)
    }

    #[test]
    fn test_default_backbone_has_768_channels() {
        assert_eq!(BackboneConfig::new().out_channels(), 768);
        assert_eq!(ModelConfig::new(3).feature_dim(), 768);
    }

    #[test]
    fn test_forward_shapes() {
        let device = NdArrayDevice::Cpu;
        let config = tiny_config(3);
        let model = config.init::<TestBackend>(&device).unwrap();
        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 224, 224], &device);

        let features = model.backbone.forward(images.clone());
        assert_eq!(features.dims(), [2, 32, 7, 7]);
        assert_eq!(model.forward(images).dims(), [2, 3]);
    }

    #[test]
    fn test_attention_gate_in_unit_range() {
        let device = NdArrayDevice::Cpu;
        let attention = ChannelAttention::<TestBackend>::new(32, 16, &device);
        let x = Tensor::<TestBackend, 4>::random(
            [2, 32, 5, 5],
            burn::tensor::Distribution::Normal(0.0, 3.0),
            &device,
        );
        let gate: Vec<f32> = attention.gate(x.clone()).into_data().to_vec().unwrap();
        assert_eq!(gate.len(), 64);
        assert!(gate.iter().all(|&g| (0.0..=1.0).contains(&g)));
        assert_eq!(attention.forward(x).dims(), [2, 32, 5, 5]);
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let device = NdArrayDevice::Cpu;
        let model = tiny_config(3).init::<TestBackend>(&device).unwrap();
        let images = Tensor::<TestBackend, 4>::ones([1, 3, 224, 224], &device);
        let probs: Vec<f32> = model.probabilities(images).into_data().to_vec().unwrap();
        assert_eq!(probs.len(), 3);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_bytes_round_trip_keeps_output() {
        let device = NdArrayDevice::Cpu;
        let config = tiny_config(2);
        let model = config.init::<TestBackend>(&device).unwrap();
        let bytes = model.to_bytes().unwrap();

        let restored = config
            .init::<TestBackend>(&device)
            .unwrap()
            .load_bytes(bytes, &device)
            .unwrap();

        let images = Tensor::<TestBackend, 4>::ones([1, 3, 224, 224], &device);
        let a: Vec<f32> = model.forward(images.clone()).into_data().to_vec().unwrap();
        let b: Vec<f32> = restored.forward(images).into_data().to_vec().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_ensure_compatible_reports_differences() {
        let stored = tiny_config(3);
        assert!(tiny_config(3).ensure_compatible(&stored).is_ok());

        let err = tiny_config(4)
            .with_freeze_backbone(true)
            .ensure_compatible(&stored)
            .unwrap_err();
        match err {
            ClassifierError::ArchitectureMismatch { details } => {
                assert!(details.contains("num_classes"));
                assert!(details.contains("freeze_backbone"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_argmax_rows_prefers_first_on_tie() {
        let values = [0.2, 0.5, 0.5, 0.9, 0.1, 0.0];
        assert_eq!(argmax_rows(&values, 3), vec![1, 0]);
    }
}
