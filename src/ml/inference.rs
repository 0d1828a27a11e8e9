//! モデル推論機能

use std::path::Path;

use burn::{
    module::Module,
    tensor::{backend::Backend, Tensor},
};
use image::DynamicImage;
use tracing::{debug, info, warn};

use crate::error::{ClassifierError, Result};
use crate::ml::ml_model::{argmax_rows, ModelConfig, PatternClassifier};
use crate::ml::transform::{image_to_input, IMAGE_SIZE};
use crate::model::checkpoint_metadata::CheckpointMetadata;
use crate::model::checkpoint_storage::{load_checkpoint, load_metadata};
use crate::preprocess::normalizer::ImageNormalizer;
use crate::types::ClassSet;

/// 単一画像の予測結果
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub class_index: usize,
    /// 予測クラスの確率（0..1）
    pub confidence: f32,
    /// クラスインデックス順の確率分布
    pub probabilities: Vec<f32>,
}

/// 推論エンジン
///
/// 学習中のモデルとは独立したパラメータのコピーを保持します。
pub struct InferenceEngine<B: Backend> {
    model: PatternClassifier<B>,
    classes: ClassSet,
    metadata: CheckpointMetadata,
    normalizer: ImageNormalizer,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// チェックポイントとクラス順序を指定して読み込む
    ///
    /// クラス数とバックボーン凍結の有無がチェックポイントと一致しない場合は
    /// `ArchitectureMismatch`。
    pub fn load(checkpoint: &Path, classes: ClassSet, freeze_backbone: bool, device: B::Device) -> Result<Self> {
        let bundle = load_checkpoint(checkpoint)?;
        let stored = &bundle.metadata.architecture;

        let expected = ModelConfig {
            num_classes: classes.len(),
            freeze_backbone,
            ..stored.clone()
        };
        expected.ensure_compatible(stored)?;
        if bundle.metadata.class_names.as_slice() != classes.labels() {
            warn!(
                stored = %bundle.metadata.class_names.join(","),
                given = %classes.labels().join(","),
                "class names differ from the checkpoint"
            );
        }

        let model = expected.init::<B>(&device)?;
        let num_params = model.num_params();
        if num_params != bundle.metadata.num_params {
            return Err(ClassifierError::ArchitectureMismatch {
                details: format!(
                    "parameter count {} != {}",
                    num_params, bundle.metadata.num_params
                ),
            });
        }
        let model = model.load_bytes(bundle.model, &device)?;

        info!(
            checkpoint = %checkpoint.display(),
            epoch = bundle.metadata.epoch,
            classes = %classes.labels().join(","),
            "inference model loaded"
        );
        Ok(Self {
            model,
            classes,
            metadata: bundle.metadata,
            normalizer: ImageNormalizer::default(),
            device,
        })
    }

    /// チェックポイントに保存されたクラス順序と構成をそのまま使って読み込む
    pub fn from_checkpoint(checkpoint: &Path, device: B::Device) -> Result<Self> {
        let meta = load_metadata(checkpoint)?;
        let classes = ClassSet::new(meta.class_names)?;
        Self::load(checkpoint, classes, meta.architecture.freeze_backbone, device)
    }

    /// 生スキャンの推論で使う正規化パラメータを差し替える
    pub fn with_normalizer(mut self, normalizer: ImageNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn classes(&self) -> &ClassSet {
        &self.classes
    }

    pub fn metadata(&self) -> &CheckpointMetadata {
        &self.metadata
    }

    /// 読み込み済みの画像を分類
    pub fn predict_image(&self, img: &DynamicImage) -> Result<Prediction> {
        let data = image_to_input(img);
        let tensor = Tensor::<B, 1>::from_floats(data.as_slice(), &self.device)
            .reshape([1, 3, IMAGE_SIZE, IMAGE_SIZE]);

        let probabilities = self
            .model
            .probabilities(tensor)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| ClassifierError::Tensor(format!("{:?}", e)))?;

        let class_index = argmax_rows(&probabilities, self.classes.len())
            .first()
            .copied()
            .ok_or_else(|| ClassifierError::Tensor("empty model output".to_string()))?;
        let label = self
            .classes
            .label(class_index)
            .ok_or_else(|| ClassifierError::Tensor(format!("class index {} out of range", class_index)))?
            .to_string();
        let confidence = probabilities[class_index];

        debug!(label = %label, confidence, "prediction");
        Ok(Prediction {
            label,
            class_index,
            confidence,
            probabilities,
        })
    }

    /// 正規化済み画像ファイルを分類
    pub fn predict(&self, image_path: &Path) -> Result<Prediction> {
        let img = open_image(image_path)?;
        self.predict_image(&img)
    }

    /// 生スキャンを正規化してから分類
    pub fn predict_raw_scan(&self, image_path: &Path) -> Result<Prediction> {
        let img = open_image(image_path)?;
        let normalized = self.normalizer.normalize_dynamic(&img)?;
        self.predict_image(&DynamicImage::ImageLuma8(normalized))
    }
}

fn open_image(path: &Path) -> Result<DynamicImage> {
    if !path.exists() {
        return Err(ClassifierError::ImageFileNotFound(path.to_path_buf()));
    }
    image::open(path).map_err(|e| ClassifierError::invalid_image(format!("cannot decode {}: {}", path.display(), e)))
}
