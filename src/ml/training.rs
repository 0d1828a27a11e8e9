//! モデル学習
//!
//! [`TrainingRun`] が1回の学習ランの状態をすべて保持します。
//!
//! ```text
//! Idle -> Epoch(n){Train -> Validate -> ScheduleStep -> CheckpointDecision -> MetricsPersist} -> Completed -> (Test)
//! ```
//!
//! 出力:
//! - `<weights_dir>/best_model_<run_id>.tar.gz`  検証精度が更新されるたびに上書き
//! - `<weights_dir>/final_model_<run_id>.tar.gz` 学習終了時に1回
//! - `<logs_dir>/run_<run_id>/training_metrics.json` と `history.csv`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::{
    data::dataset::Dataset,
    module::{AutodiffModule, Module},
    nn::loss::CrossEntropyLossConfig,
    optim::{AdamWConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use tracing::{debug, info, warn};

use crate::error::{ClassifierError, Result};
use crate::ml::dataset::{FingerprintBatcher, FingerprintDataset, SplitLoader};
use crate::ml::ml_model::{argmax_rows, ModelConfig, PatternClassifier};
use crate::model::checkpoint_metadata::{CheckpointKind, CheckpointMetadata};
use crate::model::checkpoint_storage::{load_checkpoint, save_checkpoint};
use crate::model::config::{AppConfig, ModelSettings, PathSettings, TrainingSettings};
use crate::model::metrics_log::{ClassAccuracy, EpochRecord, TrainingMetrics};
use crate::types::{ClassSet, Split};

/// 学習ランの設定
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub model: ModelSettings,
    pub training: TrainingSettings,
    pub paths: PathSettings,
    /// 未指定なら開始時刻から生成
    pub run_id: Option<String>,
}

impl TrainingConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            model: config.model.clone(),
            training: config.training.clone(),
            paths: config.paths.clone(),
            run_id: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.training.num_epochs == 0 {
            return Err(ClassifierError::Config("num_epochs must be at least 1".to_string()));
        }
        if self.training.batch_size == 0 {
            return Err(ClassifierError::Config("batch_size must be at least 1".to_string()));
        }
        if !self.training.learning_rate.is_finite() || self.training.learning_rate <= 0.0 {
            return Err(ClassifierError::Config(format!(
                "learning rate must be positive, got {}",
                self.training.learning_rate
            )));
        }
        Ok(())
    }

    /// 完了エポック数に対応する学習率（ステップ減衰）
    pub fn learning_rate_at(&self, completed_epochs: usize) -> f64 {
        let t = &self.training;
        if t.lr_step_size == 0 {
            return t.learning_rate;
        }
        let steps = (completed_epochs / t.lr_step_size) as i32;
        t.learning_rate * t.lr_gamma.powi(steps)
    }
}

/// AdamW オプティマイザを作成
pub fn adamw_optimizer<B: AutodiffBackend>(
    weight_decay: f32,
) -> impl Optimizer<PatternClassifier<B>, B> {
    AdamWConfig::new()
        .with_weight_decay(weight_decay)
        .init::<B, PatternClassifier<B>>()
}

/// ランの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Training { epoch: usize },
    /// エポック途中で中断した（モデルとオプティマイザ状態が揃っていない）
    Failed { epoch: usize },
    Completed,
}

/// ランの出力先
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub best_checkpoint: PathBuf,
    pub final_checkpoint: PathBuf,
}

impl RunPaths {
    pub fn new(paths: &PathSettings, run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            run_dir: paths.logs_dir.join(format!("run_{}", run_id)),
            best_checkpoint: paths
                .weights_dir
                .join(format!("{}_{}.tar.gz", CheckpointKind::Best.file_prefix(), run_id)),
            final_checkpoint: paths
                .weights_dir
                .join(format!("{}_{}.tar.gz", CheckpointKind::Final.file_prefix(), run_id)),
        }
    }

    pub fn metrics_file(&self) -> PathBuf {
        TrainingMetrics::metrics_path(&self.run_dir)
    }
}

/// 1フェーズ分の集計
#[derive(Debug, Clone, Default)]
pub struct PhaseStats {
    /// バッチ損失の平均
    pub loss: f64,
    /// パーセント
    pub accuracy: f64,
    pub correct: usize,
    pub total: usize,
    pub batches: usize,
    /// (正解, 予測) の組
    pub predictions: Vec<(usize, usize)>,
}

impl PhaseStats {
    fn add_batch(&mut self, loss: f64, labels: &[usize], predicted: &[usize]) {
        self.loss += loss;
        self.batches += 1;
        for (&label, &pred) in labels.iter().zip(predicted) {
            self.total += 1;
            if label == pred {
                self.correct += 1;
            }
            self.predictions.push((label, pred));
        }
    }

    fn finish(mut self, split: Split, dir: &Path) -> Result<Self> {
        if self.total == 0 {
            return Err(ClassifierError::DatasetEmpty {
                split,
                dir: dir.to_path_buf(),
            });
        }
        self.loss /= self.batches as f64;
        self.accuracy = 100.0 * self.correct as f64 / self.total as f64;
        Ok(self)
    }

    /// クラス別の正解率（サンプルのあるクラスのみ）
    pub fn per_class(&self, classes: &ClassSet) -> Vec<ClassAccuracy> {
        let mut correct = vec![0usize; classes.len()];
        let mut total = vec![0usize; classes.len()];
        for &(label, pred) in &self.predictions {
            if label < total.len() {
                total[label] += 1;
                if label == pred {
                    correct[label] += 1;
                }
            }
        }
        classes
            .labels()
            .iter()
            .enumerate()
            .filter(|(i, _)| total[*i] > 0)
            .map(|(i, label)| ClassAccuracy {
                label: label.clone(),
                correct: correct[i],
                total: total[i],
                accuracy: 100.0 * correct[i] as f64 / total[i] as f64,
            })
            .collect()
    }
}

/// エポック終了時の通知内容
#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub record: EpochRecord,
    pub num_epochs: usize,
    pub is_best: bool,
}

/// テスト結果
#[derive(Debug, Clone)]
pub struct TestReport {
    /// パーセント
    pub accuracy: f64,
    pub per_class: Vec<ClassAccuracy>,
    /// 評価に使ったベストチェックポイントのエポック
    pub checkpoint_epoch: usize,
}

type EpochObserver = Box<dyn FnMut(&EpochSummary) + Send>;

/// ロジットから予測クラスを取り出す
fn predicted_classes<B: Backend>(logits: Tensor<B, 2>) -> Result<Vec<usize>> {
    let [_, num_classes] = logits.dims();
    let values = logits
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| ClassifierError::Tensor(format!("{:?}", e)))?;
    Ok(argmax_rows(&values, num_classes))
}

/// 勾配なしで1分割を評価
fn evaluate<B: Backend>(
    model: &PatternClassifier<B>,
    loader: &SplitLoader<B>,
    device: &B::Device,
    epoch: usize,
) -> Result<PhaseStats> {
    let split = loader.dataset().split();
    let phase = match split {
        Split::Train => "train",
        Split::Val => "val",
        Split::Test => "test",
    };
    let loss_fn = CrossEntropyLossConfig::new().init(device);
    let mut stats = PhaseStats::default();

    for (batch_idx, batch) in loader.iter(epoch).enumerate() {
        let logits = model.forward(batch.images);
        let loss = loss_fn.forward(logits.clone(), batch.targets);
        let loss_value: f64 = loss.into_scalar().elem();
        if !loss_value.is_finite() {
            return Err(ClassifierError::NumericInstability {
                phase,
                epoch,
                batch: batch_idx,
                loss: loss_value,
            });
        }
        let predicted = predicted_classes(logits)?;
        stats.add_batch(loss_value, &batch.labels, &predicted);
    }

    stats.finish(split, loader.dataset().dir())
}

fn record_optimizer<B, O>(optim: &O) -> Result<Vec<u8>>
where
    B: AutodiffBackend,
    O: Optimizer<PatternClassifier<B>, B>,
{
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    Ok(Recorder::<B>::record(&recorder, optim.to_record(), ())?)
}

/// 1回の学習ラン
pub struct TrainingRun<B: AutodiffBackend, O> {
    config: TrainingConfig,
    paths: RunPaths,
    device: B::Device,
    classes: ClassSet,
    model_config: ModelConfig,
    model: PatternClassifier<B>,
    optim: O,
    batcher: FingerprintBatcher,
    train_loader: SplitLoader<B>,
    val_loader: SplitLoader<B::InnerBackend>,
    metrics: TrainingMetrics,
    state: RunState,
    best_val_acc: Option<f64>,
    completed_epochs: usize,
    learning_rate: f64,
    last_train_acc: Option<f64>,
    observer: Option<EpochObserver>,
}

impl<B, O> TrainingRun<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<PatternClassifier<B>, B>,
{
    /// ランを開始する（ディレクトリ作成、データ読み込み、モデル初期化）
    pub fn open(config: TrainingConfig, device: B::Device, optim: O) -> Result<Self> {
        config.validate()?;
        let t = &config.training;
        B::seed(&device, t.seed);

        let train = FingerprintDataset::open_train(&config.paths.data_root)?;
        let classes = train.classes().clone();
        let val = FingerprintDataset::open(&config.paths.data_root, Split::Val, &classes)?;

        let model_config = ModelConfig::new(classes.len())
            .with_embed_dim(config.model.embed_dim)
            .with_freeze_backbone(config.model.freeze_backbone)
            .with_attention_reduction(config.model.attention_reduction)
            .with_hidden_dim(config.model.hidden_dim)
            .with_dropout(config.model.dropout);
        let mut model = model_config.init::<B>(&device)?;
        if let Some(ref pretrained) = config.model.pretrained_backbone {
            model = model
                .load_pretrained_backbone(pretrained, &device)?
                .with_frozen_backbone(model_config.freeze_backbone);
        }

        let batcher = FingerprintBatcher::new(t.decode_threads)?;
        let train_loader = SplitLoader::new(
            Arc::new(train),
            batcher.clone(),
            t.batch_size,
            t.seed,
            device.clone(),
        );
        let val_loader = SplitLoader::new(
            Arc::new(val),
            batcher.clone(),
            t.batch_size,
            t.seed,
            device.clone(),
        );

        let run_id = config
            .run_id
            .clone()
            .unwrap_or_else(|| chrono::Local::now().format("%Y%m%d_%H%M%S").to_string());
        let paths = RunPaths::new(&config.paths, &run_id);
        std::fs::create_dir_all(&config.paths.weights_dir)?;
        std::fs::create_dir_all(&paths.run_dir)?;

        info!(
            run_id = %run_id,
            classes = %classes.labels().join(","),
            train = train_loader.dataset().len(),
            val = val_loader.dataset().len(),
            "training run opened"
        );
        info!(weights = %config.paths.weights_dir.display(), logs = %paths.run_dir.display(), "output directories");

        let learning_rate = config.learning_rate_at(0);
        Ok(Self {
            config,
            paths,
            device,
            classes,
            model_config,
            model,
            optim,
            batcher,
            train_loader,
            val_loader,
            metrics: TrainingMetrics::default(),
            state: RunState::Idle,
            best_val_acc: None,
            completed_epochs: 0,
            learning_rate,
            last_train_acc: None,
            observer: None,
        })
    }

    /// チェックポイントから学習を再開する
    ///
    /// ランIDはチェックポイントのものを引き継ぎ、既存のメトリクスログは
    /// チェックポイントのエポックまで切り詰める。
    pub fn resume(mut config: TrainingConfig, device: B::Device, optim: O, checkpoint: &Path) -> Result<Self> {
        let bundle = load_checkpoint(checkpoint)?;
        let meta = bundle.metadata;
        config.run_id = Some(meta.run_id.clone());

        let mut run = Self::open(config, device, optim)?;
        if run.classes.labels() != meta.class_names.as_slice() {
            return Err(ClassifierError::ClassSetMismatch {
                split: Split::Train,
                expected: meta.class_names.clone(),
                found: run.classes.labels().to_vec(),
            });
        }
        run.model_config.ensure_compatible(&meta.architecture)?;

        run.model = run
            .model
            .load_bytes(bundle.model, &run.device)?
            .with_frozen_backbone(run.model_config.freeze_backbone);
        match bundle.optimizer {
            Some(bytes) => {
                let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
                let record = Recorder::<B>::load(&recorder, bytes, &run.device)?;
                run.optim = run.optim.load_record(record);
            }
            None => warn!(path = %checkpoint.display(), "checkpoint has no optimizer state; starting fresh moments"),
        }

        let metrics_file = run.paths.metrics_file();
        if metrics_file.exists() {
            let mut metrics = TrainingMetrics::load(&metrics_file)?;
            metrics.truncate(meta.epoch);
            run.metrics = metrics;
        }
        run.completed_epochs = meta.epoch;
        run.best_val_acc = Some(run.metrics.best_val_acc().unwrap_or(meta.best_so_far()));
        run.learning_rate = run.config.learning_rate_at(meta.epoch);
        run.last_train_acc = Some(meta.train_accuracy);

        info!(
            checkpoint = %checkpoint.display(),
            epoch = meta.epoch,
            best = run.best_val_acc.unwrap_or_default(),
            "resuming training run"
        );
        Ok(run)
    }

    /// エポック終了ごとに呼ばれるコールバックを登録
    pub fn on_epoch(mut self, observer: impl FnMut(&EpochSummary) + Send + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn run_id(&self) -> &str {
        &self.paths.run_id
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    pub fn classes(&self) -> &ClassSet {
        &self.classes
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    pub fn model(&self) -> &PatternClassifier<B> {
        &self.model
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn best_val_acc(&self) -> Option<f64> {
        self.best_val_acc
    }

    pub fn completed_epochs(&self) -> usize {
        self.completed_epochs
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// 設定エポック数まで学習し、final チェックポイントを書いて終了する
    pub fn fit(&mut self) -> Result<&TrainingMetrics> {
        let num_epochs = self.config.training.num_epochs;
        info!(run_id = %self.paths.run_id, from = self.completed_epochs + 1, to = num_epochs, "starting training");

        while self.completed_epochs < num_epochs {
            self.run_epoch()?;
        }
        self.close()?;

        match self.best_val_acc {
            Some(best) => info!(best_val_acc = best, best_epoch = self.metrics.best_epoch, "training completed"),
            None => info!("training completed"),
        }
        Ok(&self.metrics)
    }

    /// 1エポック分の学習・検証・記録を行う
    ///
    /// 途中で失敗したランは `Failed` になり、以降のエポックと final の書き込みを拒否する。
    pub fn run_epoch(&mut self) -> Result<EpochSummary> {
        match self.state {
            RunState::Completed => {
                return Err(ClassifierError::Config("training run is already closed".to_string()));
            }
            RunState::Failed { epoch } => {
                return Err(ClassifierError::Config(format!("training run aborted in epoch {}", epoch)));
            }
            _ => {}
        }
        let epoch = self.completed_epochs + 1;
        self.state = RunState::Training { epoch };
        let result = self.epoch_steps(epoch);
        if result.is_err() {
            self.state = RunState::Failed { epoch };
        }
        result
    }

    fn epoch_steps(&mut self, epoch: usize) -> Result<EpochSummary> {
        let lr = self.learning_rate;

        let train = self.train_phase(epoch)?;
        let val = self.validate_phase(epoch)?;
        self.schedule_step(epoch);

        let record = EpochRecord {
            epoch,
            train_loss: train.loss,
            train_acc: train.accuracy,
            val_loss: val.loss,
            val_acc: val.accuracy,
            learning_rate: lr,
        };
        self.metrics.push(record);
        self.last_train_acc = Some(train.accuracy);

        info!(
            epoch,
            train_loss = format_args!("{:.4}", train.loss),
            train_acc = format_args!("{:.2}%", train.accuracy),
            val_loss = format_args!("{:.4}", val.loss),
            val_acc = format_args!("{:.2}%", val.accuracy),
            lr = format_args!("{:.6}", lr),
            "epoch finished"
        );

        let is_best = self.checkpoint_decision(epoch, &train, &val)?;
        self.persist_metrics()?;

        let summary = EpochSummary {
            record,
            num_epochs: self.config.training.num_epochs,
            is_best,
        };
        if let Some(observer) = self.observer.as_mut() {
            observer(&summary);
        }
        Ok(summary)
    }

    /// 学習フェーズ: 順伝播、交差エントロピー、逆伝播、AdamW 更新
    fn train_phase(&mut self, epoch: usize) -> Result<PhaseStats> {
        let loss_fn = CrossEntropyLossConfig::new().init(&self.device);
        let mut model = self.model.clone();
        let mut stats = PhaseStats::default();
        let num_batches = self.train_loader.num_batches();

        for (batch_idx, batch) in self.train_loader.iter(epoch).enumerate() {
            let logits = model.forward(batch.images);
            let loss = loss_fn.forward(logits.clone(), batch.targets);
            let loss_value: f64 = loss.clone().into_scalar().elem();
            if !loss_value.is_finite() {
                return Err(ClassifierError::NumericInstability {
                    phase: "train",
                    epoch,
                    batch: batch_idx,
                    loss: loss_value,
                });
            }

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = self.optim.step(self.learning_rate, model, grads);

            let predicted = predicted_classes(logits)?;
            stats.add_batch(loss_value, &batch.labels, &predicted);
            debug!(epoch, batch = batch_idx + 1, num_batches, loss = loss_value, "train batch");
        }

        self.model = model;
        stats.finish(Split::Train, self.train_loader.dataset().dir())
    }

    /// 検証フェーズ: 勾配・ドロップアウトなしで評価
    fn validate_phase(&self, epoch: usize) -> Result<PhaseStats> {
        let model = self.model.valid();
        evaluate(&model, &self.val_loader, &self.device, epoch)
    }

    /// 学習率のステップ減衰
    fn schedule_step(&mut self, epoch: usize) {
        self.completed_epochs = epoch;
        let next = self.config.learning_rate_at(epoch);
        if next != self.learning_rate {
            info!(from = self.learning_rate, to = next, "learning rate decayed");
        }
        self.learning_rate = next;
    }

    /// 検証精度が厳密に更新された場合のみ best を書く
    fn checkpoint_decision(&mut self, epoch: usize, train: &PhaseStats, val: &PhaseStats) -> Result<bool> {
        let improved = match self.best_val_acc {
            None => true,
            Some(best) => val.accuracy > best,
        };
        if !improved {
            return Ok(false);
        }

        self.best_val_acc = Some(val.accuracy);
        self.metrics.best_epoch = epoch;
        let path = self.paths.best_checkpoint.clone();
        self.write_checkpoint(&path, CheckpointKind::Best, val.accuracy, train.accuracy, None, None)?;
        info!(epoch, val_acc = format_args!("{:.2}%", val.accuracy), path = %path.display(), "new best model saved");
        Ok(true)
    }

    fn persist_metrics(&self) -> Result<()> {
        self.metrics.save(&self.paths.run_dir)
    }

    fn write_checkpoint(
        &self,
        path: &Path,
        kind: CheckpointKind,
        val_accuracy: f64,
        train_accuracy: f64,
        final_val_acc: Option<f64>,
        best_val_acc: Option<f64>,
    ) -> Result<()> {
        let metadata = CheckpointMetadata {
            kind,
            run_id: self.paths.run_id.clone(),
            epoch: self.completed_epochs,
            val_accuracy,
            train_accuracy,
            final_val_acc,
            best_val_acc,
            learning_rate: self.metrics.learning_rates.last().copied().unwrap_or(self.learning_rate),
            architecture: self.model_config.clone(),
            num_params: self.model.num_params(),
            class_names: self.classes.labels().to_vec(),
            created_at: chrono::Local::now().to_rfc3339(),
        };
        let model_bytes = self.model.to_bytes()?;
        let optim_bytes = record_optimizer::<B, O>(&self.optim)?;
        save_checkpoint(path, &metadata, &model_bytes, Some(&optim_bytes))
    }

    /// final チェックポイントを書いてランを閉じる
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            RunState::Completed => return Ok(()),
            RunState::Failed { epoch } => {
                return Err(ClassifierError::Config(format!(
                    "training run aborted in epoch {}; final checkpoint not written",
                    epoch
                )));
            }
            _ => {}
        }
        let final_val = self.metrics.val_acc.last().copied().unwrap_or(0.0);
        let train_acc = self.last_train_acc.unwrap_or(0.0);
        let path = self.paths.final_checkpoint.clone();
        self.write_checkpoint(
            &path,
            CheckpointKind::Final,
            final_val,
            train_acc,
            Some(final_val),
            self.best_val_acc,
        )?;
        self.state = RunState::Completed;
        info!(path = %path.display(), "final model saved");
        Ok(())
    }

    /// best チェックポイントを読み込み直してテスト分割を評価する
    pub fn test(&mut self) -> Result<TestReport> {
        let best_path = &self.paths.best_checkpoint;
        if self.best_val_acc.is_none() || !best_path.exists() {
            return Err(ClassifierError::MissingBestCheckpoint);
        }
        let bundle = load_checkpoint(best_path)?;
        self.model_config.ensure_compatible(&bundle.metadata.architecture)?;

        let model = self
            .model_config
            .init::<B::InnerBackend>(&self.device)?
            .load_bytes(bundle.model, &self.device)?;
        info!(epoch = bundle.metadata.epoch, "testing with best model");

        let dataset = FingerprintDataset::open(&self.config.paths.data_root, Split::Test, &self.classes)?;
        let loader = SplitLoader::<B::InnerBackend>::new(
            Arc::new(dataset),
            self.batcher.clone(),
            self.config.training.batch_size,
            self.config.training.seed,
            self.device.clone(),
        );
        let stats = evaluate(&model, &loader, &self.device, bundle.metadata.epoch)?;
        let per_class = stats.per_class(&self.classes);

        info!(accuracy = format_args!("{:.2}%", stats.accuracy), "test finished");
        for class in &per_class {
            info!(
                class = %class.label,
                accuracy = format_args!("{:.2}%", class.accuracy),
                correct = class.correct,
                total = class.total,
                "class accuracy"
            );
        }

        self.metrics.test_acc = Some(stats.accuracy);
        self.metrics.test_per_class = per_class.clone();
        self.persist_metrics()?;

        Ok(TestReport {
            accuracy: stats.accuracy,
            per_class,
            checkpoint_epoch: bundle.metadata.epoch,
        })
    }
}
