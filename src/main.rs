//! 指紋パターン分類 CLI
#![recursion_limit = "256"]

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use burn::tensor::backend::{AutodiffBackend, Backend};
use clap::{ArgAction, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fingerprint_pattern_lib::capture::{CaptureSession, DirectoryReplaySource};
use fingerprint_pattern_lib::ml::backend::{self, cpu_device, CpuBackend, CpuTrainBackend};
use fingerprint_pattern_lib::ml::training::{adamw_optimizer, TrainingConfig, TrainingRun};
use fingerprint_pattern_lib::ml::InferenceEngine;
use fingerprint_pattern_lib::model::{AppConfig, DeviceType};
use fingerprint_pattern_lib::preprocess::{normalize_corpus, CorpusReport, ImageNormalizer};
use fingerprint_pattern_lib::types::ClassSet;

#[derive(Parser, Debug)]
#[command(name = "fingerprint_pattern", version, about = "Fingerprint ridge-pattern normalizer and classifier")]
struct Cli {
    /// 設定ファイル
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    /// ログを詳細にする（-v: debug, -vv: trace）
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 生スキャンのディレクトリを二値化して出力先に複製する
    Normalize { input: PathBuf, output: PathBuf },

    /// モデルを学習する
    Train {
        #[arg(long)]
        data_root: Option<PathBuf>,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        lr: Option<f64>,
        #[arg(long)]
        freeze_backbone: bool,
        /// 学習後のテスト評価を省略
        #[arg(long)]
        skip_test: bool,
        /// 再開するチェックポイント
        #[arg(long)]
        resume: Option<PathBuf>,
    },

    /// 1枚の画像を分類する
    Predict {
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long)]
        image: PathBuf,
        /// 入力を生スキャンとして正規化してから分類
        #[arg(long)]
        raw_scan: bool,
        /// クラス順序（省略時はチェックポイントのもの）
        #[arg(long, value_delimiter = ',')]
        classes: Option<Vec<String>>,
    },

    /// 保存済みスキャンを取り込みデータフォルダへ保存する
    Capture {
        source: PathBuf,
        #[arg(long, default_value = "captures")]
        data_dir: PathBuf,
        /// 正規化済みのコピーも保存
        #[arg(long)]
        normalize: bool,
    },

    /// デフォルト設定を書き出す
    InitConfig,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::InitConfig => {
            if cli.config.exists() {
                bail!("{} already exists", cli.config.display());
            }
            AppConfig::default()
                .save(&cli.config)
                .with_context(|| format!("failed to write {}", cli.config.display()))?;
            info!(path = %cli.config.display(), "default configuration written");
            Ok(())
        }
        Command::Normalize { input, output } => {
            let config = AppConfig::load_or_default(&cli.config);
            let normalizer = ImageNormalizer::from_settings(&config.normalizer).context("invalid normalizer settings")?;
            let report = normalize_corpus(&normalizer, &input, &output)
                .with_context(|| format!("failed to normalize {}", input.display()))?;
            println!("{}", corpus_summary(&report));
            Ok(())
        }
        Command::Capture {
            source,
            data_dir,
            normalize,
        } => {
            let config = AppConfig::load_or_default(&cli.config);
            let replay = DirectoryReplaySource::open(&source)
                .with_context(|| format!("failed to open {}", source.display()))?;
            let mut session = CaptureSession::new(replay, data_dir);
            if normalize {
                session = session.with_normalizer(ImageNormalizer::from_settings(&config.normalizer)?);
            }
            let scans = session.capture_all().context("capture failed")?;
            for scan in &scans {
                println!("{}", scan.raw_path.display());
            }
            info!(count = scans.len(), "capture finished");
            Ok(())
        }
        Command::Train {
            data_root,
            epochs,
            batch_size,
            lr,
            freeze_backbone,
            skip_test,
            resume,
        } => {
            let mut config = AppConfig::load_or_default(&cli.config);
            if let Some(root) = data_root {
                config.paths.data_root = root;
            }
            if let Some(epochs) = epochs {
                config.training.num_epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.training.batch_size = batch_size;
            }
            if let Some(lr) = lr {
                config.training.learning_rate = lr;
            }
            if freeze_backbone {
                config.model.freeze_backbone = true;
            }
            config.display();
            backend::ensure_available(config.device_type)?;

            match config.device_type {
                DeviceType::Cpu => train::<CpuTrainBackend>(&config, cpu_device(), resume.as_deref(), skip_test),
                #[cfg(feature = "wgpu")]
                DeviceType::Wgpu => train::<backend::GpuTrainBackend>(
                    &config,
                    backend::gpu_device(),
                    resume.as_deref(),
                    skip_test,
                ),
                #[cfg(not(feature = "wgpu"))]
                DeviceType::Wgpu => bail!("this build has no WGPU support"),
            }
        }
        Command::Predict {
            checkpoint,
            image,
            raw_scan,
            classes,
        } => {
            let config = AppConfig::load_or_default(&cli.config);
            backend::ensure_available(config.device_type)?;
            let normalizer = ImageNormalizer::from_settings(&config.normalizer)?;
            match config.device_type {
                DeviceType::Cpu => predict::<CpuBackend>(cpu_device(), &checkpoint, &image, raw_scan, classes, normalizer),
                #[cfg(feature = "wgpu")]
                DeviceType::Wgpu => predict::<backend::GpuBackend>(
                    backend::gpu_device(),
                    &checkpoint,
                    &image,
                    raw_scan,
                    classes,
                    normalizer,
                ),
                #[cfg(not(feature = "wgpu"))]
                DeviceType::Wgpu => bail!("this build has no WGPU support"),
            }
        }
    }
}

/// 正規化結果の要約（失敗したファイルは1行ずつ）
fn corpus_summary(report: &CorpusReport) -> String {
    let mut lines = vec![format!(
        "normalized {} of {} images",
        report.processed.len(),
        report.total()
    )];
    for (path, reason) in &report.failed {
        lines.push(format!("  skipped {}: {}", path.display(), reason));
    }
    lines.join("\n")
}

fn train<B: AutodiffBackend>(
    config: &AppConfig,
    device: B::Device,
    resume: Option<&Path>,
    skip_test: bool,
) -> Result<()> {
    let training_config = TrainingConfig::from_app_config(config);
    let optim = adamw_optimizer::<B>(config.training.weight_decay);

    let run = match resume {
        Some(checkpoint) => TrainingRun::resume(training_config, device, optim, checkpoint)
            .with_context(|| format!("failed to resume from {}", checkpoint.display()))?,
        None => TrainingRun::open(training_config, device, optim).context("failed to start training")?,
    };
    let mut run = run.on_epoch(|summary| {
        let marker = if summary.is_best { " *" } else { "" };
        println!(
            "Epoch {}/{}: loss {:.4} acc {:.2}% | val loss {:.4} acc {:.2}%{}",
            summary.record.epoch,
            summary.num_epochs,
            summary.record.train_loss,
            summary.record.train_acc,
            summary.record.val_loss,
            summary.record.val_acc,
            marker
        );
    });

    run.fit().context("training failed")?;
    println!("best checkpoint: {}", run.paths().best_checkpoint.display());
    println!("final checkpoint: {}", run.paths().final_checkpoint.display());

    if skip_test {
        return Ok(());
    }
    let report = run.test().context("test evaluation failed")?;
    println!("Test accuracy: {:.2}% (best epoch {})", report.accuracy, report.checkpoint_epoch);
    for class in &report.per_class {
        println!("  {:<12} {:>6.2}% ({}/{})", class.label, class.accuracy, class.correct, class.total);
    }
    Ok(())
}

fn predict<B: Backend>(
    device: B::Device,
    checkpoint: &Path,
    image: &Path,
    raw_scan: bool,
    classes: Option<Vec<String>>,
    normalizer: ImageNormalizer,
) -> Result<()> {
    let engine = match classes {
        Some(labels) => {
            let freeze = fingerprint_pattern_lib::model::load_metadata(checkpoint)
                .with_context(|| format!("failed to read {}", checkpoint.display()))?
                .architecture
                .freeze_backbone;
            let classes = ClassSet::new(labels)?;
            InferenceEngine::<B>::load(checkpoint, classes, freeze, device)?
        }
        None => InferenceEngine::<B>::from_checkpoint(checkpoint, device)?,
    };
    let engine = engine.with_normalizer(normalizer);

    let prediction = if raw_scan {
        engine.predict_raw_scan(image)
    } else {
        engine.predict(image)
    }
    .with_context(|| format!("failed to classify {}", image.display()))?;

    println!("{} ({:.2}%)", prediction.label, prediction.confidence * 100.0);
    for (label, p) in engine.classes().labels().iter().zip(&prediction.probabilities) {
        println!("  {:<12} {:.4}", label, p);
    }
    Ok(())
}
