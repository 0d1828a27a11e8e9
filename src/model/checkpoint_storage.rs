//! チェックポイントの永続化
//!
//! Tar.gz形式でメタデータ、モデル重み、オプティマイザ状態を1ファイルに
//! まとめて保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（エポック、精度、モデル構成など）
//! - model.bin       - モデルの重み（バイナリ）
//! - optimizer.bin   - オプティマイザ状態（バイナリ）
//!
//! 書き込みは同じディレクトリの一時ファイルに行ってから rename するため、
//! 中断しても既存のファイルが壊れることはありません。

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};
use tracing::debug;

use crate::error::{ClassifierError, Result};
use crate::model::checkpoint_metadata::CheckpointMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";
const OPTIMIZER_ENTRY: &str = "optimizer.bin";

/// 読み込んだチェックポイント一式
#[derive(Debug)]
pub struct CheckpointBundle {
    pub metadata: CheckpointMetadata,
    pub model: Vec<u8>,
    pub optimizer: Option<Vec<u8>>,
}

/// 一時ファイル経由でアトミックに書き込む
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ClassifierError::Config(format!("invalid output path: {}", path.display())))?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name));

    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn append_entry<W: Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, data)?;
    Ok(())
}

/// チェックポイントを保存
pub fn save_checkpoint(
    path: &Path,
    metadata: &CheckpointMetadata,
    model_binary: &[u8],
    optimizer_binary: Option<&[u8]>,
) -> Result<()> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);

    let json = metadata.to_json_string()?;
    append_entry(&mut builder, METADATA_ENTRY, json.as_bytes())?;
    append_entry(&mut builder, MODEL_ENTRY, model_binary)?;
    if let Some(optimizer) = optimizer_binary {
        append_entry(&mut builder, OPTIMIZER_ENTRY, optimizer)?;
    }

    let encoder = builder.into_inner()?;
    let bytes = encoder.finish()?;
    write_atomic(path, &bytes)?;

    debug!(path = %path.display(), bytes = bytes.len(), kind = %metadata.kind, "checkpoint written");
    Ok(())
}

fn open_archive(path: &Path) -> Result<Archive<GzDecoder<File>>> {
    if !path.exists() {
        return Err(ClassifierError::ModelFileNotFound(path.to_path_buf()));
    }
    let file = File::open(path)?;
    Ok(Archive::new(GzDecoder::new(file)))
}

fn read_entries(path: &Path, wanted: &[&str]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive = open_archive(path)?;
    let mut found = Vec::new();
    let entries = archive
        .entries()
        .map_err(|e| ClassifierError::checkpoint_format(path, e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| ClassifierError::checkpoint_format(path, e.to_string()))?;
        let name = entry
            .path()
            .map_err(|e| ClassifierError::checkpoint_format(path, e.to_string()))?
            .to_string_lossy()
            .to_string();
        if wanted.contains(&name.as_str()) {
            let mut buffer = Vec::new();
            entry
                .read_to_end(&mut buffer)
                .map_err(|e| ClassifierError::checkpoint_format(path, e.to_string()))?;
            found.push((name, buffer));
        }
    }
    Ok(found)
}

fn take_entry(entries: &mut Vec<(String, Vec<u8>)>, name: &str) -> Option<Vec<u8>> {
    let pos = entries.iter().position(|(n, _)| n == name)?;
    Some(entries.swap_remove(pos).1)
}

fn parse_metadata(path: &Path, bytes: Vec<u8>) -> Result<CheckpointMetadata> {
    let json = String::from_utf8(bytes)
        .map_err(|_| ClassifierError::checkpoint_format(path, "metadata.json is not UTF-8"))?;
    CheckpointMetadata::from_json_string(&json)
        .map_err(|e| ClassifierError::checkpoint_format(path, e.to_string()))
}

/// メタデータのみ読み込む
pub fn load_metadata(path: &Path) -> Result<CheckpointMetadata> {
    let mut entries = read_entries(path, &[METADATA_ENTRY])?;
    let bytes = take_entry(&mut entries, METADATA_ENTRY)
        .ok_or_else(|| ClassifierError::checkpoint_format(path, "metadata.json not found"))?;
    parse_metadata(path, bytes)
}

/// メタデータ、モデル重み、オプティマイザ状態をまとめて読み込む
pub fn load_checkpoint(path: &Path) -> Result<CheckpointBundle> {
    let mut entries = read_entries(path, &[METADATA_ENTRY, MODEL_ENTRY, OPTIMIZER_ENTRY])?;
    let metadata = take_entry(&mut entries, METADATA_ENTRY)
        .ok_or_else(|| ClassifierError::checkpoint_format(path, "metadata.json not found"))?;
    let model = take_entry(&mut entries, MODEL_ENTRY)
        .ok_or_else(|| ClassifierError::checkpoint_format(path, "model.bin not found"))?;
    let optimizer = take_entry(&mut entries, OPTIMIZER_ENTRY);

    Ok(CheckpointBundle {
        metadata: parse_metadata(path, metadata)?,
        model,
        optimizer,
    })
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &CheckpointMetadata) {
    println!("\n=== チェックポイント ===");
    println!("種類: {}", metadata.kind);
    println!("ランID: {}", metadata.run_id);
    println!("エポック: {}", metadata.epoch);
    println!("検証精度: {:.2}%", metadata.val_accuracy);
    println!("学習精度: {:.2}%", metadata.train_accuracy);
    if let Some(best) = metadata.best_val_acc {
        println!("最高検証精度: {:.2}%", best);
    }
    println!("学習率: {:e}", metadata.learning_rate);
    println!("クラス ({}): {}", metadata.class_names.len(), metadata.class_names.join(", "));
    println!(
        "構成: embed_dim={} hidden={} reduction={} frozen={}",
        metadata.architecture.embed_dim,
        metadata.architecture.hidden_dim,
        metadata.architecture.attention_reduction,
        metadata.architecture.freeze_backbone
    );
    println!("パラメータ数: {}", metadata.num_params);
    println!("作成日時: {}", metadata.created_at);
    println!("========================");
}
