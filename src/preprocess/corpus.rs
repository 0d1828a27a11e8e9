//! ディレクトリ単位の一括正規化
//!
//! 入力ルート以下を再帰的に走査し、画像ファイルを正規化して
//! 出力ルートに同じ相対パスで書き出します。

use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{info, warn};

use crate::error::{ClassifierError, Result};
use crate::preprocess::normalizer::ImageNormalizer;

/// 正規化対象の拡張子（小文字）
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// 一括正規化の結果
#[derive(Debug, Default)]
pub struct CorpusReport {
    /// 書き出したファイル（出力側のパス）
    pub processed: Vec<PathBuf>,
    /// 失敗したファイルとエラー内容
    pub failed: Vec<(PathBuf, String)>,
}

impl CorpusReport {
    pub fn total(&self) -> usize {
        self.processed.len() + self.failed.len()
    }
}

/// 拡張子が対象画像かどうか
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// ルート以下の画像ファイルを再帰的に列挙（ソート済み）
pub fn collect_images(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if is_image_file(&path) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// `input` 以下の全画像を正規化して `output` 以下にミラーリングする
///
/// 個々のファイルの失敗はログに出してレポートに記録し、処理は継続する。
pub fn normalize_corpus(
    normalizer: &ImageNormalizer,
    input: &Path,
    output: &Path,
) -> Result<CorpusReport> {
    if !input.is_dir() {
        return Err(ClassifierError::Config(format!(
            "input directory does not exist: {}",
            input.display()
        )));
    }

    let files = collect_images(input)?;
    info!(count = files.len(), input = %input.display(), output = %output.display(), "normalizing corpus");

    let results: Vec<(PathBuf, Result<PathBuf>)> = files
        .par_iter()
        .map(|src| {
            let result = normalize_one(normalizer, input, output, src);
            (src.clone(), result)
        })
        .collect();

    let mut report = CorpusReport::default();
    for (src, result) in results {
        match result {
            Ok(dst) => report.processed.push(dst),
            Err(e) => {
                warn!(path = %src.display(), error = %e, "skipping image");
                report.failed.push((src, e.to_string()));
            }
        }
    }

    info!(
        processed = report.processed.len(),
        failed = report.failed.len(),
        "corpus normalization finished"
    );
    Ok(report)
}

fn normalize_one(
    normalizer: &ImageNormalizer,
    input: &Path,
    output: &Path,
    src: &Path,
) -> Result<PathBuf> {
    let relative = src
        .strip_prefix(input)
        .map_err(|e| ClassifierError::Config(format!("{}: {}", src.display(), e)))?;
    let dst = output.join(relative);
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    let normalized = normalizer.normalize_file(src)?;
    normalized
        .save(&dst)
        .map_err(|e| ClassifierError::invalid_image(format!("cannot write {}: {}", dst.display(), e)))?;
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    fn write_scan(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let img = GrayImage::from_fn(32, 32, |x, y| image::Luma([((x * 8 + y * 3) % 256) as u8]));
        img.save(path).unwrap();
    }

    #[test]
    fn test_mirrors_relative_paths() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_scan(&input.path().join("train_set/Arch/a1.png"));
        write_scan(&input.path().join("train_set/Whorl/w1.png"));
        fs::write(input.path().join("train_set/readme.txt"), "skip").unwrap();

        let report = normalize_corpus(&ImageNormalizer::default(), input.path(), output.path()).unwrap();

        assert_eq!(report.processed.len(), 2);
        assert!(report.failed.is_empty());
        let out = image::open(output.path().join("train_set/Arch/a1.png")).unwrap().to_luma8();
        assert_eq!(out.dimensions(), (32, 32));
        assert!(out.iter().all(|&p| p == 0 || p == 255));
        assert!(output.path().join("train_set/Whorl/w1.png").exists());
        assert!(!output.path().join("train_set/readme.txt").exists());
    }

    #[test]
    fn test_broken_file_is_reported_not_fatal() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_scan(&input.path().join("Loop/good.png"));
        fs::write(input.path().join("Loop/bad.png"), b"garbage").unwrap();

        let report = normalize_corpus(&ImageNormalizer::default(), input.path(), output.path()).unwrap();

        assert_eq!(report.processed.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.total(), 2);
        assert!(report.failed[0].0.ends_with("bad.png"));
    }

    #[test]
    fn test_extension_filter_is_case_insensitive() {
        assert!(is_image_file(Path::new("scan.PNG")));
        assert!(is_image_file(Path::new("scan.tiff")));
        assert!(!is_image_file(Path::new("scan.gif")));
        assert!(!is_image_file(Path::new("scan")));
    }
}
