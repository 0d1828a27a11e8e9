//! スキャナ入力のインターフェース
//!
//! ハードウェアドライバは [`FrameSource`] としてのみ扱います。取得したフレームは
//! [`CaptureSession`] がデータフォルダへPNGで保存し、保存先パスを返します。

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use image::GrayImage;
use tracing::{debug, info};

use crate::error::{ClassifierError, Result};
use crate::preprocess::corpus::collect_images;
use crate::preprocess::normalizer::ImageNormalizer;

/// スキャナから受け取る生のグレースケールフレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayFrame {
    pub width: u32,
    pub height: u32,
    /// 行優先の 8bit 画素（長さは `width * height`）
    pub pixels: Vec<u8>,
}

impl GrayFrame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(ClassifierError::invalid_image(format!(
                "frame has zero area ({}x{})",
                width, height
            )));
        }
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(ClassifierError::invalid_image(format!(
                "frame buffer holds {} bytes, expected {}",
                pixels.len(),
                expected
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn to_image(&self) -> Result<GrayImage> {
        GrayImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| ClassifierError::invalid_image("frame buffer size mismatch"))
    }

    pub fn from_image(img: &GrayImage) -> Result<Self> {
        Self::new(img.width(), img.height(), img.as_raw().clone())
    }
}

/// グレースケールフレームを1枚ずつ返す入力源
pub trait FrameSource {
    /// 次のフレームを取得する（`None` は入力の終端）
    fn capture(&mut self) -> Result<Option<GrayFrame>>;

    /// ログ表示用の名前
    fn name(&self) -> &str {
        "scanner"
    }
}

/// 保存済み画像ファイルを順番に再生する入力源
pub struct DirectoryReplaySource {
    name: String,
    queue: VecDeque<PathBuf>,
}

impl DirectoryReplaySource {
    pub fn open(dir: &Path) -> Result<Self> {
        let files = collect_images(dir)?;
        info!(dir = %dir.display(), frames = files.len(), "replay source opened");
        Ok(Self {
            name: format!("replay:{}", dir.display()),
            queue: files.into(),
        })
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

impl FrameSource for DirectoryReplaySource {
    fn capture(&mut self) -> Result<Option<GrayFrame>> {
        let Some(path) = self.queue.pop_front() else {
            return Ok(None);
        };
        debug!(path = %path.display(), "replaying frame");
        let img = image::open(&path)
            .map_err(|e| ClassifierError::ImageDecode { path, source: e })?
            .to_luma8();
        GrayFrame::from_image(&img).map(Some)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 取得したフレームの保存先
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedScan {
    pub raw_path: PathBuf,
    pub normalized_path: Option<PathBuf>,
}

/// フレームをデータフォルダへ保存するセッション
pub struct CaptureSession<S: FrameSource> {
    source: S,
    data_dir: PathBuf,
    normalizer: Option<ImageNormalizer>,
    captured: usize,
}

impl<S: FrameSource> CaptureSession<S> {
    pub fn new(source: S, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            data_dir: data_dir.into(),
            normalizer: None,
            captured: 0,
        }
    }

    /// 保存時に正規化済みのコピーも `normalized/` に書き出す
    pub fn with_normalizer(mut self, normalizer: ImageNormalizer) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn captured(&self) -> usize {
        self.captured
    }

    /// 1フレーム取得して保存する
    pub fn capture_next(&mut self) -> Result<Option<CapturedScan>> {
        let Some(frame) = self.source.capture()? else {
            return Ok(None);
        };
        let img = frame.to_image()?;

        fs::create_dir_all(&self.data_dir)?;
        let file_name = self.next_file_name();
        let raw_path = self.data_dir.join(&file_name);
        img.save(&raw_path).map_err(|e| {
            ClassifierError::invalid_image(format!("cannot write {}: {}", raw_path.display(), e))
        })?;

        let normalized_path = match &self.normalizer {
            Some(normalizer) => {
                let dir = self.data_dir.join("normalized");
                fs::create_dir_all(&dir)?;
                let path = dir.join(&file_name);
                normalizer.normalize(&img)?.save(&path).map_err(|e| {
                    ClassifierError::invalid_image(format!("cannot write {}: {}", path.display(), e))
                })?;
                Some(path)
            }
            None => None,
        };

        self.captured += 1;
        info!(source = self.source.name(), path = %raw_path.display(), "fingerprint saved");
        Ok(Some(CapturedScan {
            raw_path,
            normalized_path,
        }))
    }

    /// 入力源が尽きるまで保存を続ける
    pub fn capture_all(&mut self) -> Result<Vec<CapturedScan>> {
        let mut scans = Vec::new();
        while let Some(scan) = self.capture_next()? {
            scans.push(scan);
        }
        Ok(scans)
    }

    fn next_file_name(&self) -> String {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f");
        let base = format!("fingerprint_{}", stamp);
        let mut name = format!("{}.png", base);
        let mut n = 1;
        // 同一ミリ秒内の連続取得で上書きしない
        while self.data_dir.join(&name).exists() {
            name = format!("{}_{}.png", base, n);
            n += 1;
        }
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource {
        frames: Vec<GrayFrame>,
    }

    impl FrameSource for FixedSource {
        fn capture(&mut self) -> Result<Option<GrayFrame>> {
            Ok(self.frames.pop())
        }
    }

    fn frame(w: u32, h: u32) -> GrayFrame {
        let pixels = (0..w * h).map(|i| (i * 7 % 256) as u8).collect();
        GrayFrame::new(w, h, pixels).unwrap()
    }

    #[test]
    fn test_frame_rejects_wrong_buffer_length() {
        assert!(GrayFrame::new(4, 4, vec![0; 15]).is_err());
        assert!(GrayFrame::new(0, 4, vec![]).is_err());
    }

    #[test]
    fn test_session_saves_unique_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = FixedSource {
            frames: vec![frame(20, 24), frame(20, 24), frame(20, 24)],
        };
        let mut session = CaptureSession::new(source, dir.path());
        let scans = session.capture_all().unwrap();

        assert_eq!(scans.len(), 3);
        assert_eq!(session.captured(), 3);
        for scan in &scans {
            assert!(scan.raw_path.exists());
            let name = scan.raw_path.file_name().unwrap().to_str().unwrap();
            assert!(name.starts_with("fingerprint_") && name.ends_with(".png"));
        }
        assert_ne!(scans[0].raw_path, scans[1].raw_path);
        assert_ne!(scans[1].raw_path, scans[2].raw_path);
    }

    #[test]
    fn test_session_writes_normalized_copy() {
        let dir = tempfile::tempdir().unwrap();
        let source = FixedSource {
            frames: vec![frame(32, 32)],
        };
        let mut session =
            CaptureSession::new(source, dir.path()).with_normalizer(ImageNormalizer::default());
        let scan = session.capture_next().unwrap().unwrap();

        let normalized = scan.normalized_path.unwrap();
        let img = image::open(&normalized).unwrap().to_luma8();
        assert_eq!(img.dimensions(), (32, 32));
        assert!(img.iter().all(|&p| p == 0 || p == 255));
        assert!(session.capture_next().unwrap().is_none());
    }

    #[test]
    fn test_replay_source_reads_saved_scans() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.png"] {
            frame(10, 12).to_image().unwrap().save(dir.path().join(name)).unwrap();
        }
        let mut source = DirectoryReplaySource::open(dir.path()).unwrap();
        assert_eq!(source.remaining(), 2);

        let first = source.capture().unwrap().unwrap();
        assert_eq!((first.width, first.height), (10, 12));
        assert_eq!(first, frame(10, 12));
        assert!(source.capture().unwrap().is_some());
        assert!(source.capture().unwrap().is_none());
    }
}
