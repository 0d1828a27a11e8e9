//! 指紋画像の正規化パイプライン
//!
//! 生のグレースケールスキャンを、黒背景に白い隆線の二値画像（0 または 255）へ
//! 変換します。処理順序は固定です:
//!
//! 1. CLAHE（8x8タイル, クリップ 2.0）
//! 2. 3x3 ガウシアン平滑化
//! 3. 反転適応二値化（ガウシアン重み, ブロック 11, オフセット 2）
//! 4. 2x2 クロージング 1回
//! 5. 3x3 ガウシアン再平滑化 → 128 で再二値化
//!
//! 出力サイズは入力と同じで、入力画素のみに依存する純関数です。

use std::path::Path;

use image::{DynamicImage, GrayImage};

use crate::error::{ClassifierError, Result};
use crate::model::config::NormalizerSettings;
use crate::preprocess::clahe::Clahe;
use crate::preprocess::filters::{self, Border};

/// 平滑化カーネルサイズ
const BLUR_KERNEL: usize = 3;

/// 正規化パイプラインの設定
#[derive(Debug, Clone, PartialEq)]
pub struct ImageNormalizer {
    pub clahe: Clahe,
    pub block_size: usize,
    pub threshold_offset: i32,
    pub closing_kernel: usize,
    pub closing_iterations: usize,
    pub final_threshold: u8,
}

impl Default for ImageNormalizer {
    fn default() -> Self {
        Self {
            clahe: Clahe::default(),
            block_size: 11,
            threshold_offset: 2,
            closing_kernel: 2,
            closing_iterations: 1,
            final_threshold: 128,
        }
    }
}

impl ImageNormalizer {
    /// 設定ファイルの値から作成
    pub fn from_settings(settings: &NormalizerSettings) -> Result<Self> {
        if settings.block_size < 3 || settings.block_size % 2 == 0 {
            return Err(ClassifierError::Config(format!(
                "adaptive threshold block size must be odd and >= 3, got {}",
                settings.block_size
            )));
        }
        if settings.closing_kernel == 0 {
            return Err(ClassifierError::Config(
                "closing kernel must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            clahe: Clahe::new(settings.clahe_clip_limit, settings.clahe_tile_grid),
            block_size: settings.block_size,
            threshold_offset: settings.threshold_offset,
            closing_kernel: settings.closing_kernel,
            closing_iterations: 1,
            final_threshold: settings.final_threshold,
        })
    }

    /// グレースケール画像を正規化する
    ///
    /// # 戻り値
    /// - 入力と同サイズの二値画像（画素値は 0 または 255 のみ）
    pub fn normalize(&self, src: &GrayImage) -> Result<GrayImage> {
        let (w, h) = src.dimensions();
        if w == 0 || h == 0 {
            return Err(ClassifierError::invalid_image(format!(
                "image has zero area ({}x{})",
                w, h
            )));
        }

        let enhanced = self.clahe.apply(src);
        let blurred = filters::gaussian_blur(&enhanced, BLUR_KERNEL, Border::Reflect101);
        let binary = filters::adaptive_threshold_inv(&blurred, self.block_size, self.threshold_offset);
        let closed = filters::close(&binary, self.closing_kernel, self.closing_iterations);
        let smoothed = filters::gaussian_blur(&closed, BLUR_KERNEL, Border::Reflect101);

        Ok(filters::threshold_binary(&smoothed, self.final_threshold))
    }

    /// 任意形式の画像をグレースケール化して正規化する
    pub fn normalize_dynamic(&self, img: &DynamicImage) -> Result<GrayImage> {
        self.normalize(&img.to_luma8())
    }

    /// 画像ファイルを読み込んで正規化する
    pub fn normalize_file(&self, path: &Path) -> Result<GrayImage> {
        if !path.exists() {
            return Err(ClassifierError::ImageFileNotFound(path.to_path_buf()));
        }
        let img = image::open(path).map_err(|e| {
            ClassifierError::invalid_image(format!("cannot decode {}: {}", path.display(), e))
        })?;
        self.normalize_dynamic(&img)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ridge_pattern(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let phase = (x as f32 + 0.3 * y as f32) * std::f32::consts::TAU / 8.0;
            image::Luma([(128.0 + 100.0 * phase.sin()) as u8])
        })
    }

    proptest! {
        #[test]
        fn test_output_is_binary_and_same_size(
            w in 1u32..40,
            h in 1u32..40,
            seed in prop::collection::vec(0..=255u8, 64),
        ) {
            let img = GrayImage::from_fn(w, h, |x, y| {
                image::Luma([seed[((x * 7 + y * 13) as usize) % seed.len()]])
            });
            let out = ImageNormalizer::default().normalize(&img).unwrap();
            prop_assert_eq!(out.dimensions(), (w, h));
            prop_assert!(out.iter().all(|&p| p == 0 || p == 255));
        }
    }

    #[test]
    fn test_all_black_input_gives_black_output() {
        let img = GrayImage::new(100, 100);
        let out = ImageNormalizer::default().normalize(&img).unwrap();
        assert_eq!(out.dimensions(), (100, 100));
        assert!(out.iter().all(|&p| p == 0));
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let img = ridge_pattern(96, 80);
        let normalizer = ImageNormalizer::default();
        let first = normalizer.normalize(&img).unwrap();
        let second = normalizer.normalize(&img).unwrap();
        assert_eq!(first.as_raw(), second.as_raw());
    }

    #[test]
    fn test_ridges_become_foreground() {
        let img = ridge_pattern(96, 96);
        let out = ImageNormalizer::default().normalize(&img).unwrap();
        let white = out.iter().filter(|&&p| p == 255).count();
        assert!(white > 0, "dark ridges should be white");
        assert!(white < out.len(), "bright valleys should be black");
    }

    #[test]
    fn test_zero_area_is_invalid() {
        let img = GrayImage::new(0, 10);
        let err = ImageNormalizer::default().normalize(&img).unwrap_err();
        assert!(matches!(err, ClassifierError::InvalidImage { .. }));
    }

    #[test]
    fn test_undecodable_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not a png").unwrap();
        let err = ImageNormalizer::default().normalize_file(&path).unwrap_err();
        assert!(matches!(err, ClassifierError::InvalidImage { .. }));
    }

    #[test]
    fn test_rejects_even_block_size() {
        let settings = NormalizerSettings {
            block_size: 10,
            ..NormalizerSettings::default()
        };
        assert!(ImageNormalizer::from_settings(&settings).is_err());
    }
}
