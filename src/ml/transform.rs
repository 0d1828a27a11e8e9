//! モデル入力への変換
//!
//! 224x224 にリサイズしてRGB化し、ImageNetの平均と標準偏差で正規化した
//! (C, H, W) 順のベクタを作ります。学習と推論で同じ関数を使います。

use std::path::Path;

use image::{imageops::FilterType, DynamicImage};

use crate::error::{ClassifierError, Result};

/// 入力画像サイズ
pub const IMAGE_SIZE: usize = 224;

/// 入力チャネル数
pub const CHANNELS: usize = 3;

/// 1サンプルあたりの要素数
pub const SAMPLE_LEN: usize = CHANNELS * IMAGE_SIZE * IMAGE_SIZE;

pub const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 画像をモデル入力に変換
pub fn image_to_input(img: &DynamicImage) -> Vec<f32> {
    let size = IMAGE_SIZE as u32;
    let rgb = img.resize_exact(size, size, FilterType::Triangle).to_rgb8();

    let mut data = Vec::with_capacity(SAMPLE_LEN);
    for channel in 0..CHANNELS {
        for pixel in rgb.pixels() {
            let value = pixel[channel] as f32 / 255.0;
            data.push((value - MEAN[channel]) / STD[channel]);
        }
    }
    data
}

/// 画像ファイルを読み込んでモデル入力に変換
pub fn load_model_input(path: &Path) -> Result<Vec<f32>> {
    let img = image::open(path).map_err(|source| ClassifierError::ImageDecode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(image_to_input(&img))
}
