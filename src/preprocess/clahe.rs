//! コントラスト制限付き適応ヒストグラム平坦化 (CLAHE)
//!
//! 画像を `tile_grid × tile_grid` のタイルに分け、タイルごとにクリップ付き
//! ヒストグラム平坦化のLUTを作り、隣接4タイルのLUTを双線形補間して適用します。
//! スキャナの照明ムラを補正しつつ、全体のコントラストを保ちます。

use image::GrayImage;

const HIST_SIZE: usize = 256;

/// CLAHEの設定
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clahe {
    /// クリップ上限（タイル平均ビン高さに対する倍率）
    pub clip_limit: f32,
    /// 縦横のタイル分割数
    pub tile_grid: u32,
}

impl Default for Clahe {
    fn default() -> Self {
        Self {
            clip_limit: 2.0,
            tile_grid: 8,
        }
    }
}

impl Clahe {
    pub fn new(clip_limit: f32, tile_grid: u32) -> Self {
        Self {
            clip_limit,
            tile_grid: tile_grid.max(1),
        }
    }

    /// CLAHEを適用した新しい画像を返す
    pub fn apply(&self, src: &GrayImage) -> GrayImage {
        let (w, h) = src.dimensions();
        if w == 0 || h == 0 {
            return src.clone();
        }

        let grid = self.tile_grid.max(1);
        let tile_w = w.div_ceil(grid).max(1);
        let tile_h = h.div_ceil(grid).max(1);
        // 小さい画像では末尾のタイルが空になるので実在するタイル数に詰める
        let tiles_x = w.div_ceil(tile_w) as usize;
        let tiles_y = h.div_ceil(tile_h) as usize;

        let mut luts = Vec::with_capacity(tiles_x * tiles_y);
        for ty in 0..tiles_y as u32 {
            for tx in 0..tiles_x as u32 {
                let x0 = tx * tile_w;
                let y0 = ty * tile_h;
                let x1 = (x0 + tile_w).min(w);
                let y1 = (y0 + tile_h).min(h);
                luts.push(self.tile_lut(src, x0, y0, x1, y1));
            }
        }

        let inv_tw = 1.0 / tile_w as f32;
        let inv_th = 1.0 / tile_h as f32;
        let mut out = GrayImage::new(w, h);

        for y in 0..h {
            let tyf = y as f32 * inv_th - 0.5;
            let ty1 = tyf.floor() as i64;
            let ya = tyf - ty1 as f32;
            let ty2 = (ty1 + 1).min(tiles_y as i64 - 1) as usize;
            let ty1 = ty1.max(0) as usize;

            for x in 0..w {
                let txf = x as f32 * inv_tw - 0.5;
                let tx1 = txf.floor() as i64;
                let xa = txf - tx1 as f32;
                let tx2 = (tx1 + 1).min(tiles_x as i64 - 1) as usize;
                let tx1 = tx1.max(0) as usize;

                let v = src.get_pixel(x, y)[0] as usize;
                let lut = |tx: usize, ty: usize| luts[ty * tiles_x + tx][v] as f32;

                let top = lut(tx1, ty1) * (1.0 - xa) + lut(tx2, ty1) * xa;
                let bottom = lut(tx1, ty2) * (1.0 - xa) + lut(tx2, ty2) * xa;
                let res = top * (1.0 - ya) + bottom * ya;
                out.put_pixel(x, y, image::Luma([res.round().clamp(0.0, 255.0) as u8]));
            }
        }

        out
    }

    fn tile_lut(&self, src: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32) -> [u8; HIST_SIZE] {
        let area = ((x1 - x0) * (y1 - y0)) as usize;
        let mut lut = [0u8; HIST_SIZE];
        if area == 0 {
            for (i, v) in lut.iter_mut().enumerate() {
                *v = i as u8;
            }
            return lut;
        }

        let mut hist = [0usize; HIST_SIZE];
        for y in y0..y1 {
            for x in x0..x1 {
                hist[src.get_pixel(x, y)[0] as usize] += 1;
            }
        }

        if self.clip_limit > 0.0 {
            let limit = ((self.clip_limit * area as f32 / HIST_SIZE as f32) as usize).max(1);
            let mut clipped = 0usize;
            for bin in hist.iter_mut() {
                if *bin > limit {
                    clipped += *bin - limit;
                    *bin = limit;
                }
            }

            // 切り取った分を全ビンに均等配分し、端数は等間隔に1ずつ足す
            let batch = clipped / HIST_SIZE;
            let mut residual = clipped - batch * HIST_SIZE;
            for bin in hist.iter_mut() {
                *bin += batch;
            }
            if residual > 0 {
                let step = (HIST_SIZE / residual).max(1);
                let mut i = 0;
                while i < HIST_SIZE && residual > 0 {
                    hist[i] += 1;
                    residual -= 1;
                    i += step;
                }
            }
        }

        let scale = (HIST_SIZE - 1) as f32 / area as f32;
        let mut sum = 0usize;
        for (i, v) in lut.iter_mut().enumerate() {
            sum += hist[i];
            *v = (sum as f32 * scale).round().clamp(0.0, 255.0) as u8;
        }
        lut
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_image_stays_uniform() {
        let img = GrayImage::from_pixel(64, 64, image::Luma([90]));
        let out = Clahe::default().apply(&img);
        let first = out.get_pixel(0, 0)[0];
        assert!(out.iter().all(|&p| p == first));
    }

    #[test]
    fn test_stretches_low_contrast_texture() {
        // 各タイル内で 50..=64 の狭い範囲に収まるテクスチャ
        let img = GrayImage::from_fn(64, 64, |x, y| image::Luma([50 + (x % 8) as u8 + (y % 8) as u8]));
        let out = Clahe::default().apply(&img);
        let (min, max) = out
            .iter()
            .fold((255u8, 0u8), |(lo, hi), &p| (lo.min(p), hi.max(p)));
        assert!(max - min > 14, "contrast should increase, got {}..{}", min, max);
    }

    #[test]
    fn test_image_smaller_than_grid() {
        let img = GrayImage::from_fn(5, 3, |x, y| image::Luma([(x * 40 + y * 10) as u8]));
        let out = Clahe::default().apply(&img);
        assert_eq!(out.dimensions(), (5, 3));
    }
}
