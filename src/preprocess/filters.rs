//! 正規化パイプラインで使う基本フィルタ
//!
//! いずれも `GrayImage` を受け取り、同じサイズの新しい画像を返す純関数です。

use image::GrayImage;

/// 境界外画素の扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Border {
    /// `dcb|abcd|cba` 形式の反射（端画素は繰り返さない）
    Reflect101,
    /// 端画素の複製
    Replicate,
}

fn border_index(i: isize, n: usize, border: Border) -> usize {
    let last = n as isize - 1;
    match border {
        Border::Replicate => i.clamp(0, last) as usize,
        Border::Reflect101 => {
            if n == 1 {
                return 0;
            }
            let mut i = i;
            while i < 0 || i > last {
                i = if i < 0 { -i } else { 2 * last - i };
            }
            i as usize
        }
    }
}

/// ガウシアンカーネル（和が1になるよう正規化）
///
/// σは `0.3 * ((ksize - 1) * 0.5 - 1) + 0.8` から導出する。3タップは
/// 固定値 `[0.25, 0.5, 0.25]`。
pub fn gaussian_kernel(ksize: usize) -> Vec<f32> {
    if ksize == 3 {
        return vec![0.25, 0.5, 0.25];
    }
    let sigma = 0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let center = (ksize / 2) as f32;
    let mut kernel: Vec<f32> = (0..ksize)
        .map(|i| {
            let d = i as f32 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

/// 分離型ガウシアン平滑化
pub fn gaussian_blur(src: &GrayImage, ksize: usize, border: Border) -> GrayImage {
    let (w, h) = (src.width() as usize, src.height() as usize);
    let kernel = gaussian_kernel(ksize);
    let radius = (ksize / 2) as isize;
    let data = src.as_raw();

    // 水平方向
    let mut horizontal = vec![0f32; w * h];
    for y in 0..h {
        let row = &data[y * w..(y + 1) * w];
        for x in 0..w {
            let mut acc = 0f32;
            for (k, weight) in kernel.iter().enumerate() {
                let sx = border_index(x as isize + k as isize - radius, w, border);
                acc += row[sx] as f32 * weight;
            }
            horizontal[y * w + x] = acc;
        }
    }

    // 垂直方向
    let mut out = vec![0u8; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0f32;
            for (k, weight) in kernel.iter().enumerate() {
                let sy = border_index(y as isize + k as isize - radius, h, border);
                acc += horizontal[sy * w + x] * weight;
            }
            out[y * w + x] = saturate_u8(acc);
        }
    }

    GrayImage::from_raw(w as u32, h as u32, out).unwrap_or_else(|| GrayImage::new(w as u32, h as u32))
}

/// ガウシアン重み付き局所平均による反転適応二値化
///
/// `src - mean <= -offset` の画素（局所的に暗い隆線）を255、それ以外を0にする。
pub fn adaptive_threshold_inv(src: &GrayImage, block_size: usize, offset: i32) -> GrayImage {
    let mean = gaussian_blur(src, block_size, Border::Replicate);
    let mut out = GrayImage::new(src.width(), src.height());
    for ((dst, s), m) in out.iter_mut().zip(src.iter()).zip(mean.iter()) {
        *dst = if (*s as i32 - *m as i32) <= -offset { 255 } else { 0 };
    }
    out
}

fn morph(src: &GrayImage, ksize: usize, dilate: bool) -> GrayImage {
    let (w, h) = (src.width() as usize, src.height() as usize);
    let anchor = (ksize / 2) as isize;
    let data = src.as_raw();
    let mut out = vec![0u8; w * h];

    // 収縮は反転した構造要素を使う（偶数サイズでもクロージングが位置ずれしない）
    let offset = |k: isize| if dilate { k - anchor } else { anchor - k };

    for y in 0..h {
        for x in 0..w {
            let mut acc: u8 = if dilate { 0 } else { 255 };
            for j in 0..ksize as isize {
                let sy = y as isize + offset(j);
                if sy < 0 || sy >= h as isize {
                    continue;
                }
                for i in 0..ksize as isize {
                    let sx = x as isize + offset(i);
                    if sx < 0 || sx >= w as isize {
                        continue;
                    }
                    let v = data[sy as usize * w + sx as usize];
                    acc = if dilate { acc.max(v) } else { acc.min(v) };
                }
            }
            out[y * w + x] = acc;
        }
    }

    GrayImage::from_raw(w as u32, h as u32, out).unwrap_or_else(|| GrayImage::new(w as u32, h as u32))
}

/// 矩形構造要素による膨張（境界外は無視）
pub fn dilate(src: &GrayImage, ksize: usize) -> GrayImage {
    morph(src, ksize, true)
}

/// 矩形構造要素による収縮（境界外は無視）
pub fn erode(src: &GrayImage, ksize: usize) -> GrayImage {
    morph(src, ksize, false)
}

/// クロージング（膨張→収縮）
pub fn close(src: &GrayImage, ksize: usize, iterations: usize) -> GrayImage {
    let mut dilated = src.clone();
    for _ in 0..iterations {
        dilated = dilate(&dilated, ksize);
    }
    let mut closed = dilated;
    for _ in 0..iterations {
        closed = erode(&closed, ksize);
    }
    closed
}

/// 固定しきい値による二値化（`v > threshold` → 255）
pub fn threshold_binary(src: &GrayImage, threshold: u8) -> GrayImage {
    let mut out = src.clone();
    for p in out.iter_mut() {
        *p = if *p > threshold { 255 } else { 0 };
    }
    out
}

fn saturate_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaussian_kernel_sums_to_one() {
        for ksize in [3, 5, 11] {
            let kernel = gaussian_kernel(ksize);
            assert_eq!(kernel.len(), ksize);
            let sum: f32 = kernel.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_border_index_modes() {
        assert_eq!(border_index(-1, 5, Border::Reflect101), 1);
        assert_eq!(border_index(5, 5, Border::Reflect101), 3);
        assert_eq!(border_index(-3, 5, Border::Replicate), 0);
        assert_eq!(border_index(7, 5, Border::Replicate), 4);
        assert_eq!(border_index(-2, 1, Border::Reflect101), 0);
    }

    #[test]
    fn test_blur_keeps_uniform_image() {
        let img = GrayImage::from_pixel(9, 7, image::Luma([77]));
        let blurred = gaussian_blur(&img, 3, Border::Reflect101);
        assert!(blurred.iter().all(|&p| p == 77));
    }

    #[test]
    fn test_adaptive_threshold_marks_dark_line() {
        let mut img = GrayImage::from_pixel(21, 21, image::Luma([200]));
        for y in 0..21 {
            img.put_pixel(10, y, image::Luma([40]));
        }
        let binary = adaptive_threshold_inv(&img, 11, 2);
        assert_eq!(binary.get_pixel(10, 10)[0], 255);
        assert_eq!(binary.get_pixel(2, 10)[0], 0);
    }

    #[test]
    fn test_close_bridges_single_pixel_gap() {
        let mut img = GrayImage::new(8, 3);
        for x in 0..8 {
            if x != 4 {
                img.put_pixel(x, 1, image::Luma([255]));
            }
        }
        let closed = close(&img, 2, 1);
        assert_eq!(closed.get_pixel(4, 1)[0], 255);
    }

    #[test]
    fn test_close_never_removes_foreground() {
        let mut img = GrayImage::new(6, 6);
        img.put_pixel(2, 2, image::Luma([255]));
        img.put_pixel(3, 2, image::Luma([255]));
        let closed = close(&img, 2, 1);
        for (x, y, p) in img.enumerate_pixels() {
            if p[0] == 255 {
                assert_eq!(closed.get_pixel(x, y)[0], 255);
            }
        }
    }

    #[test]
    fn test_threshold_binary_is_strict() {
        let img = GrayImage::from_raw(3, 1, vec![127, 128, 129]).unwrap();
        let out = threshold_binary(&img, 128);
        assert_eq!(out.as_raw(), &vec![0, 0, 255]);
    }
}
