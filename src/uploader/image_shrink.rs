//! 超限照片压缩
//!
//! 对超过平台大小限制的图片执行两级策略：
//! 1. JPEG 质量阶梯下降（95 起步，步长 5，下限 50），透明通道
//!    先平铺到白色背景
//! 2. 质量降无可降时按固定比例缩小尺寸（90%..50%，保持偶数边长）
//!
//! 全部策略耗尽仍超限时返回错误，由上传侧将该条目单独失败。

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use tracing::{debug, info, warn};

use crate::error::{TaskError, TaskResult};

/// 平台照片大小限制（10 MiB）
pub const PHOTO_SIZE_LIMIT: u64 = 10 * 1024 * 1024;

/// 质量阶梯参数
const QUALITY_START: u8 = 95;
const QUALITY_FLOOR: u8 = 50;
const QUALITY_STEP: u8 = 5;

/// 尺寸缩放阶梯
const SCALE_LADDER: &[f32] = &[0.9, 0.8, 0.7, 0.6, 0.5];

/// 压缩图片到目标大小以内
///
/// 原图已达标时直接返回原路径；否则写出压缩副本并返回其路径
pub fn shrink_image(input: &Path, target_size: u64) -> TaskResult<PathBuf> {
    let original_size = std::fs::metadata(input)
        .map_err(|e| TaskError::Permanent {
            detail: format!("读取图片元数据失败 {:?}: {}", input, e),
        })?
        .len();
    if original_size <= target_size {
        debug!("图片已在限制内: {:?} ({} 字节)", input, original_size);
        return Ok(input.to_path_buf());
    }

    let output = shrunk_path(input);
    info!(
        "开始压缩图片: {:?} ({} 字节 -> 目标 {} 字节)",
        input, original_size, target_size
    );

    let img = image::open(input).map_err(|e| TaskError::Permanent {
        detail: format!("解码图片失败 {:?}: {}", input, e),
    })?;
    let rgb = flatten_onto_white(img);

    // 策略一：质量阶梯
    let mut quality = QUALITY_START;
    while quality >= QUALITY_FLOOR {
        let encoded = encode_jpeg(&rgb, quality)?;
        debug!("质量 {}: {} 字节", quality, encoded.len());
        if encoded.len() as u64 <= target_size {
            write_out(&output, &encoded)?;
            info!(
                "质量 {} 压缩达标: {:?} ({} 字节)",
                quality,
                output,
                encoded.len()
            );
            return Ok(output);
        }
        quality -= QUALITY_STEP;
    }

    // 策略二：尺寸阶梯（质量固定 85）
    let (width, height) = (rgb.width(), rgb.height());
    for scale in SCALE_LADDER {
        let new_width = even(((width as f32) * scale) as u32);
        let new_height = even(((height as f32) * scale) as u32);
        if new_width == 0 || new_height == 0 {
            break;
        }
        let resized = image::imageops::resize(&rgb, new_width, new_height, FilterType::Lanczos3);
        let encoded = encode_jpeg(&resized, 85)?;
        debug!(
            "缩放 {:.0}% ({}x{}): {} 字节",
            scale * 100.0,
            new_width,
            new_height,
            encoded.len()
        );
        if encoded.len() as u64 <= target_size {
            write_out(&output, &encoded)?;
            info!(
                "缩放 {:.0}% 压缩达标: {:?} ({} 字节)",
                scale * 100.0,
                output,
                encoded.len()
            );
            return Ok(output);
        }
    }

    warn!("所有压缩策略耗尽仍超限: {:?}", input);
    Err(TaskError::Permanent {
        detail: format!("图片无法压缩到 {} 字节以内: {:?}", target_size, input),
    })
}

/// 压缩副本路径：`<stem>_compressed.jpg`
pub fn shrunk_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    input.with_file_name(format!("{}_compressed.jpg", stem))
}

/// 透明像素平铺到白色背景
fn flatten_onto_white(img: DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = a as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha)) / 255) as u8;
        out.put_pixel(x, y, image::Rgb([blend(r), blend(g), blend(b)]));
    }
    out
}

fn encode_jpeg(img: &RgbImage, quality: u8) -> TaskResult<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder
        .encode_image(img)
        .map_err(|e| TaskError::Permanent {
            detail: format!("JPEG 编码失败: {}", e),
        })?;
    Ok(buf.into_inner())
}

fn write_out(path: &Path, data: &[u8]) -> TaskResult<()> {
    std::fs::write(path, data).map_err(|e| TaskError::Permanent {
        detail: format!("写出压缩图片失败 {:?}: {}", path, e),
    })
}

fn even(v: u32) -> u32 {
    v / 2 * 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// 生成噪声图片（难压缩，确保真正走阶梯）
    fn noisy_image(width: u32, height: u32) -> RgbImage {
        let mut img = RgbImage::new(width, height);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            let v = (x
                .wrapping_mul(31)
                .wrapping_add(y.wrapping_mul(17))
                .wrapping_mul(x ^ y)) as u8;
            *pixel = image::Rgb([v, v.wrapping_mul(3), v.wrapping_add(91)]);
        }
        img
    }

    #[test]
    fn test_small_image_untouched() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("small.png");
        noisy_image(16, 16).save(&path).unwrap();

        let result = shrink_image(&path, PHOTO_SIZE_LIMIT).unwrap();
        // 已在限制内：返回原路径
        assert_eq!(result, path);
    }

    #[test]
    fn test_shrinks_below_target() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("big.png");
        noisy_image(256, 256).save(&path).unwrap();
        let original = std::fs::metadata(&path).unwrap().len();
        assert!(original > 8 * 1024);

        let target = 8 * 1024u64;
        let result = shrink_image(&path, target).unwrap();

        assert_ne!(result, path);
        assert!(result.to_string_lossy().ends_with("_compressed.jpg"));
        let shrunk = std::fs::metadata(&result).unwrap().len();
        assert!(shrunk <= target, "{} > {}", shrunk, target);
        // 原图保留（替换由上传侧决定）
        assert!(path.exists());
    }

    #[test]
    fn test_transparency_flattened() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("alpha.png");
        // 全透明图片
        let rgba = image::RgbaImage::from_pixel(32, 32, image::Rgba([255, 0, 0, 0]));
        rgba.save(&path).unwrap();

        let img = image::open(&path).unwrap();
        let flat = flatten_onto_white(img);
        // 透明区域平铺为白色
        assert_eq!(flat.get_pixel(0, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_shrunk_path_naming() {
        assert_eq!(
            shrunk_path(Path::new("/x/photo.png")),
            PathBuf::from("/x/photo_compressed.jpg")
        );
    }

    #[test]
    fn test_impossible_target_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("big.png");
        noisy_image(128, 128).save(&path).unwrap();

        // 1 字节目标不可能达成
        let result = shrink_image(&path, 1);
        assert!(matches!(result, Err(TaskError::Permanent { .. })));
    }
}
