use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use flux_types::Rect;
use image::{imageops, RgbImage};

/// 按 `[x1, y1, x2, y2]`（像素）裁剪，超出部分截到图像边界
pub fn cutout(frame: &RgbImage, rect: &Rect) -> Result<RgbImage> {
    let (width, height) = frame.dimensions();
    let [x1, y1, x2, y2] = *rect;

    let px1 = x1.max(0.0).min(width as f64) as u32;
    let py1 = y1.max(0.0).min(height as f64) as u32;
    let px2 = x2.max(0.0).min(width as f64) as u32;
    let py2 = y2.max(0.0).min(height as f64) as u32;

    let crop_width = px2.saturating_sub(px1);
    let crop_height = py2.saturating_sub(py1);
    if crop_width == 0 || crop_height == 0 {
        return Err(anyhow!(
            "Empty cutout {:?} in {}x{} frame",
            rect,
            width,
            height
        ));
    }

    Ok(imageops::crop_imm(frame, px1, py1, crop_width, crop_height).to_image())
}

/// 解码客户端上传的 base64 图片（PNG / JPEG / BMP）
pub fn decode_image(encoded: &str) -> Result<RgbImage> {
    // 兼容 data URL 前缀
    let payload = match encoded.split_once(";base64,") {
        Some((_, data)) => data,
        None => encoded,
    };
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| anyhow!("Invalid base64 image: {}", e))?;
    let image = image::load_from_memory(&bytes)?;
    Ok(image.to_rgb8())
}
