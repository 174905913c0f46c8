use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine};
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::errors::{AnalysisError, ItemResult, RequestError, RequestResult};
use crate::core::types::CroppedPayload;

/// MIME types accepted for outgoing image payloads, keyed by file extension
const MIME_TYPES: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("svg", "image/svg+xml"),
];

pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    let ext = ext.trim_start_matches('.').to_ascii_lowercase();
    MIME_TYPES
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, mime)| *mime)
}

/// Clip `[x, y, w, h]` to the image, returning the crop region as (x, y, w, h)
///
/// The origin is clamped to (0, 0) and the far edge to the image border, so the
/// extent never exceeds `(width - x, height - y)`. Boxes entirely outside the
/// image collapse to zero width or height.
pub fn clamp_bbox(bbox: [i32; 4], width: u32, height: u32) -> (u32, u32, u32, u32) {
    let [x, y, w, h] = bbox.map(i64::from);
    let (width, height) = (i64::from(width), i64::from(height));

    let x1 = x.max(0);
    let y1 = y.max(0);
    let x2 = (x + w).min(width);
    let y2 = (y + h).min(height);

    let crop_w = (x2 - x1).max(0);
    let crop_h = (y2 - y1).max(0);

    // x1 may lie past the border when crop_w is 0; clamp so the tuple stays valid
    (
        x1.min(width) as u32,
        y1.min(height) as u32,
        crop_w as u32,
        crop_h as u32,
    )
}

/// Encode an image as baseline JPEG
///
/// JPEG has no alpha channel, so the image is flattened to RGB first.
pub fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>> {
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut jpeg_bytes = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut jpeg_bytes), ImageFormat::Jpeg)
        .context("Failed to encode image as JPEG")?;
    Ok(jpeg_bytes)
}

/// Build a `data:<mime>;base64,...` URL for encoded image bytes
///
/// The MIME type is looked up from the extension of `filename`.
pub fn data_url_for(bytes: &[u8], filename: &str) -> ItemResult<String> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    let mime = mime_for_extension(ext)
        .ok_or_else(|| AnalysisError::UnsupportedFormat(format!(".{}", ext)))?;

    Ok(format!(
        "data:{};base64,{}",
        mime,
        general_purpose::STANDARD.encode(bytes)
    ))
}

/// Crop one detection out of the source image and encode it for a remote call
pub fn extract_crop(img: &DynamicImage, bbox: [i32; 4]) -> ItemResult<CroppedPayload> {
    let (width, height) = (img.width(), img.height());
    let (x, y, w, h) = clamp_bbox(bbox, width, height);
    if w == 0 || h == 0 {
        return Err(AnalysisError::EmptyCrop {
            bbox,
            width,
            height,
        });
    }

    let cropped = DynamicImage::ImageRgb8(img.crop_imm(x, y, w, h).to_rgb8());
    let encoded_bytes =
        encode_jpeg(&cropped).map_err(|e| AnalysisError::Encode(format!("{:#}", e)))?;
    let data_url = data_url_for(&encoded_bytes, "crop.jpg")?;

    Ok(CroppedPayload {
        image: cropped,
        encoded_bytes,
        mime_type: "image/jpeg",
        data_url,
        region: (x, y, w, h),
    })
}

/// Crop and encode on the blocking pool
pub async fn crop_and_encode_jpeg_async(
    img: Arc<DynamicImage>,
    bbox: [i32; 4],
) -> ItemResult<CroppedPayload> {
    tokio::task::spawn_blocking(move || extract_crop(&img, bbox))
        .await
        .map_err(|e| AnalysisError::TaskFailed(format!("crop task failed: {}", e)))?
}

/// Decode a `data:` URL or bare base64 string into raw bytes
pub fn decode_data_url(input: &str) -> RequestResult<Vec<u8>> {
    let input = input.trim();
    let payload = if input.starts_with("data:") {
        let (header, payload) = input
            .split_once(',')
            .ok_or_else(|| RequestError::Decode("malformed data URL".to_string()))?;
        if !header.ends_with(";base64") {
            return Err(RequestError::Decode(
                "data URL is not base64-encoded".to_string(),
            ));
        }
        payload
    } else {
        input
    };

    if payload.is_empty() {
        return Err(RequestError::Decode("empty image payload".to_string()));
    }

    general_purpose::STANDARD
        .decode(payload.as_bytes())
        .map_err(|e| RequestError::Decode(format!("invalid base64: {}", e)))
}

/// Decode an image on the blocking pool
pub async fn load_image_from_memory_async(bytes: Vec<u8>) -> Result<DynamicImage> {
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&bytes).context("Failed to load image from memory")
    })
    .await
    .context("Failed to spawn blocking task for image loading")?
}

/// Write an encoded crop as `{index}.jpg` under `dir`
pub async fn save_crop_async(dir: &Path, index: usize, bytes: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create crop archive {}", dir.display()))?;
    let path = dir.join(format!("{}.jpg", index));
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("Failed to write crop {}", path.display()))?;
    Ok(path)
}
