//! Decode, orient, and scale raw image bytes (spec.md 4.5 steps 7-8, 9
//! "orientation"; supplements the distilled spec's "pure function"
//! placeholder for image decoding so the crate runs end to end).
//!
//! Grounded on
//! `other_examples/80dbb745_chl84-Browsey__src-commands-thumbnails-mod.rs.rs`
//! for the `image::metadata::Orientation` + `ImageDecoder::orientation`
//! EXIF-correction idiom, and on spec.md 4.5's "fits within the box
//! without upscaling past the source" scaling contract.

use image::{DynamicImage, GenericImageView, ImageDecoder, ImageReader};
use std::io::Cursor;

use crate::error::{Result, ThumbError};

/// Decode `bytes` and apply any embedded EXIF orientation so the
/// returned image is visually upright.
pub fn decode_and_orient(bytes: &[u8]) -> Result<DynamicImage> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ThumbError::HardError(format!("unrecognized image format: {e}")))?
        .into_decoder()
        .map_err(|e| ThumbError::HardError(format!("failed to open image decoder: {e}")))?;
    let orientation = decoder
        .orientation()
        .ok()
        .unwrap_or(image::metadata::Orientation::NoTransforms);
    let mut image = DynamicImage::from_decoder(decoder)
        .map_err(|e| ThumbError::HardError(format!("failed to decode image: {e}")))?;
    image.apply_orientation(orientation);
    Ok(image)
}

/// Fit `image` within `(width, height)` without upscaling past the
/// source. `(0, 0)` returns the image unchanged; one axis zero
/// preserves aspect ratio on that axis (spec.md 4.5 step 8).
pub fn scale_to_bounds(image: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    if width == 0 && height == 0 {
        return image.clone();
    }
    let (src_w, src_h) = image.dimensions();
    let (target_w, target_h) = match (width, height) {
        (0, h) => {
            let ratio = h as f64 / src_h as f64;
            ((src_w as f64 * ratio).round() as u32, h)
        }
        (w, 0) => {
            let ratio = w as f64 / src_w as f64;
            (w, (src_h as f64 * ratio).round() as u32)
        }
        (w, h) => {
            // Fit within the box on both axes, preserving aspect ratio,
            // by taking the more restrictive of the two ratios.
            let scale = (w as f64 / src_w as f64).min(h as f64 / src_h as f64);
            (
                (src_w as f64 * scale).round() as u32,
                (src_h as f64 * scale).round() as u32,
            )
        }
    };
    let target_w = target_w.min(src_w).max(1);
    let target_h = target_h.min(src_h).max(1);
    if target_w >= src_w && target_h >= src_h {
        return image.clone();
    }
    image.resize(target_w, target_h, image::imageops::FilterType::Lanczos3)
}

/// Encode `image` as a lossless PNG, the on-disk rendition format for
/// both the image cache and the thumbnail cache.
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .map_err(|e| ThumbError::HardError(format!("failed to encode png: {e}")))?;
    Ok(out)
}
