//! Image preprocessing: down-scaling, padded face crops, model input tensors.

use std::borrow::Cow;

use image::{imageops::FilterType, DynamicImage, GenericImageView, RgbImage};
use ndarray::Array4;
use thiserror::Error;

use crate::types::BoundingBox;

/// Largest dimension an input photo keeps before detection.
pub const MAX_IMAGE_DIMENSION: u32 = 1024;

/// Fraction of the larger box side added as padding on every edge of a
/// face crop.
pub const FACE_CROP_PAD: f32 = 0.2;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("crop region has zero area after clamping to {width}x{height}")]
    InvalidRegion { width: u32, height: u32 },
}

/// Shrink `image` so its larger dimension equals exactly `max_dimension`.
///
/// Images already within bounds are returned as a borrow; otherwise a
/// uniform (aspect-preserving) bilinear resize is applied and the caller
/// drops the original. Full-resolution photos are memory-heavy, so this
/// runs before any other stage.
pub fn scale_down(image: &DynamicImage, max_dimension: u32) -> Cow<'_, DynamicImage> {
    let (width, height) = image.dimensions();
    if width <= max_dimension && height <= max_dimension {
        return Cow::Borrowed(image);
    }

    let ratio = max_dimension as f32 / width.max(height) as f32;
    let new_width = (width as f32 * ratio).round() as u32;
    let new_height = (height as f32 * ratio).round() as u32;

    tracing::debug!(width, height, new_width, new_height, "scaling down input photo");
    Cow::Owned(image.resize_exact(new_width, new_height, FilterType::Triangle))
}

/// Crop a padded face region and resize it to the extractor input size.
///
/// The box grows by `pad_frac` of its larger side on every edge and is
/// clamped to the image bounds; a region clamped down to zero area is
/// rejected as `InvalidRegion`.
pub fn crop_face(
    image: &DynamicImage,
    bbox: &BoundingBox,
    pad_frac: f32,
    target_size: u32,
) -> Result<RgbImage, PreprocessError> {
    let (width, height) = image.dimensions();
    let pad = (bbox.width().max(bbox.height()) as f32 * pad_frac) as u32;

    let left = bbox.left.saturating_sub(pad);
    let top = bbox.top.saturating_sub(pad);
    let right = bbox.right.saturating_add(pad).min(width);
    let bottom = bbox.bottom.saturating_add(pad).min(height);

    if left >= right || top >= bottom {
        return Err(PreprocessError::InvalidRegion { width, height });
    }

    let crop = image.crop_imm(left, top, right - left, bottom - top);
    Ok(image::imageops::resize(
        &crop.to_rgb8(),
        target_size,
        target_size,
        FilterType::Triangle,
    ))
}

/// Flatten a face crop into the extractor's NHWC float tensor, each channel
/// mapped from [0, 255] to [0, 1].
///
/// Channel-interleaved row-major layout — the FaceNet input convention, not
/// the planar layout the detector uses.
pub fn face_tensor(face: &RgbImage) -> Array4<f32> {
    let (width, height) = face.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, height as usize, width as usize, 3));

    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, y as usize, x as usize, c]] = pixel[c] as f32 / 255.0;
        }
    }

    tensor
}
