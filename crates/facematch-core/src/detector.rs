//! SCRFD face detector via ONNX Runtime.
//!
//! Wraps a pretrained SCRFD model with 3-stride anchor-free decoding and NMS
//! post-processing, configured for fast gallery scanning: no landmark
//! decoding, and faces below a minimum relative size are discarded.

use image::{imageops::FilterType, DynamicImage, GenericImageView, Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

use crate::types::{BoundingBox, DetectedFace};

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Minimum face width relative to image width. Smaller detections are
/// background faces the matcher is not interested in.
pub const MIN_FACE_FRAC: f32 = 0.15;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download from insightface and place in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Face-detection capability consumed by the pipeline.
pub trait Detector {
    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<DetectedFace>, DetectorError>;
}

/// Run detection and keep the face with the largest bounding-box area.
///
/// Detector-internal failures are logged and collapsed into `None`; the
/// caller treats an absent face as its own failure condition. Ties on area
/// are broken arbitrarily.
pub fn largest_face<D: Detector>(detector: &mut D, image: &DynamicImage) -> Option<DetectedFace> {
    match detector.detect(image) {
        Ok(faces) => faces.into_iter().max_by_key(|face| face.bbox.area()),
        Err(err) => {
            tracing::warn!(error = %err, "face detection failed");
            None
        }
    }
}

/// A decoded detection in original-image coordinates, before clamping.
#[derive(Debug, Clone)]
struct RawDetection {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

/// Letterbox geometry for mapping model-space coordinates back to the frame.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    /// Per-stride (score, bbox) output indices for strides [8, 16, 32].
    /// Discovered by name at load time; falls back to positional ordering.
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        // Landmark-free exports carry 6 outputs (3 strides x score/bbox);
        // exports that also ship landmark tensors carry 9. Landmarks are
        // never decoded here either way.
        if num_outputs < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least 6 outputs (3 strides x score/bbox), got {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_indices,
        })
    }

    /// Letterbox an RGB photo into the square model input.
    ///
    /// Aspect-preserving bilinear resize onto a mean-gray canvas, then a
    /// NCHW float tensor normalized to the SCRFD input distribution.
    fn letterbox(&self, image: &DynamicImage) -> (Array4<f32>, LetterboxInfo) {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();

        let scale = SCRFD_INPUT_SIZE as f32 / width.max(height) as f32;
        let new_w = ((width as f32 * scale).round() as u32).min(SCRFD_INPUT_SIZE);
        let new_h = ((height as f32 * scale).round() as u32).min(SCRFD_INPUT_SIZE);
        let pad_x = ((SCRFD_INPUT_SIZE - new_w) / 2) as f32;
        let pad_y = ((SCRFD_INPUT_SIZE - new_h) / 2) as f32;

        let resized = image::imageops::resize(&rgb, new_w, new_h, FilterType::Triangle);

        // Pad with the mean value so the border normalizes to 0.0
        let mut canvas = RgbImage::from_pixel(
            SCRFD_INPUT_SIZE,
            SCRFD_INPUT_SIZE,
            Rgb([SCRFD_MEAN as u8, SCRFD_MEAN as u8, SCRFD_MEAN as u8]),
        );
        image::imageops::overlay(&mut canvas, &resized, pad_x as i64, pad_y as i64);

        let size = SCRFD_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in canvas.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        (tensor, LetterboxInfo { scale, pad_x, pad_y })
    }
}

impl Detector for ScrfdDetector {
    /// Detect faces in a photo, returning clamped boxes sorted by confidence.
    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<DetectedFace>, DetectorError> {
        let (orig_width, orig_height) = image.dimensions();
        let (input, letterbox) = self.letterbox(image);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            let dets = decode_stride(
                scores,
                bboxes,
                stride,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            );
            all_detections.extend(dets);
        }

        let kept = nms(all_detections, SCRFD_NMS_THRESHOLD);
        let min_width = MIN_FACE_FRAC * orig_width as f32;

        let mut faces: Vec<DetectedFace> = kept
            .into_iter()
            .filter(|d| d.x2 - d.x1 >= min_width)
            .filter_map(|d| {
                BoundingBox::clamped(d.x1, d.y1, d.x2, d.y2, orig_width, orig_height).map(|bbox| {
                    DetectedFace {
                        bbox,
                        confidence: d.score,
                    }
                })
            })
            .collect();

        faces.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(faces)
    }
}

/// Discover output tensor ordering by name.
///
/// SCRFD models may export named tensors ("score_8", "bbox_16", ...) or
/// generic numeric names. If the named pattern is present, map it to stride
/// slots; otherwise fall back to the standard positional ordering:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named = SCRFD_STRIDES
        .iter()
        .all(|&stride| find("score", stride).is_some() && find("bbox", stride).is_some());

    if named {
        tracing::info!("SCRFD: using name-based output tensor mapping");
        std::array::from_fn(|i| {
            let stride = SCRFD_STRIDES[i];
            (
                find("score", stride).unwrap(),
                find("bbox", stride).unwrap(),
            )
        })
    } else {
        tracing::info!(
            ?names,
            "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes"
        );
        [(0, 3), (1, 4), (2, 5)]
    }
}

/// Decode detections for a single stride level into original-image
/// coordinates.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<RawDetection> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid) as f32 * stride as f32;
        let anchor_cy = (anchor_idx / grid) as f32 * stride as f32;

        // Decode bbox: [x1_offset, y1_offset, x2_offset, y2_offset] * stride
        let off = idx * 4;
        if off + 3 >= bboxes.len() {
            continue;
        }
        let x1 = anchor_cx - bboxes[off] * stride as f32;
        let y1 = anchor_cy - bboxes[off + 1] * stride as f32;
        let x2 = anchor_cx + bboxes[off + 2] * stride as f32;
        let y2 = anchor_cy + bboxes[off + 3] * stride as f32;

        // Map from letterboxed space to original frame space
        detections.push(RawDetection {
            x1: (x1 - letterbox.pad_x) / letterbox.scale,
            y1: (y1 - letterbox.pad_y) / letterbox.scale,
            x2: (x2 - letterbox.pad_x) / letterbox.scale,
            y2: (y2 - letterbox.pad_y) / letterbox.scale,
            score,
        });
    }

    detections
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if suppressed[j] {
                continue;
            }
            if iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute Intersection-over-Union between two detections.
fn iou(a: &RawDetection, b: &RawDetection) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let inter_w = (x2 - x1).max(0.0);
    let inter_h = (y2 - y1).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union_area = area_a + area_b - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
