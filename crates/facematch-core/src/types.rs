use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default cosine-similarity threshold for a positive match.
///
/// Tunable: carried through configuration and the CLI, never hard-wired
/// into the scoring logic.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.60;

#[derive(Error, Debug)]
pub enum ScoreError {
    #[error("embedding dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

/// Axis-aligned integer rectangle in image pixel coordinates.
///
/// Invariant: `left < right` and `top < bottom`, both within the image the
/// box was clamped against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl BoundingBox {
    /// Clamp a float rectangle to image bounds.
    ///
    /// Returns `None` when the clamped region has zero width or height, so
    /// every constructed box satisfies the invariant.
    pub fn clamped(
        x1: f32,
        y1: f32,
        x2: f32,
        y2: f32,
        image_width: u32,
        image_height: u32,
    ) -> Option<Self> {
        let left = x1.max(0.0).floor() as u32;
        let top = y1.max(0.0).floor() as u32;
        let right = x2.min(image_width as f32).max(0.0).ceil() as u32;
        let bottom = y2.min(image_height as f32).max(0.0).ceil() as u32;

        (left < right && top < bottom).then_some(Self {
            left,
            top,
            right,
            bottom,
        })
    }

    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }
}

/// A face found by the detector. Transient: consumed by the crop stage and
/// discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Face embedding vector (128-dimensional for FaceNet).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding. Embeddings are only
    /// comparable when produced by the same model.
    pub model_version: Option<String>,
}

impl Embedding {
    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]; higher = more similar. Norms are computed
    /// independently even though extracted embeddings are pre-normalized, so
    /// the result stays correct for non-normalized inputs.
    pub fn similarity(&self, other: &Embedding) -> Result<f32, ScoreError> {
        if self.values.len() != other.values.len() {
            return Err(ScoreError::DimensionMismatch {
                left: self.values.len(),
                right: other.values.len(),
            });
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        Ok(if denom > 0.0 { dot / denom } else { 0.0 })
    }
}

/// Strict greater-than decision: a similarity exactly at the threshold is
/// not a match.
pub fn is_match(similarity: f32, threshold: f32) -> bool {
    similarity > threshold
}
