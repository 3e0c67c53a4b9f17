//! facematch-core — face-embedding matching pipeline.
//!
//! Detects the largest face in a photo (SCRFD via ONNX Runtime), crops it
//! with padding, and extracts an L2-normalized 128-dimensional FaceNet
//! embedding for cosine-similarity matching.

pub mod detector;
pub mod embedder;
pub mod pipeline;
pub mod preprocess;
pub mod types;

pub use detector::{largest_face, Detector, DetectorError, ScrfdDetector};
pub use embedder::{Embedder, EmbedderError, FaceNetEmbedder, EMBEDDING_DIM, EMBED_INPUT_SIZE};
pub use pipeline::{FaceEmbedding, FacePipeline, PipelineError};
pub use preprocess::{PreprocessError, MAX_IMAGE_DIMENSION};
pub use types::{is_match, BoundingBox, DetectedFace, Embedding, ScoreError, DEFAULT_MATCH_THRESHOLD};

use std::path::PathBuf;

/// Default directory for the packaged ONNX models.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}
