//! Full pipeline: scale down, detect the largest face, crop, embed.

use image::DynamicImage;
use thiserror::Error;

use crate::detector::{self, Detector};
use crate::embedder::{Embedder, EmbedderError, EMBED_INPUT_SIZE};
use crate::preprocess::{self, PreprocessError, FACE_CROP_PAD, MAX_IMAGE_DIMENSION};
use crate::types::Embedding;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error(transparent)]
    Crop(#[from] PreprocessError),
    #[error(transparent)]
    Embed(#[from] EmbedderError),
}

/// Photo -> embedding capability consumed by batch scanning.
pub trait FaceEmbedding {
    fn face_embedding(&mut self, image: &DynamicImage) -> Result<Embedding, PipelineError>;
}

/// Composes the detector and extractor into the one-photo pipeline.
///
/// Any stage failure aborts the whole chain; a partial embedding is never
/// returned.
pub struct FacePipeline<D, E> {
    detector: D,
    embedder: E,
    max_dimension: u32,
}

impl<D: Detector, E: Embedder> FacePipeline<D, E> {
    pub fn new(detector: D, embedder: E) -> Self {
        Self {
            detector,
            embedder,
            max_dimension: MAX_IMAGE_DIMENSION,
        }
    }

    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension;
        self
    }
}

impl<D: Detector, E: Embedder> FaceEmbedding for FacePipeline<D, E> {
    fn face_embedding(&mut self, image: &DynamicImage) -> Result<Embedding, PipelineError> {
        let scaled = preprocess::scale_down(image, self.max_dimension);

        let face = detector::largest_face(&mut self.detector, &scaled)
            .ok_or(PipelineError::NoFaceDetected)?;
        tracing::debug!(bbox = ?face.bbox, confidence = face.confidence, "largest face selected");

        let crop = preprocess::crop_face(&scaled, &face.bbox, FACE_CROP_PAD, EMBED_INPUT_SIZE)?;
        // The crop is all inference needs; free the full-size buffer first.
        drop(scaled);

        Ok(self.embedder.embed(&crop)?)
    }
}
