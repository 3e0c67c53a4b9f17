//! FaceNet embedding extractor via ONNX Runtime.
//!
//! Turns a 160x160 face crop into an L2-normalized 128-dimensional
//! embedding. The session is created lazily on first use and can be
//! released explicitly; a released extractor reloads on the next call.

use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::PathBuf;
use thiserror::Error;

use crate::preprocess;
use crate::types::Embedding;

/// Side length of the model input crop.
pub const EMBED_INPUT_SIZE: u32 = 160;
/// Length of the output embedding vector.
pub const EMBEDDING_DIM: usize = 128;

const EMBED_INTRA_THREADS: usize = 4;
const FACENET_MODEL_VERSION: &str = "facenet-128";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("face crop must be {expected}x{expected}, got {width}x{height}")]
    InputShape { expected: u32, width: u32, height: u32 },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Embedding-inference capability consumed by the pipeline.
pub trait Embedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedderError>;
}

/// FaceNet-based embedding extractor.
pub struct FaceNetEmbedder {
    model_path: PathBuf,
    session: Option<Session>,
}

impl FaceNetEmbedder {
    /// Create an extractor for the given model file. The model is not
    /// loaded until first use.
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            session: None,
        }
    }

    /// Load the model if no session is live. Idempotent: a no-op while a
    /// session exists.
    pub fn initialize(&mut self) -> Result<(), EmbedderError> {
        if self.session.is_some() {
            return Ok(());
        }

        if !self.model_path.exists() {
            return Err(EmbedderError::ModelNotFound(
                self.model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(EMBED_INTRA_THREADS)?
            .commit_from_file(&self.model_path)?;

        tracing::info!(
            path = %self.model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        self.session = Some(session);
        Ok(())
    }

    /// Drop the loaded session. Safe to call when never initialized; a
    /// later `embed` reloads the model.
    pub fn release(&mut self) {
        if self.session.take().is_some() {
            tracing::debug!("FaceNet session released");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }
}

impl Embedder for FaceNetEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedderError> {
        let (width, height) = face.dimensions();
        if width != EMBED_INPUT_SIZE || height != EMBED_INPUT_SIZE {
            return Err(EmbedderError::InputShape {
                expected: EMBED_INPUT_SIZE,
                width,
                height,
            });
        }

        self.initialize()?;
        let Some(session) = self.session.as_mut() else {
            return Err(EmbedderError::InferenceFailed("no live session".into()));
        };

        let input = preprocess::face_tensor(face);
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        if raw.len() != EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(FACENET_MODEL_VERSION.to_string()),
        })
    }
}

/// L2-normalize a vector. A zero vector is returned unchanged.
fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}
