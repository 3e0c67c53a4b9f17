use std::path::PathBuf;

use facematch_core::{DEFAULT_MATCH_THRESHOLD, MAX_IMAGE_DIMENSION};

/// Scanner configuration, loaded from environment variables.
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Directory scanned for candidate JPEG photos.
    pub gallery_dir: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub match_threshold: f32,
    /// Photos with a larger dimension than this are shrunk before detection.
    pub max_image_dimension: u32,
}

impl Config {
    /// Load configuration from `FACEMATCH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACEMATCH_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facematch_core::default_model_dir());

        let gallery_dir = std::env::var("FACEMATCH_GALLERY_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join("Pictures")
            });

        Self {
            model_dir,
            gallery_dir,
            match_threshold: env_f32("FACEMATCH_MATCH_THRESHOLD", DEFAULT_MATCH_THRESHOLD),
            max_image_dimension: env_u32("FACEMATCH_MAX_IMAGE_DIM", MAX_IMAGE_DIMENSION),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detect_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the FaceNet embedding model.
    pub fn embed_model_path(&self) -> String {
        self.model_dir
            .join("facenet.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
