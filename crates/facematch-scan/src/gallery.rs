//! Gallery collaborators: candidate enumeration and pixel loading.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque identifier for a candidate photo (a filesystem path here).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&Path> for ImageId {
    fn from(path: &Path) -> Self {
        Self(path.to_string_lossy().into_owned())
    }
}

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("cannot read gallery directory {path}: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to load {id}: {source}")]
    Decode {
        id: String,
        source: image::ImageError,
    },
}

/// Ordered enumeration of candidate photos.
pub trait Gallery {
    fn list_images(&self) -> Result<Vec<ImageId>, GalleryError>;
}

/// Pixel access for one candidate photo.
pub trait ImageLoader {
    fn load(&self, id: &ImageId) -> Result<DynamicImage, LoadError>;
}

/// JPEG files in a single directory, newest first.
pub struct FsGallery {
    root: PathBuf,
}

impl FsGallery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Gallery for FsGallery {
    fn list_images(&self) -> Result<Vec<ImageId>, GalleryError> {
        let entries = fs::read_dir(&self.root).map_err(|source| GalleryError::Unreadable {
            path: self.root.display().to_string(),
            source,
        })?;

        let mut images: Vec<(PathBuf, SystemTime)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| GalleryError::Unreadable {
                path: self.root.display().to_string(),
                source,
            })?;
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() || !is_jpeg(&path) {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            images.push((path, modified));
        }

        // Newest first, matching how a photo gallery presents itself
        images.sort_by(|a, b| b.1.cmp(&a.1));

        tracing::debug!(count = images.len(), root = %self.root.display(), "gallery listed");
        Ok(images
            .into_iter()
            .map(|(path, _)| ImageId::from(path.as_path()))
            .collect())
    }
}

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
}

/// Loads and decodes photos from the filesystem.
pub struct FsImageLoader;

impl ImageLoader for FsImageLoader {
    fn load(&self, id: &ImageId) -> Result<DynamicImage, LoadError> {
        image::open(id.as_path()).map_err(|source| LoadError::Decode {
            id: id.to_string(),
            source,
        })
    }
}
