//! facematch-scan — batch scan orchestration.
//!
//! Drives the facematch-core pipeline over a photo gallery on a dedicated
//! worker thread, isolating per-photo failures and streaming progress
//! updates to async callers.

pub mod config;
pub mod gallery;
pub mod scanner;

pub use config::Config;
pub use gallery::{FsGallery, FsImageLoader, Gallery, GalleryError, ImageId, ImageLoader, LoadError};
pub use scanner::{spawn_scanner, CancelFlag, ScanError, ScanReport, ScannerHandle};
