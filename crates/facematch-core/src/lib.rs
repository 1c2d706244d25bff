//! facematch-core: face registration and comparison.
//!
//! Decodes uploads, keeps the known-faces gallery and the temp area on
//! disk, and matches faces by Euclidean embedding distance. Detection and
//! embedding run through SCRFD and ArcFace on ONNX Runtime behind the
//! [`FaceExtractor`] seam.

pub mod alignment;
pub mod detector;
pub mod extractor;
pub mod gallery;
pub mod loader;
pub mod matcher;
pub mod recognizer;
pub mod service;
pub mod sweep;
pub mod types;
pub mod uploads;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use extractor::{ExtractError, FaceExtractor, OnnxExtractor};
pub use gallery::{Gallery, GalleryEntry};
pub use loader::{ImageLoader, ResizePolicy};
pub use matcher::{EuclideanMatcher, MatchOutcome, Matcher};
pub use service::{FaceService, ServiceError, ServiceSettings, UploadedFile};
pub use sweep::{SweepReport, TempSweeper};
pub use types::{BoundingBox, DetectedFace, Embedding, GalleryFace};
pub use uploads::UploadStore;

/// Default location of the ONNX model files.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("models")
}
