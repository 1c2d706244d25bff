//! The face feature extraction seam and its ONNX-backed implementation.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::DetectedFace;
use image::RgbImage;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

/// SCRFD detection model file name inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("{0} session lock poisoned")]
    Poisoned(&'static str),
}

/// Detects faces in an RGB image and produces one embedding per face.
///
/// Faces come back in descending detection confidence. An image with no
/// faces yields an empty vector, not an error.
pub trait FaceExtractor: Send + Sync {
    fn extract(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, ExtractError>;
}

/// SCRFD detection followed by ArcFace recognition.
pub struct OnnxExtractor {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
}

impl OnnxExtractor {
    /// Load both models from `model_dir`. Fails fast if either is missing.
    pub fn load(model_dir: &Path) -> Result<Self, ExtractError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?;
        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
        })
    }
}

impl FaceExtractor for OnnxExtractor {
    fn extract(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, ExtractError> {
        let boxes = self
            .detector
            .lock()
            .map_err(|_| ExtractError::Poisoned("detector"))?
            .detect(image)?;
        tracing::debug!(faces = boxes.len(), "detection finished");

        let mut recognizer = self
            .recognizer
            .lock()
            .map_err(|_| ExtractError::Poisoned("recognizer"))?;

        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            match recognizer.extract(image, &bbox) {
                Ok(embedding) => faces.push(DetectedFace { bbox, embedding }),
                Err(RecognizerError::NoLandmarks) => {
                    tracing::warn!(confidence = bbox.confidence, "skipping face without landmarks");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(faces)
    }
}
