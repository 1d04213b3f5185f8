//! Face encoding: detection + alignment + embedding behind one seam.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Embedding;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("feature extraction failed: {0}")]
    Extraction(String),
}

#[derive(Error, Debug)]
pub enum EncoderLoadError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Embedding of the first detected face in an image.
#[derive(Debug, Clone)]
pub struct EncodedFace {
    pub embedding: Embedding,
    pub detection_confidence: f32,
    /// Total faces the detector found; only the first is encoded.
    pub faces_detected: usize,
}

/// Turns an image into a fixed-length face embedding.
///
/// Implementations may hold inference sessions that need exclusive access,
/// hence `&mut self`.
pub trait FaceEncoder: Send {
    fn encode(&mut self, image: &RgbImage) -> Result<EncodedFace, EncodeError>;
}

/// SCRFD detector followed by the 128-d ONNX encoder.
pub struct OnnxFaceEncoder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceEncoder {
    pub fn load(detector_path: &str, encoder_path: &str) -> Result<Self, EncoderLoadError> {
        let detector = FaceDetector::load(detector_path)?;
        let recognizer = FaceRecognizer::load(encoder_path)?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceEncoder for OnnxFaceEncoder {
    fn encode(&mut self, image: &RgbImage) -> Result<EncodedFace, EncodeError> {
        let faces = self
            .detector
            .detect(image)
            .map_err(|e| EncodeError::Extraction(e.to_string()))?;

        let face = faces.first().ok_or(EncodeError::NoFaceDetected)?;
        if faces.len() > 1 {
            tracing::debug!(count = faces.len(), "multiple faces detected, using the first");
        }

        let embedding = self
            .recognizer
            .extract(image, face)
            .map_err(|e| EncodeError::Extraction(e.to_string()))?;

        Ok(EncodedFace {
            embedding,
            detection_confidence: face.confidence,
            faces_detected: faces.len(),
        })
    }
}
