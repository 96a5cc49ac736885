//! Descriptor extraction capability.
//!
//! An [`Extractor`] turns one still grayscale frame into the descriptor of
//! its most prominent face. Implementations own their model state and have
//! an explicit lifecycle: [`Extractor::initialize`] must succeed before
//! [`Extractor::extract`] is called.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Extraction};
use std::path::PathBuf;
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    /// Nothing face-like in the frame. Per-frame and recoverable.
    #[error("no face detected")]
    NoFaceDetected,
    /// The backend could not be brought up (missing or broken model files).
    #[error("face model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("extractor used before initialization")]
    NotInitialized,
    #[error("extraction failed: {0}")]
    InferenceFailed(String),
}

impl From<DetectorError> for ExtractError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::ModelNotFound(path) => {
                ExtractError::ModelUnavailable(format!("{path} not found"))
            }
            other => ExtractError::InferenceFailed(other.to_string()),
        }
    }
}

impl From<RecognizerError> for ExtractError {
    fn from(e: RecognizerError) -> Self {
        match e {
            RecognizerError::ModelNotFound(path) => {
                ExtractError::ModelUnavailable(format!("{path} not found"))
            }
            other => ExtractError::InferenceFailed(other.to_string()),
        }
    }
}

/// Pluggable descriptor backend.
pub trait Extractor: Send {
    /// Short backend name reported in daemon status ("onnx", "mock", ...).
    fn kind(&self) -> &'static str;

    /// Load models. Failing here is a setup problem, reported as
    /// [`ExtractError::ModelUnavailable`].
    fn initialize(&mut self) -> Result<(), ExtractError>;

    fn is_ready(&self) -> bool;

    /// Extract the descriptor of the primary face in a grayscale frame.
    fn extract(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Extraction, ExtractError>;
}

/// Pick exactly one face: largest box area, then higher confidence, then
/// top-most, then left-most.
pub fn select_primary_face(faces: &[BoundingBox]) -> Option<&BoundingBox> {
    faces.iter().min_by(|a, b| {
        b.area()
            .total_cmp(&a.area())
            .then_with(|| b.confidence.total_cmp(&a.confidence))
            .then_with(|| a.y.total_cmp(&b.y))
            .then_with(|| a.x.total_cmp(&b.x))
    })
}

/// SCRFD detection + ArcFace embedding.
pub struct OnnxExtractor {
    model_dir: PathBuf,
    models: Option<(FaceDetector, FaceRecognizer)>,
}

impl OnnxExtractor {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            models: None,
        }
    }

    fn model_path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }
}

impl Extractor for OnnxExtractor {
    fn kind(&self) -> &'static str {
        "onnx"
    }

    fn initialize(&mut self) -> Result<(), ExtractError> {
        if self.models.is_some() {
            return Ok(());
        }
        let detector = FaceDetector::load(&self.model_path(DETECTOR_MODEL_FILE))
            .map_err(|e| ExtractError::ModelUnavailable(e.to_string()))?;
        let recognizer = FaceRecognizer::load(&self.model_path(RECOGNIZER_MODEL_FILE))
            .map_err(|e| ExtractError::ModelUnavailable(e.to_string()))?;
        self.models = Some((detector, recognizer));
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.models.is_some()
    }

    fn extract(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Extraction, ExtractError> {
        let (detector, recognizer) = self.models.as_mut().ok_or(ExtractError::NotInitialized)?;

        let faces = detector.detect(frame, width, height)?;
        let face = select_primary_face(&faces).ok_or(ExtractError::NoFaceDetected)?;
        if faces.len() > 1 {
            tracing::debug!(faces = faces.len(), area = face.area(), "multiple faces, using largest");
        }

        let descriptor = recognizer.describe(frame, width, height, face)?;
        Ok(Extraction {
            descriptor,
            face: face.clone(),
        })
    }
}
