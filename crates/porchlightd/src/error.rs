use porchlight_core::{AggregateError, ConfigError, MatchError, PersonId};
use porchlight_store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Failures of the detection and enrollment sessions.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error("face recognition unavailable: {0}")]
    ModelUnavailable(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("nothing to aggregate")]
    EmptyInput,
    #[error("no usable face samples were captured")]
    NoUsableSamples,
    #[error("gallery write failed: {0}")]
    GalleryWriteFailed(StoreError),
    #[error("history write failed: {0}")]
    HistoryWriteFailed(StoreError),
    #[error("a session is already running")]
    AlreadyRunning,
    #[error("display name must not be empty")]
    InvalidName,
    #[error("no person with id {0}")]
    UnknownPerson(PersonId),
    #[error("gallery read failed: {0}")]
    GalleryReadFailed(StoreError),
    #[error("invalid settings: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("extraction timed out after {0:?}")]
    ExtractionTimedOut(Duration),
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("descriptor does not fit the gallery: {0}")]
    Match(#[from] MatchError),
    #[error("extraction engine stopped")]
    EngineClosed,
}

impl From<AggregateError> for SessionError {
    fn from(e: AggregateError) -> Self {
        match e {
            AggregateError::EmptyInput => SessionError::EmptyInput,
            other => SessionError::ExtractionFailed(other.to_string()),
        }
    }
}

impl From<SessionError> for zbus::fdo::Error {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::InvalidName
            | SessionError::InvalidConfig(_)
            | SessionError::UnknownPerson(_) => {
                zbus::fdo::Error::InvalidArgs(e.to_string())
            }
            SessionError::ModelUnavailable(_) => zbus::fdo::Error::NotSupported(e.to_string()),
            other => zbus::fdo::Error::Failed(other.to_string()),
        }
    }
}
