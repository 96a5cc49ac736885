//! porchlight-core: face descriptors, matching and enrollment aggregation.
//!
//! Detection (SCRFD) and embedding (ArcFace) run on ONNX Runtime behind the
//! [`Extractor`] capability; matching and aggregation are plain vector math.

pub mod aggregate;
pub mod alignment;
pub mod config;
pub mod detector;
pub mod extractor;
pub mod matcher;
pub mod mock;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use aggregate::{aggregate, AggregateError};
pub use config::{ConfigError, RecognitionConfig};
pub use extractor::{select_primary_face, ExtractError, Extractor, OnnxExtractor};
pub use matcher::{FaceIndex, MatchError, MatchResult};
pub use mock::MockExtractor;
pub use types::{BoundingBox, Descriptor, Extraction, PersonId};

/// `$XDG_DATA_HOME/porchlight/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}

/// `$XDG_DATA_HOME/porchlight`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("porchlight")
}
