//! Collaborators shared by the detection and enrollment sessions.

use crate::config::SnapshotPolicy;
use crate::engine::EngineHandle;
use crate::error::SessionError;
use crate::index::GalleryIndex;
use crate::snapshot::SnapshotWriter;
use porchlight_core::{BoundingBox, Extraction};
use porchlight_hw::{CameraError, Frame, VideoSource, VideoStream};
use porchlight_store::HistoryStore;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// An acquired stream. The camera is released when the last clone drops.
pub type SharedStream = Arc<Mutex<Box<dyn VideoStream>>>;

#[derive(Clone)]
pub struct Pipeline {
    pub engine: EngineHandle,
    pub source: Arc<dyn VideoSource>,
    pub gallery: GalleryIndex,
    pub history: Arc<dyn HistoryStore>,
    pub snapshots: SnapshotWriter,
    pub snapshot_policy: SnapshotPolicy,
    pub extract_timeout: Duration,
}

impl Pipeline {
    /// Checks the extractor, then opens the video source.
    pub async fn acquire(&self) -> Result<SharedStream, SessionError> {
        self.engine.ensure_ready()?;
        let source = self.source.clone();
        let stream = tokio::task::spawn_blocking(move || source.acquire())
            .await
            .map_err(|e| SessionError::CameraUnavailable(e.to_string()))?
            .map_err(|e| SessionError::CameraUnavailable(e.to_string()))?;
        tracing::info!(source = %self.source.describe(), "video source acquired");
        Ok(Arc::new(Mutex::new(stream)))
    }

    pub async fn capture(&self, stream: &SharedStream) -> Result<Arc<Frame>, SessionError> {
        let stream = stream.clone();
        let frame = tokio::task::spawn_blocking(move || {
            let mut guard = stream
                .lock()
                .map_err(|_| CameraError::CaptureFailed("stream lock poisoned".into()))?;
            guard.current_frame()
        })
        .await
        .map_err(|e| SessionError::CameraUnavailable(e.to_string()))?
        .map_err(|e| SessionError::CameraUnavailable(e.to_string()))?;
        Ok(Arc::new(frame))
    }

    /// One capture plus extraction.
    pub async fn sample(&self, stream: &SharedStream) -> Result<(Arc<Frame>, Extraction), SessionError> {
        let frame = self.capture(stream).await?;
        let extraction = self.engine.extract(frame.clone(), self.extract_timeout).await?;
        Ok((frame, extraction))
    }

    /// Writes a face crop. Failures are logged and yield `None`.
    pub async fn save_snapshot(&self, prefix: &'static str, frame: Arc<Frame>, face: BoundingBox) -> Option<String> {
        let writer = self.snapshots.clone();
        match tokio::task::spawn_blocking(move || writer.save(prefix, &frame, &face)).await {
            Ok(Ok(path)) => Some(path.to_string_lossy().into_owned()),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "snapshot not saved");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "snapshot task failed");
                None
            }
        }
    }
}
