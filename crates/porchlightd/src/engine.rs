use crate::error::SessionError;
use porchlight_core::{ExtractError, Extraction, Extractor};
use porchlight_hw::Frame;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Messages sent from sessions to the engine thread.
enum EngineRequest {
    Extract {
        frame: Arc<Frame>,
        reply: oneshot::Sender<Result<Extraction, ExtractError>>,
    },
}

/// Whether the extractor initialized, fixed at spawn time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Unavailable(String),
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    kind: &'static str,
    readiness: Readiness,
}

impl EngineHandle {
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    /// Fails with `ModelUnavailable` when the extractor never initialized.
    pub fn ensure_ready(&self) -> Result<(), SessionError> {
        match &self.readiness {
            Readiness::Ready => Ok(()),
            Readiness::Unavailable(reason) => Err(SessionError::ModelUnavailable(reason.clone())),
        }
    }

    /// Extract the primary face descriptor from `frame`.
    ///
    /// The reply is abandoned after `timeout`; the engine finishes that frame
    /// before serving the next request.
    pub async fn extract(&self, frame: Arc<Frame>, timeout: Duration) -> Result<Extraction, SessionError> {
        self.ensure_ready()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Extract {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::EngineClosed)?;

        let result = tokio::time::timeout(timeout, reply_rx)
            .await
            .map_err(|_| SessionError::ExtractionTimedOut(timeout))?
            .map_err(|_| SessionError::EngineClosed)?;

        result.map_err(|e| match e {
            ExtractError::NoFaceDetected => SessionError::NoFaceDetected,
            ExtractError::ModelUnavailable(reason) => SessionError::ModelUnavailable(reason),
            ExtractError::NotInitialized => {
                SessionError::ModelUnavailable("extractor not initialized".into())
            }
            ExtractError::InferenceFailed(msg) => SessionError::ExtractionFailed(msg),
        })
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Initializes the extractor first. An initialization failure does not stop
/// the daemon: the handle reports `Unavailable` and sessions refuse to start.
pub fn spawn_engine(mut extractor: Box<dyn Extractor>) -> std::io::Result<EngineHandle> {
    let kind = extractor.kind();
    let readiness = match extractor.initialize() {
        Ok(()) => {
            tracing::info!(extractor = kind, "extractor ready");
            Readiness::Ready
        }
        Err(e) => {
            tracing::error!(extractor = kind, error = %e, "extractor failed to initialize");
            Readiness::Unavailable(e.to_string())
        }
    };

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("porchlight-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Extract { frame, reply } => {
                        let result = extractor.extract(&frame.data, frame.width, frame.height);
                        if let Err(e) = &result {
                            tracing::trace!(error = %e, sequence = frame.sequence, "extract");
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, kind, readiness })
}
