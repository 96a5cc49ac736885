//! Detection session: sample the camera on a fixed cadence, classify the
//! primary face against the gallery and record one history event per
//! classified frame.
//!
//! At most one sample is in flight. A tick that arrives while the previous
//! sample is still being classified is skipped, never queued. Per-frame
//! failures are logged and counted; they never stop the session.

use crate::error::SessionError;
use crate::pipeline::{Pipeline, SharedStream};
use chrono::{DateTime, Utc};
use porchlight_core::RecognitionConfig;
use porchlight_store::{DetectionEvent, NewDetectionEvent};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionStats {
    /// Ticks that started a sample.
    pub ticks: u64,
    /// Ticks dropped because a sample was still in flight.
    pub skipped_ticks: u64,
    pub events: u64,
    pub no_face: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionStatus {
    pub state: DetectionState,
    pub error: Option<String>,
    pub stats: DetectionStats,
    pub last_event: Option<DetectionEvent>,
}

struct RunningLoop {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct DetectionSession {
    pipeline: Arc<Pipeline>,
    status: Arc<watch::Sender<DetectionStatus>>,
    run: Mutex<Option<RunningLoop>>,
}

impl DetectionSession {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let (tx, _rx) = watch::channel(DetectionStatus::default());
        Self {
            pipeline,
            status: Arc::new(tx),
            run: Mutex::new(None),
        }
    }

    pub fn status(&self) -> DetectionStatus {
        self.status.borrow().clone()
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<DetectionStatus> {
        self.status.subscribe()
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status.borrow().state,
            DetectionState::Starting | DetectionState::Running | DetectionState::Stopping
        )
    }

    /// Acquire the camera and begin sampling with a snapshot of `config`.
    ///
    /// Camera and model failures are returned here and leave the session in
    /// `Error`; nothing retries on its own.
    pub async fn start(&self, config: RecognitionConfig) -> Result<(), SessionError> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            return Err(SessionError::AlreadyRunning);
        }
        config.validate()?;

        self.status.send_modify(|s| {
            s.state = DetectionState::Starting;
            s.error = None;
        });

        let stream = match self.pipeline.acquire().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "detection failed to start");
                self.status.send_modify(|s| {
                    s.state = DetectionState::Error;
                    s.error = Some(e.to_string());
                });
                return Err(e);
            }
        };

        self.status.send_modify(|s| {
            s.state = DetectionState::Running;
            s.stats = DetectionStats::default();
        });
        tracing::info!(
            interval_ms = config.sample_interval_ms,
            threshold = config.distance_threshold,
            "detection started"
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_loop(
            self.pipeline.clone(),
            stream,
            config,
            stop_rx,
            self.status.clone(),
        ));
        *run = Some(RunningLoop {
            stop: stop_tx,
            task,
        });
        Ok(())
    }

    /// Stop sampling and release the camera. A no-op when not running.
    ///
    /// A sample already in flight is allowed to finish and is recorded once.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        let Some(running) = run.take() else {
            return;
        };
        self.status.send_modify(|s| s.state = DetectionState::Stopping);
        let _ = running.stop.send(());
        if let Err(e) = running.task.await {
            tracing::warn!(error = %e, "detection loop ended abnormally");
        }
        self.status.send_modify(|s| s.state = DetectionState::Idle);
        tracing::info!("detection stopped");
    }
}

async fn run_loop(
    pipeline: Arc<Pipeline>,
    stream: SharedStream,
    config: RecognitionConfig,
    mut stop: oneshot::Receiver<()>,
    status: Arc<watch::Sender<DetectionStatus>>,
) {
    let mut ticker = tokio::time::interval(config.sample_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let threshold = config.distance_threshold;
    let mut in_flight: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {
                if in_flight.as_ref().is_some_and(|job| !job.is_finished()) {
                    status.send_modify(|s| s.stats.skipped_ticks += 1);
                    tracing::debug!("sample still in flight, tick skipped");
                    continue;
                }
                status.send_modify(|s| s.stats.ticks += 1);
                in_flight = Some(tokio::spawn(sample_once(
                    pipeline.clone(),
                    stream.clone(),
                    threshold,
                    status.clone(),
                )));
            }
        }
    }

    if let Some(job) = in_flight.take() {
        let _ = job.await;
    }
    drop(stream);
}

async fn sample_once(
    pipeline: Arc<Pipeline>,
    stream: SharedStream,
    threshold: f32,
    status: Arc<watch::Sender<DetectionStatus>>,
) {
    match classify(&pipeline, &stream, threshold).await {
        Ok(event) => status.send_modify(|s| {
            s.stats.events += 1;
            s.last_event = Some(event);
        }),
        Err(SessionError::NoFaceDetected) => status.send_modify(|s| s.stats.no_face += 1),
        Err(e) => {
            tracing::warn!(error = %e, "detection sample dropped");
            status.send_modify(|s| s.stats.failures += 1);
        }
    }
}

/// Capture, extract, match and persist one frame.
async fn classify(
    pipeline: &Pipeline,
    stream: &SharedStream,
    threshold: f32,
) -> Result<DetectionEvent, SessionError> {
    let (frame, extraction) = pipeline.sample(stream).await?;
    let gallery = pipeline.gallery.current();
    let result = gallery.index.find_best(&extraction.descriptor, threshold)?;
    let is_known = result.is_known();

    let image_ref = if pipeline.snapshot_policy.wants(is_known) {
        pipeline
            .save_snapshot("visitor", frame.clone(), extraction.face.clone())
            .await
            .unwrap_or_default()
    } else {
        String::new()
    };

    let appended = pipeline
        .history
        .append(NewDetectionEvent {
            matched_identity_id: result.person_id,
            matched_name: result
                .person_id
                .and_then(|id| gallery.name_of(id))
                .map(str::to_owned),
            captured_at: DateTime::<Utc>::from(frame.captured_at),
            image_ref: image_ref.clone(),
            distance: result.distance,
            is_known,
        })
        .await;
    let event = match appended {
        Ok(event) => event,
        Err(e) => {
            // No event will ever reference the snapshot.
            if !image_ref.is_empty() {
                if let Err(e) = tokio::fs::remove_file(&image_ref).await {
                    tracing::debug!(path = %image_ref, error = %e, "orphan snapshot not removed");
                }
            }
            return Err(SessionError::HistoryWriteFailed(e));
        }
    };

    tracing::info!(
        event_id = %event.id,
        person_id = ?event.matched_identity_id,
        distance = event.distance,
        known = is_known,
        "detection recorded"
    );
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        pipeline, BrokenExtractor, FailingHistory, FailingSource, Harness, ScriptedExtractor,
    };
    use porchlight_core::{Descriptor, ExtractError};
    use porchlight_store::{GalleryStore, HistoryStore, NewPerson};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn config(interval_ms: u64, threshold: f32) -> RecognitionConfig {
        RecognitionConfig {
            distance_threshold: threshold,
            sample_interval_ms: interval_ms,
            ..Default::default()
        }
    }

    async fn wait_for(session: &DetectionSession, pred: impl FnMut(&DetectionStatus) -> bool) {
        let mut rx = session.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
            .await
            .expect("condition not reached in time")
            .unwrap();
    }

    #[tokio::test]
    async fn test_known_then_unknown_visitor() {
        let extractor = ScriptedExtractor::new(|call| match call {
            0 => Ok(Descriptor::new(vec![1.0, 0.0, 0.0])),
            1 => Ok(Descriptor::new(vec![0.0, 1.0, 0.0])),
            _ => Err(ExtractError::NoFaceDetected),
        });
        let h: Harness = pipeline(Box::new(extractor), None).await;
        let a = h
            .store
            .insert(NewPerson {
                display_name: "A".into(),
                descriptor: Descriptor::new(vec![1.0, 0.0, 0.0]),
                enrollment_images: vec![],
            })
            .await
            .unwrap();
        h.pipeline.gallery.refresh().await.unwrap();

        let session = DetectionSession::new(h.pipeline.clone());
        session.start(config(20, 0.5)).await.unwrap();
        wait_for(&session, |s| s.stats.events >= 2 && s.stats.no_face >= 1).await;
        session.stop().await;

        let events = h.store.list_recent(10).await.unwrap();
        assert_eq!(events.len(), 2);
        let (unknown, known) = (&events[0], &events[1]);

        assert!(known.is_known);
        assert_eq!(known.matched_identity_id, Some(a.id));
        assert_eq!(known.matched_name.as_deref(), Some("A"));
        assert_eq!(known.distance, 0.0);

        assert!(!unknown.is_known);
        assert_eq!(unknown.matched_identity_id, None);
        assert!((unknown.distance - 2f32.sqrt()).abs() < 1e-5);
        assert_eq!(events.iter().filter(|e| !e.is_known).count(), 1);
        assert!(!unknown.image_ref.is_empty());
    }

    #[tokio::test]
    async fn test_tick_skipped_while_sample_in_flight() {
        let (extractor, gate) = ScriptedExtractor::gated(|_| Ok(Descriptor::new(vec![0.0, 1.0])));
        let calls = extractor.calls();
        let h = pipeline(Box::new(extractor), None).await;

        let session = DetectionSession::new(h.pipeline.clone());
        session.start(config(20, 0.5)).await.unwrap();
        // Several tick periods pass while the first extraction is blocked.
        wait_for(&session, |s| s.stats.skipped_ticks >= 3).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.status().stats.ticks, 1);
        assert_eq!(h.store.list_recent(10).await.unwrap().len(), 0);

        drop(gate);
        session.stop().await;
        let stats = session.status().stats;
        assert_eq!(stats.events, h.store.list_recent(100).await.unwrap().len() as u64);
        assert!(stats.events >= 1);
    }

    #[tokio::test]
    async fn test_empty_gallery_records_unknown() {
        let extractor = ScriptedExtractor::new(|call| match call {
            0 => Ok(Descriptor::new(vec![0.3, 0.4])),
            _ => Err(ExtractError::NoFaceDetected),
        });
        let h = pipeline(Box::new(extractor), None).await;
        let session = DetectionSession::new(h.pipeline.clone());
        session.start(config(20, 0.6)).await.unwrap();
        wait_for(&session, |s| s.stats.events >= 1).await;
        session.stop().await;

        let latest = h.store.latest().await.unwrap().unwrap();
        assert!(!latest.is_known);
        assert!(latest.distance.is_infinite());
    }

    #[tokio::test]
    async fn test_frame_failures_keep_running() {
        let extractor =
            ScriptedExtractor::new(|_| Err(ExtractError::InferenceFailed("bad tensor".into())));
        let h = pipeline(Box::new(extractor), None).await;
        let session = DetectionSession::new(h.pipeline.clone());
        session.start(config(10, 0.6)).await.unwrap();
        wait_for(&session, |s| s.stats.failures >= 3).await;

        assert_eq!(session.status().state, DetectionState::Running);
        session.stop().await;
        assert_eq!(session.status().state, DetectionState::Idle);
        assert!(h.store.latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_write_failure_dropped() {
        let extractor = ScriptedExtractor::new(|_| Ok(Descriptor::new(vec![1.0])));
        let h = pipeline(Box::new(extractor), None).await;
        let failing = Arc::new(FailingHistory::default());
        let pipeline = Arc::new(Pipeline {
            history: failing.clone(),
            ..(*h.pipeline).clone()
        });

        let session = DetectionSession::new(pipeline);
        session.start(config(10, 0.6)).await.unwrap();
        wait_for(&session, |s| s.stats.failures >= 2).await;
        session.stop().await;

        assert_eq!(session.status().stats.events, 0);
        // Each failed write was attempted exactly once per sample.
        assert_eq!(
            failing.attempts.load(Ordering::SeqCst) as u64,
            session.status().stats.failures
        );
        // Snapshots of unrecorded events are cleaned up.
        assert_eq!(std::fs::read_dir(h.snapshots.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_camera_unavailable_is_surfaced() {
        let extractor = ScriptedExtractor::new(|_| Ok(Descriptor::new(vec![1.0])));
        let h = pipeline(Box::new(extractor), Some(Arc::new(FailingSource))).await;
        let session = DetectionSession::new(h.pipeline.clone());

        let err = session.start(config(20, 0.6)).await.unwrap_err();
        assert!(matches!(err, SessionError::CameraUnavailable(_)));
        assert_eq!(session.status().state, DetectionState::Error);
        assert!(!session.is_active());

        // Explicit retry is allowed and fails the same way.
        let err = session.start(config(20, 0.6)).await.unwrap_err();
        assert!(matches!(err, SessionError::CameraUnavailable(_)));
    }

    #[tokio::test]
    async fn test_model_unavailable_is_surfaced() {
        let h = pipeline(Box::new(BrokenExtractor), None).await;
        let session = DetectionSession::new(h.pipeline.clone());
        let err = session.start(config(20, 0.6)).await.unwrap_err();
        assert!(matches!(err, SessionError::ModelUnavailable(_)));
        assert_eq!(session.status().state, DetectionState::Error);
    }

    #[tokio::test]
    async fn test_start_twice_and_stop_idempotent() {
        let extractor = ScriptedExtractor::new(|_| Err(ExtractError::NoFaceDetected));
        let h = pipeline(Box::new(extractor), None).await;
        let session = DetectionSession::new(h.pipeline.clone());

        session.stop().await;
        assert_eq!(session.status().state, DetectionState::Idle);

        session.start(config(50, 0.6)).await.unwrap();
        assert!(session.is_active());
        assert!(matches!(
            session.start(config(50, 0.6)).await,
            Err(SessionError::AlreadyRunning)
        ));

        session.stop().await;
        session.stop().await;
        assert_eq!(session.status().state, DetectionState::Idle);
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_invalid_threshold_rejected() {
        let extractor = ScriptedExtractor::new(|_| Err(ExtractError::NoFaceDetected));
        let h = pipeline(Box::new(extractor), None).await;
        let session = DetectionSession::new(h.pipeline.clone());
        let err = session.start(config(20, 1.5)).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidConfig(_)));
        assert_eq!(session.status().state, DetectionState::Idle);
    }
}
