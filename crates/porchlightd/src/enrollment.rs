//! Enrollment session: capture face samples over a fixed window, then store
//! the mean of their descriptors as a new person or as a replacement for an
//! existing person's descriptor.

use crate::error::SessionError;
use crate::pipeline::{Pipeline, SharedStream};
use porchlight_core::{aggregate, Extraction, PersonId, RecognitionConfig};
use porchlight_hw::Frame;
use porchlight_store::{NewPerson, Person, PersonUpdate};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentState {
    #[default]
    Idle,
    Capturing,
    Finishing,
    Error,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentStatus {
    pub state: EnrollmentState,
    pub name: Option<String>,
    /// Set while re-enrolling an existing person.
    pub reenrolling: Option<PersonId>,
    /// Frames that produced a descriptor.
    pub captured: u32,
    /// Capture ticks so far.
    pub attempts: u32,
    pub target: u32,
    pub error: Option<String>,
    /// Person created or updated by the last successful enrollment.
    pub enrolled: Option<PersonId>,
}

/// Where the aggregated descriptor goes.
#[derive(Debug, Clone)]
enum Subject {
    New(String),
    Existing { id: PersonId, name: String },
}

impl Subject {
    fn name(&self) -> &str {
        match self {
            Subject::New(name) | Subject::Existing { name, .. } => name,
        }
    }

    fn existing_id(&self) -> Option<PersonId> {
        match self {
            Subject::New(_) => None,
            Subject::Existing { id, .. } => Some(*id),
        }
    }
}

/// How an enrollment task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Stored(PersonId),
    Discarded,
    Failed,
}

struct Sample {
    frame: Arc<Frame>,
    extraction: Extraction,
}

struct RunningEnrollment {
    cancel: oneshot::Sender<()>,
    task: JoinHandle<Outcome>,
}

pub struct EnrollmentSession {
    pipeline: Arc<Pipeline>,
    status: Arc<watch::Sender<EnrollmentStatus>>,
    run: Mutex<Option<RunningEnrollment>>,
}

impl EnrollmentSession {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let (tx, _rx) = watch::channel(EnrollmentStatus::default());
        Self {
            pipeline,
            status: Arc::new(tx),
            run: Mutex::new(None),
        }
    }

    pub fn status(&self) -> EnrollmentStatus {
        self.status.borrow().clone()
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<EnrollmentStatus> {
        self.status.subscribe()
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status.borrow().state,
            EnrollmentState::Capturing | EnrollmentState::Finishing
        )
    }

    /// Begin capturing samples for a new person called `display_name`.
    ///
    /// Captures run every `duration / target` until either the target count
    /// of usable samples is reached or the duration elapses.
    pub async fn start(&self, display_name: &str, config: RecognitionConfig) -> Result<(), SessionError> {
        let name = display_name.trim().to_string();
        if name.is_empty() {
            return Err(SessionError::InvalidName);
        }
        self.begin(Subject::New(name), config).await
    }

    /// Capture fresh samples for an enrolled person and replace their
    /// descriptor and enrollment images together.
    pub async fn reenroll(&self, id: PersonId, config: RecognitionConfig) -> Result<(), SessionError> {
        let person = self
            .pipeline
            .gallery
            .store()
            .get(id)
            .await
            .map_err(SessionError::GalleryReadFailed)?
            .ok_or(SessionError::UnknownPerson(id))?;
        self.begin(
            Subject::Existing {
                id,
                name: person.display_name,
            },
            config,
        )
        .await
    }

    async fn begin(&self, subject: Subject, config: RecognitionConfig) -> Result<(), SessionError> {
        config.validate()?;

        let mut run = self.run.lock().await;
        if run.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(SessionError::AlreadyRunning);
        }

        let stream = match self.pipeline.acquire().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "enrollment failed to start");
                self.status.send_replace(EnrollmentStatus {
                    state: EnrollmentState::Error,
                    name: Some(subject.name().to_string()),
                    reenrolling: subject.existing_id(),
                    error: Some(e.to_string()),
                    ..Default::default()
                });
                return Err(e);
            }
        };

        self.status.send_replace(EnrollmentStatus {
            state: EnrollmentState::Capturing,
            name: Some(subject.name().to_string()),
            reenrolling: subject.existing_id(),
            target: config.enrollment_target_frame_count,
            ..Default::default()
        });
        tracing::info!(
            name = %subject.name(),
            person_id = ?subject.existing_id(),
            duration_sec = config.enrollment_duration_sec,
            target = config.enrollment_target_frame_count,
            "enrollment started"
        );

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(run_enrollment(
            self.pipeline.clone(),
            stream,
            subject,
            config,
            cancel_rx,
            self.status.clone(),
        ));
        *run = Some(RunningEnrollment {
            cancel: cancel_tx,
            task,
        });
        Ok(())
    }

    /// Discard everything captured so far. Returns `true` only when the
    /// capture was actually discarded; an enrollment that already reached
    /// its gallery write is left to finish and reports `false`.
    pub async fn cancel(&self) -> bool {
        let mut run = self.run.lock().await;
        let Some(running) = run.take() else {
            return false;
        };
        let _ = running.cancel.send(());
        match running.task.await {
            Ok(outcome) => outcome == Outcome::Discarded,
            Err(e) => {
                tracing::warn!(error = %e, "enrollment task ended abnormally");
                false
            }
        }
    }
}

fn discard(status: &watch::Sender<EnrollmentStatus>, name: &str, samples: usize) -> Outcome {
    tracing::info!(name = %name, discarded = samples, "enrollment cancelled");
    status.send_modify(|s| {
        s.state = EnrollmentState::Idle;
        s.captured = 0;
    });
    Outcome::Discarded
}

async fn run_enrollment(
    pipeline: Arc<Pipeline>,
    stream: SharedStream,
    subject: Subject,
    config: RecognitionConfig,
    mut cancel: oneshot::Receiver<()>,
    status: Arc<watch::Sender<EnrollmentStatus>>,
) -> Outcome {
    let target = config.enrollment_target_frame_count as usize;
    let mut ticker = tokio::time::interval(config.enrollment_capture_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let deadline = tokio::time::sleep(config.enrollment_duration());
    tokio::pin!(deadline);

    let mut samples: Vec<Sample> = Vec::with_capacity(target);
    loop {
        tokio::select! {
            biased;
            _ = &mut cancel => return discard(&status, subject.name(), samples.len()),
            _ = &mut deadline => {
                tracing::debug!(captured = samples.len(), "enrollment window elapsed");
                break;
            }
            _ = ticker.tick() => {
                match pipeline.sample(&stream).await {
                    Ok((frame, extraction)) => samples.push(Sample { frame, extraction }),
                    Err(SessionError::NoFaceDetected) => {}
                    Err(e) => tracing::warn!(error = %e, "enrollment sample dropped"),
                }
                let captured = samples.len() as u32;
                status.send_modify(|s| {
                    s.attempts += 1;
                    s.captured = captured;
                });
                if samples.len() >= target {
                    break;
                }
            }
        }
    }
    drop(stream);

    // A cancel that arrived while the last sample was in flight still wins.
    if cancel.try_recv().is_ok() {
        return discard(&status, subject.name(), samples.len());
    }

    status.send_modify(|s| s.state = EnrollmentState::Finishing);
    match finish(&pipeline, &subject, samples).await {
        Ok(person) => {
            status.send_modify(|s| {
                s.state = EnrollmentState::Idle;
                s.enrolled = Some(person.id);
            });
            Outcome::Stored(person.id)
        }
        Err(e) => {
            tracing::warn!(name = %subject.name(), error = %e, "enrollment failed");
            status.send_modify(|s| {
                s.state = EnrollmentState::Error;
                s.error = Some(e.to_string());
            });
            Outcome::Failed
        }
    }
}

/// Save the sample crops, aggregate their descriptors and store the result.
/// Writes nothing when no sample is usable.
async fn finish(pipeline: &Pipeline, subject: &Subject, samples: Vec<Sample>) -> Result<Person, SessionError> {
    if samples.is_empty() {
        return Err(SessionError::NoUsableSamples);
    }

    let mut descriptors = Vec::with_capacity(samples.len());
    let mut images = Vec::with_capacity(samples.len());
    for Sample { frame, extraction } in samples {
        // A descriptor is kept only together with the image it came from.
        if let Some(path) = pipeline.save_snapshot("enroll", frame, extraction.face).await {
            images.push(path);
            descriptors.push(extraction.descriptor);
        }
    }
    if descriptors.is_empty() {
        return Err(SessionError::NoUsableSamples);
    }

    let descriptor = aggregate(&descriptors)?;
    let store = pipeline.gallery.store();
    let (person, replaced) = match subject {
        Subject::New(name) => {
            let person = store
                .insert(NewPerson {
                    display_name: name.clone(),
                    descriptor,
                    enrollment_images: images,
                })
                .await
                .map_err(SessionError::GalleryWriteFailed)?;
            (person, Vec::new())
        }
        Subject::Existing { id, .. } => {
            let previous = match store.get(*id).await {
                Ok(Some(p)) => p.enrollment_images,
                _ => Vec::new(),
            };
            let person = store
                .update(
                    *id,
                    PersonUpdate::Reenroll {
                        descriptor,
                        enrollment_images: images,
                    },
                )
                .await
                .map_err(SessionError::GalleryWriteFailed)?;
            (person, previous)
        }
    };

    for old in replaced.iter().filter(|p| !person.enrollment_images.contains(p)) {
        if let Err(e) = tokio::fs::remove_file(old).await {
            tracing::debug!(path = %old, error = %e, "old enrollment image not removed");
        }
    }

    if let Err(e) = pipeline.gallery.refresh().await {
        tracing::warn!(error = %e, "gallery index not refreshed after enrollment");
    }
    tracing::info!(
        person_id = %person.id,
        name = %person.display_name,
        samples = person.enrollment_images.len(),
        reenrolled = subject.existing_id().is_some(),
        "enrollment complete"
    );
    Ok(person)
}
