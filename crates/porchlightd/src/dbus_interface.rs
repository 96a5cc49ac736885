use crate::detection::DetectionSession;
use crate::engine::{EngineHandle, Readiness};
use crate::enrollment::EnrollmentSession;
use crate::error::SessionError;
use crate::index::GalleryIndex;
use chrono::{Local, NaiveDate};
use porchlight_core::{PersonId, RecognitionConfig};
use porchlight_store::{
    EventId, GalleryStore, HistoryQuery, HistoryStore, KnownFilter, Person, PersonUpdate,
    SqliteStore, StoreError,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use zbus::interface;

pub const BUS_NAME: &str = "io.porchlight.Doorbell1";
pub const OBJECT_PATH: &str = "/io/porchlight/Doorbell1";

/// D-Bus interface for the Porchlight doorbell daemon.
///
/// Bus name: io.porchlight.Doorbell1
/// Object path: /io/porchlight/Doorbell1
pub struct DoorbellService {
    detection: Arc<DetectionSession>,
    enrollment: Arc<EnrollmentSession>,
    gallery: GalleryIndex,
    store: SqliteStore,
    engine: EngineHandle,
    camera: String,
    /// Used until settings have been saved once.
    defaults: RecognitionConfig,
    /// Held across session starts and settings updates, so a settings write
    /// never lands between a start's settings read and its state change.
    settings_guard: Mutex<()>,
}

/// Person as listed to clients, without the raw descriptor.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PersonSummary<'a> {
    id: PersonId,
    display_name: &'a str,
    enrollment_images: &'a [String],
    created_at: String,
}

impl<'a> From<&'a Person> for PersonSummary<'a> {
    fn from(p: &'a Person) -> Self {
        Self {
            id: p.id,
            display_name: &p.display_name,
            enrollment_images: &p.enrollment_images,
            created_at: p.created_at.to_rfc3339(),
        }
    }
}

fn store_err(e: StoreError) -> zbus::fdo::Error {
    tracing::warn!(error = %e, "store request failed");
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

impl DoorbellService {
    pub fn new(
        detection: Arc<DetectionSession>,
        enrollment: Arc<EnrollmentSession>,
        gallery: GalleryIndex,
        store: SqliteStore,
        engine: EngineHandle,
        camera: String,
        defaults: RecognitionConfig,
    ) -> Self {
        Self {
            detection,
            enrollment,
            gallery,
            store,
            engine,
            camera,
            defaults,
            settings_guard: Mutex::new(()),
        }
    }

    async fn settings(&self) -> zbus::fdo::Result<RecognitionConfig> {
        Ok(self
            .store
            .load_settings()
            .await
            .map_err(store_err)?
            .unwrap_or_else(|| self.defaults.clone()))
    }

    fn sessions_active(&self) -> bool {
        self.detection.is_active() || self.enrollment.is_active()
    }
}

#[interface(name = "io.porchlight.Doorbell1")]
impl DoorbellService {
    /// Start the detection loop with the current settings.
    async fn start_detection(&self) -> zbus::fdo::Result<()> {
        tracing::info!("start detection requested");
        let _guard = self.settings_guard.lock().await;
        let config = self.settings().await?;
        self.detection.start(config).await.map_err(Into::into)
    }

    async fn stop_detection(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop detection requested");
        self.detection.stop().await;
        Ok(())
    }

    async fn detection_status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.detection.status())
    }

    /// Start capturing enrollment samples for a new person.
    async fn start_enrollment(&self, name: &str) -> zbus::fdo::Result<()> {
        tracing::info!(name, "start enrollment requested");
        let _guard = self.settings_guard.lock().await;
        let config = self.settings().await?;
        self.enrollment.start(name, config).await.map_err(Into::into)
    }

    /// Capture new samples for an enrolled person, replacing their
    /// descriptor and enrollment images.
    async fn reenroll_person(&self, id: i64) -> zbus::fdo::Result<()> {
        tracing::info!(person_id = id, "re-enrollment requested");
        let _guard = self.settings_guard.lock().await;
        let config = self.settings().await?;
        self.enrollment
            .reenroll(PersonId(id), config)
            .await
            .map_err(Into::into)
    }

    /// Returns whether a capture was in progress.
    async fn cancel_enrollment(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("cancel enrollment requested");
        Ok(self.enrollment.cancel().await)
    }

    async fn enrollment_status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.enrollment.status())
    }

    async fn list_people(&self) -> zbus::fdo::Result<String> {
        let people = self.store.list_all().await.map_err(store_err)?;
        let summaries: Vec<PersonSummary<'_>> = people.iter().map(PersonSummary::from).collect();
        to_json(&summaries)
    }

    async fn rename_person(&self, id: i64, name: &str) -> zbus::fdo::Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SessionError::InvalidName.into());
        }
        let person = self
            .store
            .update(PersonId(id), PersonUpdate::Rename(name.to_string()))
            .await
            .map_err(|e| match e {
                StoreError::PersonNotFound(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
                other => store_err(other),
            })?;
        self.gallery.refresh().await.map_err(store_err)?;
        tracing::info!(person_id = %person.id, name, "person renamed");
        Ok(())
    }

    /// Delete a person. Their history entries keep the name.
    async fn remove_person(&self, id: i64) -> zbus::fdo::Result<bool> {
        let removed = self.store.delete(PersonId(id)).await.map_err(store_err)?;
        if removed {
            self.gallery.refresh().await.map_err(store_err)?;
        }
        Ok(removed)
    }

    /// One page of history. `filter` is all/known/unknown; `date` is
    /// YYYY-MM-DD or empty.
    async fn history(&self, page: u32, limit: u32, filter: &str, date: &str) -> zbus::fdo::Result<String> {
        let filter: KnownFilter = filter.parse().map_err(zbus::fdo::Error::InvalidArgs)?;
        let date = match date {
            "" => None,
            d => Some(
                NaiveDate::parse_from_str(d, "%Y-%m-%d")
                    .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("date {d:?}: {e}")))?,
            ),
        };
        let query = HistoryQuery {
            page: page.max(1),
            limit: if limit == 0 { HistoryQuery::default().limit } else { limit },
            filter,
            date,
        };
        let page = self.store.query(&query).await.map_err(store_err)?;
        to_json(&page)
    }

    async fn latest_detection(&self) -> zbus::fdo::Result<String> {
        to_json(&self.store.latest().await.map_err(store_err)?)
    }

    async fn today_summary(&self) -> zbus::fdo::Result<String> {
        let today = Local::now().date_naive();
        to_json(&self.store.summary_for(today).await.map_err(store_err)?)
    }

    async fn delete_detection(&self, id: i64) -> zbus::fdo::Result<bool> {
        self.store.delete_by_id(EventId(id)).await.map_err(store_err)
    }

    async fn clear_history(&self) -> zbus::fdo::Result<u64> {
        self.store.delete_all().await.map_err(store_err)
    }

    async fn get_settings(&self) -> zbus::fdo::Result<String> {
        to_json(&self.settings().await?)
    }

    /// Replace the recognition settings. Refused while a session runs.
    async fn update_settings(&self, json: &str) -> zbus::fdo::Result<()> {
        let _guard = self.settings_guard.lock().await;
        if self.sessions_active() {
            return Err(SessionError::AlreadyRunning.into());
        }
        let config: RecognitionConfig = serde_json::from_str(json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        config.validate().map_err(SessionError::from)?;
        self.store.save_settings(&config).await.map_err(store_err)?;
        tracing::info!(?config, "settings updated");
        Ok(())
    }

    async fn door_status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.store.door_state().await.map_err(store_err)?)
    }

    async fn set_locked(&self, locked: bool) -> zbus::fdo::Result<String> {
        to_json(&self.store.set_locked(locked).await.map_err(store_err)?)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let (recognition, reason) = match self.engine.readiness() {
            Readiness::Ready => ("ready", None),
            Readiness::Unavailable(reason) => ("unavailable", Some(reason.clone())),
        };
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "recognition": recognition,
            "reason": reason,
            "extractor": self.engine.kind(),
            "camera": self.camera,
            "detection": self.detection.status().state,
            "enrollment": self.enrollment.status().state,
            "gallerySize": self.gallery.current().index.len(),
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pipeline, BrokenExtractor, Harness, ScriptedExtractor};
    use chrono::{Duration, Utc};
    use porchlight_core::{Descriptor, ExtractError};
    use porchlight_store::{NewDetectionEvent, NewPerson};
    use serde_json::Value;

    fn service(h: &Harness) -> DoorbellService {
        DoorbellService::new(
            Arc::new(DetectionSession::new(h.pipeline.clone())),
            Arc::new(EnrollmentSession::new(h.pipeline.clone())),
            h.pipeline.gallery.clone(),
            h.store.clone(),
            h.pipeline.engine.clone(),
            "still:test".into(),
            RecognitionConfig::default(),
        )
    }

    fn no_faces() -> Box<ScriptedExtractor> {
        Box::new(ScriptedExtractor::new(|_| Err(ExtractError::NoFaceDetected)))
    }

    fn parse(raw: &str) -> Value {
        serde_json::from_str(raw).unwrap()
    }

    fn settings_json(threshold: f32) -> String {
        serde_json::to_string(&RecognitionConfig {
            distance_threshold: threshold,
            ..Default::default()
        })
        .unwrap()
    }

    fn threshold_of(raw: &str) -> f64 {
        parse(raw)["distanceThreshold"].as_f64().unwrap()
    }

    #[tokio::test]
    async fn test_update_settings_refused_while_detecting() {
        let h = pipeline(no_faces(), None).await;
        let svc = service(&h);

        svc.start_detection().await.unwrap();
        let err = svc.update_settings(&settings_json(0.4)).await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::Failed(_)), "{err:?}");
        assert!((threshold_of(&svc.get_settings().await.unwrap()) - 0.6).abs() < 1e-6);

        svc.stop_detection().await.unwrap();
        svc.update_settings(&settings_json(0.4)).await.unwrap();
        assert!((threshold_of(&svc.get_settings().await.unwrap()) - 0.4).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_update_settings_refused_while_enrolling() {
        let h = pipeline(no_faces(), None).await;
        let svc = service(&h);

        svc.start_enrollment("Kim").await.unwrap();
        assert!(svc.update_settings(&settings_json(0.4)).await.is_err());
        assert!(svc.cancel_enrollment().await.unwrap());
        svc.update_settings(&settings_json(0.4)).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_settings_validates() {
        let h = pipeline(no_faces(), None).await;
        let svc = service(&h);

        let err = svc.update_settings(&settings_json(1.5)).await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)), "{err:?}");
        let err = svc.update_settings("{not json").await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)), "{err:?}");
        assert!(h.store.load_settings().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_limit_zero_uses_default_page_size() {
        let h = pipeline(no_faces(), None).await;
        let svc = service(&h);
        let now = Utc::now();
        for i in 0..12 {
            h.store
                .append(NewDetectionEvent {
                    matched_identity_id: None,
                    matched_name: None,
                    captured_at: now - Duration::seconds(i),
                    image_ref: String::new(),
                    distance: 0.9,
                    is_known: false,
                })
                .await
                .unwrap();
        }

        let page = parse(&svc.history(1, 0, "all", "").await.unwrap());
        assert_eq!(page["entries"].as_array().unwrap().len(), 9);
        assert_eq!(page["total"], 12);

        // Page 0 is read as the first page.
        let page = parse(&svc.history(0, 5, "unknown", "").await.unwrap());
        assert_eq!(page["entries"].as_array().unwrap().len(), 5);

        let page = parse(&svc.history(1, 9, "known", "").await.unwrap());
        assert_eq!(page["total"], 0);

        let page = parse(&svc.history(1, 9, "all", "2001-01-01").await.unwrap());
        assert_eq!(page["total"], 0);
    }

    #[tokio::test]
    async fn test_history_bad_arguments() {
        let h = pipeline(no_faces(), None).await;
        let svc = service(&h);

        for (filter, date) in [("maybe", ""), ("all", "yesterday"), ("all", "2026-02-30")] {
            let err = svc.history(1, 9, filter, date).await.unwrap_err();
            assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)), "{filter} {date}: {err:?}");
        }
    }

    #[tokio::test]
    async fn test_rename_and_remove_refresh_index() {
        let h = pipeline(no_faces(), None).await;
        let svc = service(&h);
        let jo = h
            .store
            .insert(NewPerson {
                display_name: "Jo".into(),
                descriptor: Descriptor::new(vec![1.0, 0.0]),
                enrollment_images: Vec::new(),
            })
            .await
            .unwrap();
        h.pipeline.gallery.refresh().await.unwrap();

        svc.rename_person(jo.id.0, "  Joanna ").await.unwrap();
        assert_eq!(h.pipeline.gallery.current().name_of(jo.id), Some("Joanna"));

        let people = parse(&svc.list_people().await.unwrap());
        assert_eq!(people[0]["displayName"], "Joanna");
        assert!(people[0].get("descriptor").is_none());

        let err = svc.rename_person(jo.id.0, "   ").await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));
        let err = svc.rename_person(999, "Nobody").await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));

        assert!(svc.remove_person(jo.id.0).await.unwrap());
        assert!(h.pipeline.gallery.current().index.is_empty());
        assert!(!svc.remove_person(jo.id.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_reenroll_unknown_person_is_invalid() {
        let h = pipeline(no_faces(), None).await;
        let svc = service(&h);
        let err = svc.reenroll_person(77).await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_status_reports_unavailable_recognition() {
        let h = pipeline(Box::new(BrokenExtractor), None).await;
        let svc = service(&h);

        let status = parse(&svc.status().await.unwrap());
        assert_eq!(status["recognition"], "unavailable");
        assert!(status["reason"].as_str().unwrap().contains("det_10g"));
        assert_eq!(status["extractor"], "broken");
        assert_eq!(status["detection"], "idle");
        assert_eq!(status["gallerySize"], 0);

        let err = svc.start_detection().await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::NotSupported(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_status_reports_ready_recognition() {
        let h = pipeline(no_faces(), None).await;
        let status = parse(&service(&h).status().await.unwrap());
        assert_eq!(status["recognition"], "ready");
        assert!(status["reason"].is_null());
        assert_eq!(status["extractor"], "scripted");
        assert_eq!(status["camera"], "still:test");
    }

    #[tokio::test]
    async fn test_door_lock_round_trip() {
        let h = pipeline(no_faces(), None).await;
        let svc = service(&h);
        assert_eq!(parse(&svc.door_status().await.unwrap())["isLocked"], true);
        assert_eq!(parse(&svc.set_locked(false).await.unwrap())["isLocked"], false);
        assert_eq!(parse(&svc.door_status().await.unwrap())["isLocked"], false);
    }
}
