//! Fakes shared by the session tests.

use crate::config::SnapshotPolicy;
use crate::engine::spawn_engine;
use crate::index::GalleryIndex;
use crate::pipeline::Pipeline;
use crate::snapshot::SnapshotWriter;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use porchlight_core::{BoundingBox, Descriptor, ExtractError, Extraction, Extractor, PersonId};
use porchlight_hw::{CameraError, Frame, StillSource, VideoSource, VideoStream};
use porchlight_store::{
    DailySummary, DetectionEvent, EventId, GalleryStore, HistoryPage, HistoryQuery, HistoryStore,
    NewDetectionEvent, NewPerson, Person, PersonUpdate, SqliteStore, StoreError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

type Script = Box<dyn FnMut(usize) -> Result<Descriptor, ExtractError> + Send>;

/// Answers each call from a script indexed by call number. A gated extractor
/// blocks every call until the gate sender is dropped.
pub struct ScriptedExtractor {
    script: Script,
    calls: Arc<AtomicUsize>,
    gate: Option<mpsc::Receiver<()>>,
}

impl ScriptedExtractor {
    pub fn new(script: impl FnMut(usize) -> Result<Descriptor, ExtractError> + Send + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Arc::new(AtomicUsize::new(0)),
            gate: None,
        }
    }

    pub fn gated(
        script: impl FnMut(usize) -> Result<Descriptor, ExtractError> + Send + 'static,
    ) -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let mut extractor = Self::new(script);
        extractor.gate = Some(rx);
        (extractor, tx)
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Extractor for ScriptedExtractor {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    fn initialize(&mut self) -> Result<(), ExtractError> {
        Ok(())
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn extract(&mut self, _frame: &[u8], width: u32, height: u32) -> Result<Extraction, ExtractError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _ = gate.recv();
        }
        (self.script)(call).map(|descriptor| Extraction {
            descriptor,
            face: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: width as f32,
                height: height as f32,
                confidence: 1.0,
                landmarks: None,
            },
        })
    }
}

/// Extractor whose models never load.
pub struct BrokenExtractor;

impl Extractor for BrokenExtractor {
    fn kind(&self) -> &'static str {
        "broken"
    }

    fn initialize(&mut self) -> Result<(), ExtractError> {
        Err(ExtractError::ModelUnavailable("det_10g.onnx missing".into()))
    }

    fn is_ready(&self) -> bool {
        false
    }

    fn extract(&mut self, _: &[u8], _: u32, _: u32) -> Result<Extraction, ExtractError> {
        Err(ExtractError::NotInitialized)
    }
}

pub struct FailingSource;

impl VideoSource for FailingSource {
    fn describe(&self) -> String {
        "failing".into()
    }

    fn acquire(&self) -> Result<Box<dyn VideoStream>, CameraError> {
        Err(CameraError::DeviceNotFound("/dev/video9".into()))
    }
}

/// Gallery that counts inserts on top of a real store.
pub struct CountingGallery {
    inner: SqliteStore,
    pub inserts: AtomicUsize,
}

#[async_trait]
impl GalleryStore for CountingGallery {
    async fn list_all(&self) -> Result<Vec<Person>, StoreError> {
        self.inner.list_all().await
    }

    async fn get(&self, id: PersonId) -> Result<Option<Person>, StoreError> {
        self.inner.get(id).await
    }

    async fn insert(&self, person: NewPerson) -> Result<Person, StoreError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.inner.insert(person).await
    }

    async fn update(&self, id: PersonId, update: PersonUpdate) -> Result<Person, StoreError> {
        self.inner.update(id, update).await
    }

    async fn delete(&self, id: PersonId) -> Result<bool, StoreError> {
        self.inner.delete(id).await
    }
}

/// History whose appends always fail.
#[derive(Default)]
pub struct FailingHistory {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl HistoryStore for FailingHistory {
    async fn append(&self, _event: NewDetectionEvent) -> Result<DetectionEvent, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
    }

    async fn list_recent(&self, _n: u32) -> Result<Vec<DetectionEvent>, StoreError> {
        Ok(Vec::new())
    }

    async fn query(&self, _query: &HistoryQuery) -> Result<HistoryPage, StoreError> {
        Ok(HistoryPage { entries: Vec::new(), total: 0 })
    }

    async fn latest(&self) -> Result<Option<DetectionEvent>, StoreError> {
        Ok(None)
    }

    async fn summary_for(&self, _day: NaiveDate) -> Result<DailySummary, StoreError> {
        Ok(DailySummary::default())
    }

    async fn delete_by_id(&self, _id: EventId) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        Ok(0)
    }

    async fn delete_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(0)
    }
}

pub struct Harness {
    pub pipeline: Arc<Pipeline>,
    pub store: SqliteStore,
    pub gallery: Arc<CountingGallery>,
    pub snapshots: tempfile::TempDir,
}

/// Pipeline over an in-memory store and a bright still frame, unless another
/// source is given.
pub async fn pipeline(extractor: Box<dyn Extractor>, source: Option<Arc<dyn VideoSource>>) -> Harness {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let gallery = Arc::new(CountingGallery {
        inner: store.clone(),
        inserts: AtomicUsize::new(0),
    });
    let source: Arc<dyn VideoSource> = match source {
        Some(source) => source,
        None => {
            let frame = Frame::new(vec![180u8; 64 * 48], 64, 48).unwrap();
            Arc::new(StillSource::new("test", frame))
        }
    };
    let snapshots = tempfile::tempdir().unwrap();

    let pipeline = Pipeline {
        engine: spawn_engine(extractor).unwrap(),
        source,
        gallery: GalleryIndex::new(gallery.clone()),
        history: Arc::new(store.clone()),
        snapshots: SnapshotWriter::new(snapshots.path()),
        snapshot_policy: SnapshotPolicy::All,
        extract_timeout: Duration::from_secs(5),
    };
    Harness {
        pipeline: Arc::new(pipeline),
        store,
        gallery,
        snapshots,
    }
}
