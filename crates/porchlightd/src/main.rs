use anyhow::{Context, Result};
use porchlight_core::{Extractor, MockExtractor, OnnxExtractor};
use porchlight_hw::VideoSource;
use porchlight_store::{GalleryStore, HistoryStore, SqliteStore};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod detection;
mod engine;
mod enrollment;
mod error;
mod index;
mod pipeline;
mod retention;
mod snapshot;
#[cfg(test)]
mod testing;

use config::{BusKind, Config, ExtractorKind};
use dbus_interface::{DoorbellService, BUS_NAME, OBJECT_PATH};
use detection::DetectionSession;
use enrollment::EnrollmentSession;
use index::GalleryIndex;
use pipeline::Pipeline;
use snapshot::SnapshotWriter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        camera = %config.camera_device,
        db = %config.db_path,
        models = %config.model_dir.display(),
        "porchlightd starting"
    );

    let store = if config.in_memory_db() {
        SqliteStore::open_in_memory().await?
    } else {
        SqliteStore::open(&config.db_path)
            .await
            .with_context(|| format!("opening database {}", config.db_path))?
    };

    let defaults = config.recognition_defaults();
    defaults.validate().context("invalid recognition settings in environment")?;
    if store.load_settings().await?.is_none() {
        store.save_settings(&defaults).await?;
        tracing::info!("settings initialized from environment");
    }

    let extractor: Box<dyn Extractor> = match config.extractor {
        ExtractorKind::Onnx => Box::new(OnnxExtractor::new(config.model_dir.clone())),
        ExtractorKind::Mock => Box::new(MockExtractor::new()),
    };
    let engine = engine::spawn_engine(extractor)?;

    let source: Arc<dyn VideoSource> =
        Arc::from(porchlight_hw::source_for(&config.camera_device, config.enhance_contrast)?);

    let gallery_store: Arc<dyn GalleryStore> = Arc::new(store.clone());
    let history: Arc<dyn HistoryStore> = Arc::new(store.clone());

    let gallery = GalleryIndex::new(gallery_store);
    gallery.refresh().await?;

    let _retention = retention::spawn_retention(history.clone(), config.history_retention_days);

    let pipeline = Arc::new(Pipeline {
        engine: engine.clone(),
        source: source.clone(),
        gallery: gallery.clone(),
        history,
        snapshots: SnapshotWriter::new(config.snapshot_dir.clone()),
        snapshot_policy: config.snapshot_policy,
        extract_timeout: config.extract_timeout(),
    });
    let detection = Arc::new(DetectionSession::new(pipeline.clone()));
    let enrollment = Arc::new(EnrollmentSession::new(pipeline));

    let service = DoorbellService::new(
        detection.clone(),
        enrollment.clone(),
        gallery,
        store,
        engine,
        source.describe(),
        defaults,
    );

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "porchlightd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("porchlightd shutting down");

    detection.stop().await;
    enrollment.cancel().await;

    Ok(())
}
