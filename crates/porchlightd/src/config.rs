use porchlight_core::RecognitionConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which detections get a JPEG snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPolicy {
    All,
    Unknown,
    None,
}

impl SnapshotPolicy {
    pub fn wants(self, is_known: bool) -> bool {
        match self {
            SnapshotPolicy::All => true,
            SnapshotPolicy::Unknown => !is_known,
            SnapshotPolicy::None => false,
        }
    }
}

impl FromStr for SnapshotPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "unknown" => Ok(Self::Unknown),
            "none" => Ok(Self::None),
            other => Err(format!("unknown snapshot policy {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorKind {
    Onnx,
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 device path, or a still image served as a static source.
    pub camera_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// SQLite database file; `:memory:` keeps everything in memory.
    pub db_path: String,
    pub snapshot_dir: PathBuf,
    pub extractor: ExtractorKind,
    pub distance_threshold: f32,
    pub sample_interval_ms: u64,
    pub enroll_duration_secs: u64,
    pub enroll_target_frames: u32,
    /// Upper bound on a single extraction call.
    pub extract_timeout_ms: u64,
    pub snapshot_policy: SnapshotPolicy,
    /// Days of history to keep; 0 keeps everything.
    pub history_retention_days: u32,
    /// Apply CLAHE to camera frames before extraction.
    pub enhance_contrast: bool,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `PORCHLIGHT_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = porchlight_core::default_data_dir();

        let model_dir = std::env::var("PORCHLIGHT_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| porchlight_core::default_model_dir());

        let db_path = std::env::var("PORCHLIGHT_DB_PATH")
            .unwrap_or_else(|_| data_dir.join("doorbell.db").to_string_lossy().into_owned());

        let snapshot_dir = std::env::var("PORCHLIGHT_SNAPSHOT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("snapshots"));

        let extractor = match std::env::var("PORCHLIGHT_EXTRACTOR").as_deref() {
            Ok("mock") => ExtractorKind::Mock,
            Ok("onnx") | Err(_) => ExtractorKind::Onnx,
            Ok(other) => {
                tracing::warn!(value = other, "unknown PORCHLIGHT_EXTRACTOR; using onnx");
                ExtractorKind::Onnx
            }
        };

        let snapshot_policy = std::env::var("PORCHLIGHT_SNAPSHOT_POLICY")
            .ok()
            .and_then(|v| match v.parse() {
                Ok(policy) => Some(policy),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring PORCHLIGHT_SNAPSHOT_POLICY");
                    None
                }
            })
            .unwrap_or(SnapshotPolicy::All);

        let bus = match std::env::var("PORCHLIGHT_BUS").as_deref() {
            Ok("system") => BusKind::System,
            _ => BusKind::Session,
        };

        Self {
            camera_device: std::env::var("PORCHLIGHT_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir,
            db_path,
            snapshot_dir,
            extractor,
            distance_threshold: env_parse("PORCHLIGHT_DISTANCE_THRESHOLD", 0.6),
            sample_interval_ms: env_parse("PORCHLIGHT_SAMPLE_INTERVAL_MS", 500),
            enroll_duration_secs: env_parse("PORCHLIGHT_ENROLL_DURATION_SECS", 30),
            enroll_target_frames: env_parse("PORCHLIGHT_ENROLL_TARGET_FRAMES", 60),
            extract_timeout_ms: env_parse("PORCHLIGHT_EXTRACT_TIMEOUT_MS", 5000),
            snapshot_policy,
            history_retention_days: env_parse("PORCHLIGHT_HISTORY_RETENTION_DAYS", 90),
            enhance_contrast: std::env::var("PORCHLIGHT_ENHANCE_CONTRAST")
                .map(|v| v != "0")
                .unwrap_or(true),
            bus,
        }
    }

    /// Recognition settings used to seed the settings row on first run.
    pub fn recognition_defaults(&self) -> RecognitionConfig {
        RecognitionConfig {
            distance_threshold: self.distance_threshold,
            sample_interval_ms: self.sample_interval_ms,
            enrollment_duration_sec: self.enroll_duration_secs,
            enrollment_target_frame_count: self.enroll_target_frames,
        }
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_millis(self.extract_timeout_ms)
    }

    pub fn in_memory_db(&self) -> bool {
        self.db_path == ":memory:"
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
