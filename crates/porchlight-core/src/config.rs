//! Recognition parameters shared by the detection and enrollment sessions.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("distance threshold {0} outside [0, 1]")]
    ThresholdOutOfRange(f32),
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
    #[error("{field} must be at most {max}")]
    TooLarge { field: &'static str, max: u64 },
}

/// Upper bounds on the accepted settings.
pub const MAX_SAMPLE_INTERVAL_MS: u64 = 60_000;
pub const MAX_ENROLLMENT_DURATION_SEC: u64 = 600;
pub const MAX_ENROLLMENT_TARGET_FRAMES: u32 = 600;

/// Snapshot of recognition settings, read once at session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionConfig {
    /// Maximum descriptor distance still classified as a known person.
    pub distance_threshold: f32,
    /// Detection sampling cadence.
    pub sample_interval_ms: u64,
    /// Enrollment capture window.
    pub enrollment_duration_sec: u64,
    /// Enrollment stops early once this many frames produced a descriptor.
    pub enrollment_target_frame_count: u32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            distance_threshold: 0.6,
            sample_interval_ms: 500,
            enrollment_duration_sec: 30,
            enrollment_target_frame_count: 60,
        }
    }
}

impl RecognitionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.distance_threshold) {
            return Err(ConfigError::ThresholdOutOfRange(self.distance_threshold));
        }
        check_range("sampleIntervalMs", self.sample_interval_ms, MAX_SAMPLE_INTERVAL_MS)?;
        check_range(
            "enrollmentDurationSec",
            self.enrollment_duration_sec,
            MAX_ENROLLMENT_DURATION_SEC,
        )?;
        check_range(
            "enrollmentTargetFrameCount",
            u64::from(self.enrollment_target_frame_count),
            u64::from(MAX_ENROLLMENT_TARGET_FRAMES),
        )?;
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn enrollment_duration(&self) -> Duration {
        Duration::from_secs(self.enrollment_duration_sec)
    }

    /// Enrollment capture cadence: duration spread evenly over the target count.
    pub fn enrollment_capture_interval(&self) -> Duration {
        let total_ms = self.enrollment_duration_sec.saturating_mul(1000);
        Duration::from_millis((total_ms / u64::from(self.enrollment_target_frame_count.max(1))).max(1))
    }
}

fn check_range(field: &'static str, value: u64, max: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::NotPositive(field));
    }
    if value > max {
        return Err(ConfigError::TooLarge { field, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RecognitionConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.enrollment_capture_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_threshold_range() {
        let mut config = RecognitionConfig::default();
        config.distance_threshold = 1.2;
        assert_eq!(config.validate(), Err(ConfigError::ThresholdOutOfRange(1.2)));
        config.distance_threshold = f32::NAN;
        assert!(config.validate().is_err());
        config.distance_threshold = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_counts_rejected() {
        let config = RecognitionConfig { enrollment_target_frame_count: 0, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::NotPositive("enrollmentTargetFrameCount")));
        let config = RecognitionConfig { sample_interval_ms: 0, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::NotPositive("sampleIntervalMs")));
    }

    #[test]
    fn test_oversized_values_rejected() {
        let config = RecognitionConfig {
            enrollment_duration_sec: u64::MAX / 10,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::TooLarge {
                field: "enrollmentDurationSec",
                max: MAX_ENROLLMENT_DURATION_SEC
            })
        );
        // Unvalidated values still must not overflow.
        assert!(config.enrollment_capture_interval() > Duration::from_secs(1));

        let config = RecognitionConfig { sample_interval_ms: u64::MAX, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::TooLarge { .. })));
        let config = RecognitionConfig { enrollment_target_frame_count: u32::MAX, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::TooLarge { .. })));

        let at_limit = RecognitionConfig {
            sample_interval_ms: MAX_SAMPLE_INTERVAL_MS,
            enrollment_duration_sec: MAX_ENROLLMENT_DURATION_SEC,
            enrollment_target_frame_count: MAX_ENROLLMENT_TARGET_FRAMES,
            ..Default::default()
        };
        assert_eq!(at_limit.validate(), Ok(()));
    }

    #[test]
    fn test_camel_case_json() {
        let json = serde_json::to_value(RecognitionConfig::default()).unwrap();
        let threshold = json["distanceThreshold"].as_f64().unwrap();
        assert!((threshold - 0.6).abs() < 1e-6);
        assert_eq!(json["enrollmentTargetFrameCount"], 60);
    }
}
