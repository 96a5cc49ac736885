//! Injectable video sources.
//!
//! A [`VideoSource`] hands out a [`VideoStream`] on `acquire`. The stream
//! owns the device; dropping it releases the device, so every exit path of a
//! session (stop, error, panic unwind) gives the camera back.

use crate::camera::{Camera, CameraError};
use crate::frame::{self, Frame};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const CLAHE_TILES: u32 = 8;
const CLAHE_CLIP_LIMIT: f32 = 0.02;

pub trait VideoSource: Send + Sync {
    /// Human-readable description for logs and status output.
    fn describe(&self) -> String;

    /// Open the source. Errors mean the camera is unavailable.
    fn acquire(&self) -> Result<Box<dyn VideoStream>, CameraError>;
}

pub trait VideoStream: Send {
    /// Grab the frame currently showing.
    fn current_frame(&mut self) -> Result<Frame, CameraError>;
}

/// A V4L2 device, opened per acquisition.
#[derive(Debug, Clone)]
pub struct V4lSource {
    device_path: String,
    enhance_contrast: bool,
}

impl V4lSource {
    pub fn new(device_path: impl Into<String>, enhance_contrast: bool) -> Self {
        Self {
            device_path: device_path.into(),
            enhance_contrast,
        }
    }
}

impl VideoSource for V4lSource {
    fn describe(&self) -> String {
        format!("v4l2:{}", self.device_path)
    }

    fn acquire(&self) -> Result<Box<dyn VideoStream>, CameraError> {
        let camera = Camera::open(&self.device_path)?;
        Ok(Box::new(CameraStream {
            camera,
            enhance_contrast: self.enhance_contrast,
        }))
    }
}

struct CameraStream {
    camera: Camera,
    enhance_contrast: bool,
}

impl VideoStream for CameraStream {
    fn current_frame(&mut self) -> Result<Frame, CameraError> {
        let mut frame = self.camera.capture_frame()?;
        if self.enhance_contrast && !frame.is_dark() {
            frame::clahe_enhance(&mut frame.data, frame.width, frame.height, CLAHE_TILES, CLAHE_CLIP_LIMIT);
        }
        Ok(frame)
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        tracing::debug!(device = %self.camera.device_path, "camera released");
    }
}

/// A fixed image served as every frame. Used for demos, diagnostics and tests.
#[derive(Debug, Clone)]
pub struct StillSource {
    label: String,
    frame: Frame,
}

impl StillSource {
    pub fn new(label: impl Into<String>, frame: Frame) -> Self {
        Self {
            label: label.into(),
            frame,
        }
    }

    /// Decode an image file to grayscale.
    pub fn open(path: &Path) -> Result<Self, CameraError> {
        let gray = image::open(path)
            .map_err(|e| CameraError::Image(format!("{}: {e}", path.display())))?
            .to_luma8();
        let (width, height) = gray.dimensions();
        let frame = Frame::new(gray.into_raw(), width, height)
            .map_err(|e| CameraError::Image(e.to_string()))?;
        Ok(Self::new(path.display().to_string(), frame))
    }
}

impl VideoSource for StillSource {
    fn describe(&self) -> String {
        format!("still:{}", self.label)
    }

    fn acquire(&self) -> Result<Box<dyn VideoStream>, CameraError> {
        Ok(Box::new(StillStream {
            frame: self.frame.clone(),
            sequence: 0,
        }))
    }
}

struct StillStream {
    frame: Frame,
    sequence: u32,
}

impl VideoStream for StillStream {
    fn current_frame(&mut self) -> Result<Frame, CameraError> {
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Frame {
            captured_at: SystemTime::now(),
            sequence: self.sequence,
            ..self.frame.clone()
        })
    }
}

/// Paths with an image extension are served as still sources; anything else
/// is treated as a V4L2 device.
pub fn source_for(device: &str, enhance_contrast: bool) -> Result<Box<dyn VideoSource>, CameraError> {
    let path = PathBuf::from(device);
    let is_image = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg" | "bmp"))
        .unwrap_or(false);

    if is_image {
        Ok(Box::new(StillSource::open(&path)?))
    } else {
        Ok(Box::new(V4lSource::new(device, enhance_contrast)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_still_source_repeats_frame() {
        let frame = Frame::new(vec![7u8; 12], 4, 3).unwrap();
        let source = StillSource::new("test", frame);
        let mut stream = source.acquire().unwrap();
        let a = stream.current_frame().unwrap();
        let b = stream.current_frame().unwrap();
        assert_eq!(a.data, b.data);
        assert_eq!((a.width, a.height), (4, 3));
        assert_eq!((a.sequence, b.sequence), (1, 2));
    }

    #[test]
    fn test_still_source_from_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.png");
        image::GrayImage::from_pixel(5, 4, image::Luma([200u8])).save(&path).unwrap();

        let source = source_for(path.to_str().unwrap(), true).unwrap();
        assert!(source.describe().starts_with("still:"));
        let frame = source.acquire().unwrap().current_frame().unwrap();
        assert_eq!((frame.width, frame.height), (5, 4));
        assert!(frame.data.iter().all(|&p| p == 200));
    }

    #[test]
    fn test_missing_image_is_camera_error() {
        let result = source_for("/nonexistent/porch.jpg", false);
        assert!(matches!(result, Err(CameraError::Image(_))));
    }

    #[test]
    fn test_device_path_is_v4l() {
        let source = source_for("/dev/video0", true).unwrap();
        assert_eq!(source.describe(), "v4l2:/dev/video0");
    }

    #[test]
    fn test_missing_device_fails_on_acquire() {
        let source = V4lSource::new("/dev/porchlight-absent", false);
        assert!(matches!(source.acquire(), Err(CameraError::DeviceNotFound(_))));
    }
}
