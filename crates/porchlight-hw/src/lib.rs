//! porchlight-hw: video sources for the doorbell pipeline.
//!
//! V4L2 camera capture, still-image sources and grayscale frame processing.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::{source_for, StillSource, V4lSource, VideoSource, VideoStream};
