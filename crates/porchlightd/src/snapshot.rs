use porchlight_core::BoundingBox;
use porchlight_hw::Frame;
use std::path::PathBuf;
use thiserror::Error;

/// Padding around the face, as a fraction of its larger side.
const CROP_PADDING: f32 = 0.3;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("face crop is empty")]
    EmptyCrop,
}

/// Writes padded face crops as JPEG files.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Blocking. Returns the path written.
    pub fn save(&self, prefix: &str, frame: &Frame, face: &BoundingBox) -> Result<PathBuf, SnapshotError> {
        let crop = frame.padded_crop(face.x, face.y, face.width, face.height, CROP_PADDING);
        if crop.width == 0 || crop.height == 0 {
            return Err(SnapshotError::EmptyCrop);
        }
        let img = image::GrayImage::from_raw(crop.width, crop.height, crop.data)
            .ok_or(SnapshotError::EmptyCrop)?;

        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{prefix}-{}.jpg", uuid::Uuid::new_v4()));
        img.save_with_format(&path, image::ImageFormat::Jpeg)?;
        tracing::debug!(path = %path.display(), width = crop.width, height = crop.height, "snapshot saved");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: 0.9,
            landmarks: None,
        }
    }

    #[test]
    fn test_save_writes_jpeg_crop() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path().join("snaps"));
        let frame = Frame::new(vec![128u8; 100 * 80], 100, 80).unwrap();

        let path = writer.save("visitor", &frame, &face(40.0, 30.0, 20.0, 20.0)).unwrap();
        assert!(path.starts_with(dir.path().join("snaps")));
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("visitor-"));

        // 20px face padded by 6px on every side.
        let decoded = image::open(&path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 32));
    }

    #[test]
    fn test_face_outside_frame_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path());
        let frame = Frame::new(vec![128u8; 10 * 10], 10, 10).unwrap();
        let result = writer.save("visitor", &frame, &face(50.0, 50.0, 5.0, 5.0));
        assert!(matches!(result, Err(SnapshotError::EmptyCrop)));
    }
}
