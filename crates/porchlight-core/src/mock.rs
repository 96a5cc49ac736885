//! Model-free extractor for demos and development machines without the ONNX
//! models. Only ever selected explicitly by configuration.
//!
//! Descriptors are pseudo-random unit vectors seeded from a coarse hash of the
//! frame, so the same still image always yields the same descriptor.
//! Mostly-black frames count as "no face".

use crate::extractor::{ExtractError, Extractor};
use crate::types::{BoundingBox, Descriptor, Extraction};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const MOCK_DESCRIPTOR_DIM: usize = 128;
const DARK_MEAN: f32 = 32.0;

#[derive(Debug, Default)]
pub struct MockExtractor {
    ready: bool,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }
}

/// FNV-1a over pixels quantized to 3 bits, so sensor noise rarely changes the seed.
fn frame_seed(frame: &[u8]) -> u64 {
    frame.iter().fold(0xcbf2_9ce4_8422_2325u64, |hash, &p| {
        (hash ^ u64::from(p >> 5)).wrapping_mul(0x0100_0000_01b3)
    })
}

impl Extractor for MockExtractor {
    fn kind(&self) -> &'static str {
        "mock"
    }

    fn initialize(&mut self) -> Result<(), ExtractError> {
        tracing::warn!("mock extractor active: descriptors are synthetic, not biometric");
        self.ready = true;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn extract(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Extraction, ExtractError> {
        if !self.ready {
            return Err(ExtractError::NotInitialized);
        }
        let pixels = (width as usize * height as usize).min(frame.len());
        if pixels == 0 {
            return Err(ExtractError::NoFaceDetected);
        }
        let frame = &frame[..pixels];
        let mean = frame.iter().map(|&p| p as f32).sum::<f32>() / pixels as f32;
        if mean < DARK_MEAN {
            return Err(ExtractError::NoFaceDetected);
        }

        let mut rng = StdRng::seed_from_u64(frame_seed(frame));
        let raw: Vec<f32> = (0..MOCK_DESCRIPTOR_DIM).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt().max(f32::EPSILON);

        Ok(Extraction {
            descriptor: Descriptor::new(raw.into_iter().map(|v| v / norm).collect()),
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
