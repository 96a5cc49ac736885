//! Frame type and image processing: YUYV conversion, dark detection, CLAHE, cropping.

use std::time::SystemTime;

/// A captured grayscale frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Grayscale pixel data, row-major (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: SystemTime,
    pub sequence: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at: SystemTime::now(),
            sequence: 0,
        })
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    pub fn is_dark(&self) -> bool {
        is_dark_frame(&self.data, DARK_FRAME_RATIO)
    }

    /// Crop the rectangle `(x, y, w, h)` grown by `pad_ratio` of its larger
    /// side on every edge, clamped to the frame.
    pub fn padded_crop(&self, x: f32, y: f32, w: f32, h: f32, pad_ratio: f32) -> Frame {
        let pad = w.max(h).max(0.0) * pad_ratio;
        let clamp_x = |v: f32| v.clamp(0.0, self.width as f32) as u32;
        let clamp_y = |v: f32| v.clamp(0.0, self.height as f32) as u32;

        let left = clamp_x((x - pad).floor());
        let top = clamp_y((y - pad).floor());
        let right = clamp_x((x + w + pad).ceil()).max(left);
        let bottom = clamp_y((y + h + pad).ceil()).max(top);

        let (cw, ch) = (right - left, bottom - top);
        let stride = self.width as usize;
        let mut data = Vec::with_capacity(cw as usize * ch as usize);
        for row in top..bottom {
            let start = row as usize * stride + left as usize;
            data.extend_from_slice(&self.data[start..start + cw as usize]);
        }

        Frame {
            data,
            width: cw,
            height: ch,
            captured_at: self.captured_at,
            sequence: self.sequence,
        }
    }
}

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_RATIO: f32 = 0.95;

/// Convert packed YUYV (4:2:2) to grayscale by keeping the Y bytes.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// True if more than `threshold_pct` of pixels are below 32.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < 32).count();
    (dark as f32 / gray.len() as f32) > threshold_pct
}

/// Clipped, normalized cumulative histogram of one tile.
fn tile_cdf(gray: &[u8], stride: usize, x0: usize, y0: usize, tw: usize, th: usize, clip_limit: f32) -> [f32; 256] {
    let mut hist = [0u32; 256];
    for y in y0..y0 + th {
        for &p in &gray[y * stride + x0..y * stride + x0 + tw] {
            hist[p as usize] += 1;
        }
    }

    // Clip and spread the excess evenly.
    let pixels = (tw * th) as u32;
    let clip = ((clip_limit * pixels as f32) as u32).max(1);
    let excess: u32 = hist.iter().map(|&b| b.saturating_sub(clip)).sum();
    let (share, leftover) = (excess / 256, (excess % 256) as usize);
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin = (*bin).min(clip) + share + u32::from(i < leftover);
    }

    let mut cdf = [0f32; 256];
    let mut running = 0f32;
    for (slot, &count) in cdf.iter_mut().zip(hist.iter()) {
        running += count as f32;
        *slot = running;
    }

    let cdf_min = cdf.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
    let denom = pixels as f32 - cdf_min;
    if denom > 0.0 {
        for v in cdf.iter_mut() {
            *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
        }
    }
    cdf
}

/// Contrast-limited adaptive histogram equalization, in place, on a
/// `tiles x tiles` grid with bilinear blending between tile mappings.
pub fn clahe_enhance(gray: &mut [u8], width: u32, height: u32, tiles: u32, clip_limit: f32) {
    let (w, h, t) = (width as usize, height as usize, tiles as usize);
    if w == 0 || h == 0 || t == 0 || gray.len() < w * h {
        return;
    }
    let (tw, th) = (w / t, h / t);
    if tw == 0 || th == 0 {
        return;
    }

    let cdfs: Vec<[f32; 256]> = (0..t * t)
        .map(|i| tile_cdf(gray, w, (i % t) * tw, (i / t) * th, tw, th, clip_limit))
        .collect();

    let last = (t - 1) as f32;
    for y in 0..h {
        let fy = (y as f32 / th as f32 - 0.5).clamp(0.0, last);
        let (r0, dy) = (fy as usize, fy.fract());
        let r1 = (r0 + 1).min(t - 1);

        for x in 0..w {
            let fx = (x as f32 / tw as f32 - 0.5).clamp(0.0, last);
            let (c0, dx) = (fx as usize, fx.fract());
            let c1 = (c0 + 1).min(t - 1);

            let p = gray[y * w + x] as usize;
            let top = cdfs[r0 * t + c0][p] * (1.0 - dx) + cdfs[r0 * t + c1][p] * dx;
            let bottom = cdfs[r1 * t + c0][p] * (1.0 - dx) + cdfs[r1 * t + c1][p] * dx;
            gray[y * w + x] = (top * (1.0 - dy) + bottom * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
