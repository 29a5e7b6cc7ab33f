//! Snapshot → JPEG frame encoding.
//!
//! Quality and max width are per-call so the capture loop can trade
//! fidelity for throughput as attention changes.

use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, RgbImage};
use std::io::Cursor;

use crate::error::EncodeError;
use crate::protocol::Frame;

/// Byte order of a 4-byte-per-pixel snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8,
    /// What scrap hands out on every platform
    Bgra8,
}

impl PixelFormat {
    /// Offsets of (R, G, B) inside one pixel
    fn rgb_offsets(self) -> (usize, usize, usize) {
        match self {
            PixelFormat::Rgba8 => (0, 1, 2),
            PixelFormat::Bgra8 => (2, 1, 0),
        }
    }
}

/// A raw captured surface. Rows may be padded (`stride >= width * 4`).
#[derive(Debug, Clone)]
pub struct RawSnapshot {
    width: u32,
    height: u32,
    stride: usize,
    format: PixelFormat,
    pixels: Vec<u8>,
}

impl RawSnapshot {
    pub fn new(
        width: u32,
        height: u32,
        stride: usize,
        format: PixelFormat,
        pixels: Vec<u8>,
    ) -> Result<Self, EncodeError> {
        if width == 0 || height == 0 {
            return Err(EncodeError::new(format!(
                "empty surface {}x{}",
                width, height
            )));
        }
        let row_bytes = width as usize * 4;
        if stride < row_bytes {
            return Err(EncodeError::new(format!(
                "stride {} shorter than row of {} bytes",
                stride, row_bytes
            )));
        }
        let needed = stride * (height as usize - 1) + row_bytes;
        if pixels.len() < needed {
            return Err(EncodeError::new(format!(
                "buffer holds {} bytes, {}x{} needs {}",
                pixels.len(),
                width,
                height,
                needed
            )));
        }
        Ok(Self {
            width,
            height,
            stride,
            format,
            pixels,
        })
    }

    /// Tightly packed RGBA
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, EncodeError> {
        Self::new(width, height, width as usize * 4, PixelFormat::Rgba8, pixels)
    }

    /// Rows of equal, possibly padded length filling the whole buffer, as
    /// scrap hands them out. The stride is derived from the buffer length.
    pub fn from_padded_rows(
        width: u32,
        height: u32,
        format: PixelFormat,
        pixels: Vec<u8>,
    ) -> Result<Self, EncodeError> {
        if height == 0 {
            return Err(EncodeError::new(format!("empty surface {}x{}", width, height)));
        }
        let stride = pixels.len() / height as usize;
        Self::new(width, height, stride, format, pixels)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

/// Per-call encoding knobs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeSettings {
    /// JPEG quality in (0, 1]
    pub quality: f32,
    /// Frames wider than this are downscaled, preserving aspect ratio
    pub max_width: u32,
}

impl EncodeSettings {
    pub fn new(quality: f32, max_width: u32) -> Self {
        Self { quality, max_width }
    }

    /// Quality mapped onto the 1..=100 scale the JPEG encoder takes
    pub fn jpeg_quality(&self) -> u8 {
        (self.quality * 100.0).round().clamp(1.0, 100.0) as u8
    }

    fn validate(&self) -> Result<(), EncodeError> {
        if !self.quality.is_finite() || self.quality <= 0.0 || self.quality > 1.0 {
            return Err(EncodeError::new(format!(
                "quality {} outside (0, 1]",
                self.quality
            )));
        }
        if self.max_width == 0 {
            return Err(EncodeError::new("max width must be positive"));
        }
        Ok(())
    }
}

/// Output dimensions for a `width`x`height` input limited to `max_width`.
pub fn scaled_dimensions(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if width <= max_width {
        return (width, height);
    }
    let ratio = max_width as f64 / width as f64;
    let scaled_h = (height as f64 * ratio).round().max(1.0) as u32;
    (max_width, scaled_h)
}

/// Anything that can turn a snapshot into a wire frame.
pub trait FrameEncoder: Send + Sync + 'static {
    fn encode(&self, snapshot: &RawSnapshot, settings: EncodeSettings)
        -> Result<Frame, EncodeError>;
}

/// Nearest-neighbour downscale + baseline JPEG
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegFrameEncoder;

impl FrameEncoder for JpegFrameEncoder {
    fn encode(
        &self,
        snapshot: &RawSnapshot,
        settings: EncodeSettings,
    ) -> Result<Frame, EncodeError> {
        settings.validate()?;
        let (out_w, out_h) =
            scaled_dimensions(snapshot.width, snapshot.height, settings.max_width);
        let rgb = to_rgb_scaled(snapshot, out_w, out_h);
        let jpeg = jpeg_encode(rgb, out_w, out_h, settings.jpeg_quality())?;
        Ok(Frame::new(jpeg, out_w, out_h))
    }
}

/// Convert a 4-byte-per-pixel snapshot to packed RGB, sampling nearest source pixels
fn to_rgb_scaled(snapshot: &RawSnapshot, dst_w: u32, dst_h: u32) -> Vec<u8> {
    let (r, g, b) = snapshot.format.rgb_offsets();
    let src_w = snapshot.width as usize;
    let src_h = snapshot.height as usize;
    let mut rgb = Vec::with_capacity(dst_w as usize * dst_h as usize * 3);

    for y in 0..dst_h as usize {
        let src_y = (y * src_h) / dst_h as usize;
        let row = &snapshot.pixels[src_y * snapshot.stride..];
        for x in 0..dst_w as usize {
            let src_x = (x * src_w) / dst_w as usize;
            let px = &row[src_x * 4..src_x * 4 + 4];
            rgb.extend_from_slice(&[px[r], px[g], px[b]]);
        }
    }

    rgb
}

fn jpeg_encode(rgb: Vec<u8>, width: u32, height: u32, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);

    let img: RgbImage = ImageBuffer::from_raw(width, height, rgb)
        .ok_or_else(|| EncodeError::new("invalid image dimensions"))?;

    img.write_with_encoder(encoder)
        .map_err(|e| EncodeError::new(e.to_string()))?;

    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::viewer::DecodedFrame;

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> RawSnapshot {
        let pixels = rgba.repeat((width * height) as usize);
        RawSnapshot::from_rgba(width, height, pixels).unwrap()
    }

    #[test]
    fn test_padded_rows_derive_stride() {
        // 3 pixels wide, rows padded to 16 bytes
        let snap = RawSnapshot::from_padded_rows(3, 2, PixelFormat::Bgra8, vec![0; 32]).unwrap();
        assert_eq!((snap.width(), snap.height()), (3, 2));

        // A zero-height surface is rejected rather than dividing by zero
        assert!(RawSnapshot::from_padded_rows(1920, 0, PixelFormat::Bgra8, vec![0; 64]).is_err());
        assert!(RawSnapshot::from_padded_rows(0, 4, PixelFormat::Bgra8, vec![0; 64]).is_err());
        assert!(RawSnapshot::from_padded_rows(4, 4, PixelFormat::Bgra8, Vec::new()).is_err());
    }

    #[test]
    fn test_downscale_law() {
        assert_eq!(scaled_dimensions(1920, 1080, 960), (960, 540));
        assert_eq!(scaled_dimensions(1000, 333, 640), (640, 213));
        assert_eq!(scaled_dimensions(1001, 1, 10), (10, 1));
        assert_eq!(scaled_dimensions(3, 1000, 2), (2, 667));
        // At or below the limit: untouched
        assert_eq!(scaled_dimensions(960, 540, 960), (960, 540));
        assert_eq!(scaled_dimensions(17, 5, 960), (17, 5));
    }

    #[test]
    fn test_downscale_law_sweep() {
        for w in [641u32, 800, 1023, 1366, 2560, 3840] {
            for h in [1u32, 7, 480, 1080, 1440] {
                let (ow, oh) = scaled_dimensions(w, h, 640);
                assert_eq!(ow, 640);
                let expected = (h as f64 * 640.0 / w as f64).round().max(1.0) as u32;
                assert_eq!(oh, expected, "{}x{}", w, h);
            }
        }
    }

    #[test]
    fn test_encode_downscales() {
        let snap = solid(200, 100, [200, 10, 10, 255]);
        let frame = JpegFrameEncoder
            .encode(&snap, EncodeSettings::new(0.7, 50))
            .unwrap();
        assert_eq!((frame.width(), frame.height()), (50, 25));

        let decoded = DecodedFrame::decode(frame.data().clone()).unwrap();
        assert_eq!((decoded.width, decoded.height), (50, 25));
    }

    #[test]
    fn test_encode_keeps_small_input() {
        let snap = solid(32, 24, [0, 0, 255, 255]);
        let frame = JpegFrameEncoder
            .encode(&snap, EncodeSettings::new(1.0, 960))
            .unwrap();
        assert_eq!((frame.width(), frame.height()), (32, 24));
        // SOI marker
        assert_eq!(&frame.data()[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_encode_does_not_mutate_input() {
        let snap = solid(40, 40, [1, 2, 3, 4]);
        let before = snap.pixels().to_vec();
        JpegFrameEncoder
            .encode(&snap, EncodeSettings::new(0.5, 10))
            .unwrap();
        assert_eq!(snap.pixels(), &before[..]);
    }

    #[test]
    fn test_bgra_channel_order() {
        let snap = RawSnapshot::new(1, 1, 4, PixelFormat::Bgra8, vec![10, 20, 30, 255]).unwrap();
        assert_eq!(to_rgb_scaled(&snap, 1, 1), vec![30, 20, 10]);

        let snap = RawSnapshot::from_rgba(1, 1, vec![10, 20, 30, 255]).unwrap();
        assert_eq!(to_rgb_scaled(&snap, 1, 1), vec![10, 20, 30]);
    }

    #[test]
    fn test_padded_stride() {
        // 2x2 with 4 bytes of row padding
        let mut pixels = vec![0u8; 12 * 2];
        pixels[12..16].copy_from_slice(&[9, 8, 7, 255]);
        let snap = RawSnapshot::new(2, 2, 12, PixelFormat::Rgba8, pixels).unwrap();
        let rgb = to_rgb_scaled(&snap, 2, 2);
        assert_eq!(&rgb[6..9], &[9, 8, 7]);
    }

    #[test]
    fn test_rejects_invalid_input() {
        assert!(RawSnapshot::from_rgba(0, 10, vec![]).is_err());
        assert!(RawSnapshot::from_rgba(4, 4, vec![0; 63]).is_err());
        assert!(RawSnapshot::new(4, 4, 8, PixelFormat::Rgba8, vec![0; 64]).is_err());

        let snap = solid(4, 4, [0, 0, 0, 255]);
        for quality in [0.0, -0.5, 1.01, f32::NAN] {
            let err = JpegFrameEncoder
                .encode(&snap, EncodeSettings::new(quality, 100))
                .unwrap_err();
            assert!(err.reason.contains("quality"));
        }
        assert!(JpegFrameEncoder
            .encode(&snap, EncodeSettings::new(0.5, 0))
            .is_err());
    }

    #[test]
    fn test_jpeg_quality_mapping() {
        assert_eq!(EncodeSettings::new(0.9, 1).jpeg_quality(), 90);
        assert_eq!(EncodeSettings::new(0.001, 1).jpeg_quality(), 1);
        assert_eq!(EncodeSettings::new(1.0, 1).jpeg_quality(), 100);
    }
}
