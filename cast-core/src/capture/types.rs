//! Frame types passed between pipeline stages.
//!
//! [`RawFrame`] is what a [`FrameSource`](super::FrameSource) produces and
//! an encoder consumes. [`EncodedUnit`] is the encoder output handed to the
//! frame callback and from there to the transport.

use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb, Rgba};

use crate::error::CastError;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout for raw captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// 3 bytes per pixel: Red, Green, Blue.
    Rgb8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }
}

// ── RawFrame ─────────────────────────────────────────────────────

/// An uncompressed desktop snapshot.
///
/// `data` holds `height` rows of `stride` bytes each. `stride` may exceed
/// `width * bytes_per_pixel` when the source pads rows.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// Row pitch in **bytes**.
    pub stride: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl RawFrame {
    /// Wrap a tightly packed buffer (`stride == width * bpp`).
    pub fn packed(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self, CastError> {
        let stride = width as usize * format.bytes_per_pixel();
        if data.len() < stride * height as usize {
            return Err(CastError::Capture(format!(
                "buffer of {} bytes too small for {width}x{height} {format:?}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            stride: stride as u32,
            format,
            data,
        })
    }

    /// Total byte size the raw bitmap occupies.
    pub fn byte_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    /// Pixel bytes of row `y`, without padding.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        let end = start + self.width as usize * self.format.bytes_per_pixel();
        &self.data[start..end]
    }

    /// Copy of the bitmap with row padding removed.
    fn packed_data(&self) -> Vec<u8> {
        let row_len = self.width as usize * self.format.bytes_per_pixel();
        if self.stride as usize == row_len {
            return self.data[..self.byte_len()].to_vec();
        }
        let mut out = Vec::with_capacity(row_len * self.height as usize);
        for y in 0..self.height {
            out.extend_from_slice(self.row(y));
        }
        out
    }

    /// Bilinear resize to `width` x `height`, keeping the pixel format.
    ///
    /// Channels are interpolated independently, so BGRA is handled the
    /// same way as RGBA.
    pub fn resize(&self, width: u32, height: u32) -> Result<RawFrame, CastError> {
        if width == 0 || height == 0 {
            return Err(CastError::InvalidParameters(format!(
                "cannot resize to {width}x{height}"
            )));
        }
        let packed = self.packed_data();
        let malformed = || CastError::Capture("frame buffer does not match its dimensions".into());

        let data = match self.format {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => {
                let img = ImageBuffer::<Rgba<u8>, _>::from_raw(self.width, self.height, packed)
                    .ok_or_else(malformed)?;
                imageops::resize(&img, width, height, FilterType::Triangle).into_raw()
            }
            PixelFormat::Rgb8 => {
                let img = ImageBuffer::<Rgb<u8>, _>::from_raw(self.width, self.height, packed)
                    .ok_or_else(malformed)?;
                imageops::resize(&img, width, height, FilterType::Triangle).into_raw()
            }
        };

        Ok(RawFrame {
            width,
            height,
            stride: width * self.format.bytes_per_pixel() as u32,
            format: self.format,
            data,
        })
    }
}

// ── EncodedUnit ──────────────────────────────────────────────────

/// Encoder output for one capture tick: zero or more complete H.264
/// access units in Annex-B form.
///
/// Not `Clone`: each unit has exactly one owner at a time, moving from the
/// encoder to the frame callback to the transport.
#[derive(Debug, PartialEq, Eq)]
pub struct EncodedUnit(Bytes);

impl EncodedUnit {
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Vec<u8>> for EncodedUnit {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl From<Bytes> for EncodedUnit {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

// ── Tests ────────────────────────────────────────────────────────
