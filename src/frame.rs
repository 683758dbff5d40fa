//! Frame and image message types.
//!
//! `Frame` is the single in-flight buffer the capture loop owns: pulled from a
//! source, flipped and normalized in place or replaced, then wrapped into an
//! `ImageMessage` for publishing. There is no frame queue anywhere in the
//! crate; at most one frame exists per tick.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Pixel layout of a captured or published buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit blue/green/red interleaved, 3 bytes per pixel.
    Bgr8,
    /// 8-bit red/green/blue interleaved, 3 bytes per pixel.
    Rgb8,
    /// 8-bit single channel.
    Mono8,
    /// 16-bit single channel, little-endian byte order.
    Mono16,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Bgr8 | PixelFormat::Rgb8 => 3,
            PixelFormat::Mono8 | PixelFormat::Mono16 => 1,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgr8 | PixelFormat::Rgb8 => 3,
            PixelFormat::Mono8 => 1,
            PixelFormat::Mono16 => 2,
        }
    }

    /// Canonical encoding label for this layout.
    pub fn label(self) -> &'static str {
        match self {
            PixelFormat::Bgr8 => "bgr8",
            PixelFormat::Rgb8 => "rgb8",
            PixelFormat::Mono8 => "mono8",
            PixelFormat::Mono16 => "mono16",
        }
    }
}

/// A single decoded frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Frame {
    /// Create a frame, validating that the buffer length matches the
    /// dimensions and pixel layout.
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        let expected = expected_len(width, height, format)?;
        if data.len() != expected {
            return Err(anyhow!(
                "{} frame length mismatch for {}x{}: expected {}, got {}",
                format.label(),
                width,
                height,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            format,
        })
    }

    /// Row length in bytes.
    pub fn step(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }
}

pub(crate) fn expected_len(width: u32, height: u32, format: PixelFormat) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(format.bytes_per_pixel()))
        .ok_or_else(|| anyhow!("frame dimensions overflow: {}x{}", width, height))
}

/// Wire header published alongside the pixel payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHeader {
    /// Outgoing frame id (coordinate frame name).
    pub frame_id: String,
    /// Capture timestamp, milliseconds since the Unix epoch.
    pub stamp_ms: u64,
    /// Monotonic per-process sequence number, starting at 1.
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    /// Configured encoding label (e.g. "bgr8"); carried verbatim.
    pub encoding: String,
    /// Row length in bytes.
    pub step: u32,
}

/// Outgoing image message: header plus raw pixel payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageMessage {
    pub header: ImageHeader,
    pub data: Vec<u8>,
}
