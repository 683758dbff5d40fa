//! Per-frame transforms: flip selection and depth/channel normalization.
//!
//! The normalization step is an explicit two-stage pipeline (bit-depth widen,
//! then channel reduction) resolved once per source format. Formats without a
//! recognized stage pair are rejected up front rather than silently passed
//! through.

use anyhow::{anyhow, Result};

use crate::frame::{Frame, PixelFormat};

/// BT.601 luminance weights, the same coefficients the BGR-to-gray
/// conversion in common vision stacks uses.
const LUMA_R: f64 = 0.299;
const LUMA_G: f64 = 0.587;
const LUMA_B: f64 = 0.114;

/// Which axis (or axes) to mirror each captured frame around.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlipAxis {
    None,
    Horizontal,
    Vertical,
    Both,
}

impl FlipAxis {
    /// Map the two configuration flags onto a flip axis. Both flags set
    /// selects the combined flip, not either single axis.
    pub fn from_flags(horizontal: bool, vertical: bool) -> Self {
        match (horizontal, vertical) {
            (false, false) => FlipAxis::None,
            (true, false) => FlipAxis::Horizontal,
            (false, true) => FlipAxis::Vertical,
            (true, true) => FlipAxis::Both,
        }
    }

    pub fn is_none(self) -> bool {
        self == FlipAxis::None
    }
}

/// Mirror a frame in place around the configured axis.
pub fn flip_in_place(frame: &mut Frame, axis: FlipAxis) {
    let step = frame.step();
    let bpp = frame.format.bytes_per_pixel();
    match axis {
        FlipAxis::None => {}
        FlipAxis::Horizontal => {
            for row in frame.data.chunks_exact_mut(step) {
                reverse_pixels(row, bpp);
            }
        }
        FlipAxis::Vertical => {
            reverse_rows(&mut frame.data, step);
        }
        FlipAxis::Both => {
            for row in frame.data.chunks_exact_mut(step) {
                reverse_pixels(row, bpp);
            }
            reverse_rows(&mut frame.data, step);
        }
    }
}

fn reverse_pixels(row: &mut [u8], bpp: usize) {
    let pixels = row.len() / bpp;
    for i in 0..pixels / 2 {
        let j = pixels - 1 - i;
        for b in 0..bpp {
            row.swap(i * bpp + b, j * bpp + b);
        }
    }
}

fn reverse_rows(data: &mut [u8], step: usize) {
    if step == 0 {
        return;
    }
    let rows = data.len() / step;
    for i in 0..rows / 2 {
        let j = rows - 1 - i;
        for b in 0..step {
            data.swap(i * step + b, j * step + b);
        }
    }
}

/// First stage: bit-depth handling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DepthStage {
    /// Linear rescale of 8-bit samples into the 16-bit range (v * 257,
    /// which is exactly round(v * 65535 / 255)).
    Widen8To16,
    /// Source is already 16-bit.
    Passthrough16,
}

/// Second stage: channel reduction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChannelStage {
    /// Collapse 3-channel color to luminance, blue channel first.
    LuminanceBgr,
    /// Collapse 3-channel color to luminance, red channel first.
    LuminanceRgb,
    /// Already single channel.
    Passthrough,
}

/// Resolved normalization pipeline for one source format.
///
/// Output is always single-channel 16-bit (`PixelFormat::Mono16`).
#[derive(Clone, Copy, Debug)]
pub struct NormalizePipeline {
    source: PixelFormat,
    depth: DepthStage,
    channels: ChannelStage,
}

impl NormalizePipeline {
    /// Resolve the stage pair for a source format. Unrecognized formats are
    /// an error by policy, not an implicit pass-through.
    pub fn for_source(format: PixelFormat) -> Result<Self> {
        let (depth, channels) = match format {
            PixelFormat::Bgr8 => (DepthStage::Widen8To16, ChannelStage::LuminanceBgr),
            PixelFormat::Rgb8 => (DepthStage::Widen8To16, ChannelStage::LuminanceRgb),
            PixelFormat::Mono8 => (DepthStage::Widen8To16, ChannelStage::Passthrough),
            PixelFormat::Mono16 => (DepthStage::Passthrough16, ChannelStage::Passthrough),
        };
        Ok(Self {
            source: format,
            depth,
            channels,
        })
    }

    /// Run both stages, producing a Mono16 frame of the same dimensions.
    pub fn apply(&self, frame: &Frame) -> Result<Frame> {
        if frame.format != self.source {
            return Err(anyhow!(
                "pipeline resolved for {} but frame is {}",
                self.source.label(),
                frame.format.label()
            ));
        }

        let widened: Vec<u16> = match self.depth {
            DepthStage::Widen8To16 => frame.data.iter().map(|&v| v as u16 * 257).collect(),
            DepthStage::Passthrough16 => frame
                .data
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect(),
        };

        let mono: Vec<u16> = match self.channels {
            ChannelStage::Passthrough => widened,
            ChannelStage::LuminanceBgr => widened
                .chunks_exact(3)
                .map(|px| luminance(px[2], px[1], px[0]))
                .collect(),
            ChannelStage::LuminanceRgb => widened
                .chunks_exact(3)
                .map(|px| luminance(px[0], px[1], px[2]))
                .collect(),
        };

        let mut data = Vec::with_capacity(mono.len() * 2);
        for sample in mono {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        Frame::new(data, frame.width, frame.height, PixelFormat::Mono16)
    }
}

fn luminance(r: u16, g: u16, b: u16) -> u16 {
    let y = LUMA_R * r as f64 + LUMA_G * g as f64 + LUMA_B * b as f64;
    y.round().min(u16::MAX as f64) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bgr_frame(pixels: &[[u8; 3]], width: u32, height: u32) -> Frame {
        let data: Vec<u8> = pixels.iter().flatten().copied().collect();
        Frame::new(data, width, height, PixelFormat::Bgr8).unwrap()
    }

    #[test]
    fn flip_flags_map_to_single_axis() {
        assert_eq!(FlipAxis::from_flags(false, false), FlipAxis::None);
        assert_eq!(FlipAxis::from_flags(true, false), FlipAxis::Horizontal);
        assert_eq!(FlipAxis::from_flags(false, true), FlipAxis::Vertical);
    }

    #[test]
    fn both_flags_select_combined_flip() {
        assert_eq!(FlipAxis::from_flags(true, true), FlipAxis::Both);
    }

    #[test]
    fn horizontal_flip_mirrors_columns() {
        // 2x1: [A, B] -> [B, A]
        let mut frame = bgr_frame(&[[1, 2, 3], [4, 5, 6]], 2, 1);
        flip_in_place(&mut frame, FlipAxis::Horizontal);
        assert_eq!(frame.data, vec![4, 5, 6, 1, 2, 3]);
    }

    #[test]
    fn vertical_flip_mirrors_rows() {
        // 1x2: row A over row B -> row B over row A
        let mut frame = bgr_frame(&[[1, 2, 3], [4, 5, 6]], 1, 2);
        flip_in_place(&mut frame, FlipAxis::Vertical);
        assert_eq!(frame.data, vec![4, 5, 6, 1, 2, 3]);
    }

    #[test]
    fn both_flip_rotates_180() {
        // 2x2 with distinct corners
        let mut frame = bgr_frame(
            &[[1, 1, 1], [2, 2, 2], [3, 3, 3], [4, 4, 4]],
            2,
            2,
        );
        flip_in_place(&mut frame, FlipAxis::Both);
        assert_eq!(
            frame.data,
            vec![4, 4, 4, 3, 3, 3, 2, 2, 2, 1, 1, 1]
        );
    }

    #[test]
    fn bgr8_normalizes_to_rescaled_luminance() -> Result<()> {
        // One pixel: B=10 G=20 R=30
        let frame = bgr_frame(&[[10, 20, 30]], 1, 1);
        let pipeline = NormalizePipeline::for_source(PixelFormat::Bgr8)?;
        let out = pipeline.apply(&frame)?;

        assert_eq!(out.format, PixelFormat::Mono16);
        let value = u16::from_le_bytes([out.data[0], out.data[1]]);
        let expected = (0.299f64 * (30.0 * 257.0) + 0.587 * (20.0 * 257.0) + 0.114 * (10.0 * 257.0))
            .round() as u16;
        assert_eq!(value, expected);
        Ok(())
    }

    #[test]
    fn rgb8_weights_follow_channel_order() -> Result<()> {
        // Pure red in RGB order must use the red weight.
        let frame = Frame::new(vec![255, 0, 0], 1, 1, PixelFormat::Rgb8)?;
        let pipeline = NormalizePipeline::for_source(PixelFormat::Rgb8)?;
        let out = pipeline.apply(&frame)?;

        let value = u16::from_le_bytes([out.data[0], out.data[1]]);
        assert_eq!(value, (0.299f64 * 65535.0).round() as u16);
        Ok(())
    }

    #[test]
    fn mono8_is_rescaled_only() -> Result<()> {
        let frame = Frame::new(vec![0, 128, 255], 3, 1, PixelFormat::Mono8)?;
        let pipeline = NormalizePipeline::for_source(PixelFormat::Mono8)?;
        let out = pipeline.apply(&frame)?;

        let samples: Vec<u16> = out
            .data
            .chunks_exact(2)
            .map(|p| u16::from_le_bytes([p[0], p[1]]))
            .collect();
        assert_eq!(samples, vec![0, 128 * 257, 65535]);
        Ok(())
    }

    #[test]
    fn mono16_passes_through_unchanged() -> Result<()> {
        let data = vec![0x34, 0x12, 0xff, 0xff];
        let frame = Frame::new(data.clone(), 2, 1, PixelFormat::Mono16)?;
        let pipeline = NormalizePipeline::for_source(PixelFormat::Mono16)?;
        let out = pipeline.apply(&frame)?;
        assert_eq!(out.data, data);
        Ok(())
    }

    #[test]
    fn white_pixels_saturate_to_full_scale() -> Result<()> {
        let frame = bgr_frame(&[[255, 255, 255]; 4], 2, 2);
        let pipeline = NormalizePipeline::for_source(PixelFormat::Bgr8)?;
        let out = pipeline.apply(&frame)?;

        for pair in out.data.chunks_exact(2) {
            assert_eq!(u16::from_le_bytes([pair[0], pair[1]]), 65535);
        }
        Ok(())
    }

    #[test]
    fn pipeline_rejects_mismatched_frame() -> Result<()> {
        let frame = Frame::new(vec![0u8; 3], 1, 1, PixelFormat::Rgb8)?;
        let pipeline = NormalizePipeline::for_source(PixelFormat::Bgr8)?;
        assert!(pipeline.apply(&frame).is_err());
        Ok(())
    }
}
