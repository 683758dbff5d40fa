//! Local capture device backend.
//!
//! Opens `/dev/video<N>` through libv4l (feature: capture-v4l2). The device
//! is asked for raw samples in whatever layout the driver exposes; no
//! driver-side color conversion is requested. The discovered native pixel
//! format is logged for diagnostics and mapped onto `PixelFormat` so the
//! normalization pipeline can decide what to do with it.

use anyhow::Result;

use super::{CaptureOptions, FrameProducer};
use crate::frame::Frame;

/// Local capture device source.
#[cfg(feature = "capture-v4l2")]
pub struct DeviceSource {
    inner: v4l2::V4l2Device,
}

#[cfg(feature = "capture-v4l2")]
impl DeviceSource {
    /// Open the device at the given index and apply one-time configuration.
    pub fn open(index: u32, options: CaptureOptions) -> Result<Self> {
        Ok(Self {
            inner: v4l2::V4l2Device::open(index, options)?,
        })
    }
}

#[cfg(feature = "capture-v4l2")]
impl FrameProducer for DeviceSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.inner.next_frame()
    }

    fn frames_captured(&self) -> u64 {
        self.inner.frames_captured
    }
}

/// Local capture device source (unavailable without the capture-v4l2 feature).
#[cfg(not(feature = "capture-v4l2"))]
pub struct DeviceSource {
    _private: (),
}

#[cfg(not(feature = "capture-v4l2"))]
impl DeviceSource {
    pub fn open(_index: u32, _options: CaptureOptions) -> Result<Self> {
        anyhow::bail!("device capture requires the capture-v4l2 feature")
    }
}

#[cfg(not(feature = "capture-v4l2"))]
impl FrameProducer for DeviceSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        anyhow::bail!("device capture requires the capture-v4l2 feature")
    }

    fn frames_captured(&self) -> u64 {
        0
    }
}

#[cfg(feature = "capture-v4l2")]
mod v4l2 {
    use anyhow::{anyhow, Context, Result};
    use ouroboros::self_referencing;

    use super::super::CaptureOptions;
    use crate::frame::{Frame, PixelFormat};

    pub(super) struct V4l2Device {
        state: DeviceState,
        format: PixelFormat,
        width: u32,
        height: u32,
        pub(super) frames_captured: u64,
    }

    #[self_referencing]
    struct DeviceState {
        device: v4l::Device,
        #[borrows(mut device)]
        #[covariant]
        stream: v4l::prelude::MmapStream<'this, v4l::Device>,
    }

    impl V4l2Device {
        pub(super) fn open(index: u32, options: CaptureOptions) -> Result<Self> {
            use v4l::buffer::Type;
            use v4l::video::Capture;

            let path = format!("/dev/video{}", index);
            let mut device =
                v4l::Device::with_path(&path).with_context(|| format!("open device {}", path))?;

            let mut format = device.format().context("read device format")?;
            if let Some((width, height)) = options.forced_dimensions() {
                format.width = width;
                format.height = height;
                format = device
                    .set_format(&format)
                    .with_context(|| format!("force {}x{} on {}", width, height, path))?;
            }

            if options.fps > 0 {
                let params = v4l::video::capture::Parameters::with_fps(options.fps);
                if let Err(err) = device.set_params(&params) {
                    log::warn!("failed to set fps on {}: {}", path, err);
                }
            }

            let fourcc = format.fourcc;
            log::info!(
                "native video format on {}: {} ({}x{})",
                path,
                fourcc,
                format.width,
                format.height
            );

            let pixel_format = map_fourcc(&fourcc.repr)
                .ok_or_else(|| anyhow!("unsupported native pixel format {}", fourcc))?;

            let width = format.width;
            let height = format.height;

            let state = DeviceStateBuilder {
                device,
                stream_builder: |device| {
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                        .map_err(|err| anyhow::Error::new(err).context("create capture stream"))
                },
            }
            .try_build()?;

            Ok(Self {
                state,
                format: pixel_format,
                width,
                height,
                frames_captured: 0,
            })
        }

        pub(super) fn next_frame(&mut self) -> Result<Option<Frame>> {
            use v4l::io::traits::CaptureStream;

            let (buf, _meta) = self
                .state
                .with_mut(|fields| fields.stream.next())
                .context("capture device frame")?;

            if buf.is_empty() {
                return Ok(None);
            }

            let frame = Frame::new(buf.to_vec(), self.width, self.height, self.format)?;
            self.frames_captured += 1;
            Ok(Some(frame))
        }
    }

    fn map_fourcc(repr: &[u8; 4]) -> Option<PixelFormat> {
        match repr {
            b"BGR3" => Some(PixelFormat::Bgr8),
            b"RGB3" => Some(PixelFormat::Rgb8),
            b"GREY" => Some(PixelFormat::Mono8),
            b"Y16 " => Some(PixelFormat::Mono16),
            _ => None,
        }
    }

}
