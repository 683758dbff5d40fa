//! Network/file stream backend.
//!
//! Real streams are decoded through a GStreamer appsink pipeline (feature:
//! stream-gstreamer). `stub://` URIs get a synthetic in-memory backend that
//! generates BGR test frames, which keeps the daemon and the test suite
//! independent of a decoder stack.

use anyhow::Result;

use super::{CaptureOptions, FrameProducer};
use crate::frame::{Frame, PixelFormat};

const SYNTHETIC_DEFAULT_WIDTH: u32 = 640;
const SYNTHETIC_DEFAULT_HEIGHT: u32 = 480;

/// Network stream source.
pub struct NetworkSource {
    backend: NetworkBackend,
}

enum NetworkBackend {
    Synthetic(SyntheticStream),
    #[cfg(feature = "stream-gstreamer")]
    Gstreamer(gst::GstreamerStream),
}

impl NetworkSource {
    /// Open a stream URI. `stub://` selects the synthetic backend.
    pub fn open(uri: &str, options: CaptureOptions) -> Result<Self> {
        if uri.starts_with("stub://") {
            log::info!("using synthetic stream for {}", uri);
            return Ok(Self {
                backend: NetworkBackend::Synthetic(SyntheticStream::new(options)),
            });
        }

        #[cfg(feature = "stream-gstreamer")]
        {
            Ok(Self {
                backend: NetworkBackend::Gstreamer(gst::GstreamerStream::open(uri, options)?),
            })
        }
        #[cfg(not(feature = "stream-gstreamer"))]
        {
            anyhow::bail!("stream {} requires the stream-gstreamer feature", uri)
        }
    }
}

impl FrameProducer for NetworkSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            NetworkBackend::Synthetic(stream) => stream.next_frame(),
            #[cfg(feature = "stream-gstreamer")]
            NetworkBackend::Gstreamer(stream) => stream.next_frame(),
        }
    }

    fn frames_captured(&self) -> u64 {
        match &self.backend {
            NetworkBackend::Synthetic(stream) => stream.frame_count,
            #[cfg(feature = "stream-gstreamer")]
            NetworkBackend::Gstreamer(stream) => stream.frame_count,
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic stream (stub://)
// ----------------------------------------------------------------------------

struct SyntheticStream {
    width: u32,
    height: u32,
    frame_count: u64,
}

impl SyntheticStream {
    fn new(options: CaptureOptions) -> Self {
        let (width, height) = options
            .forced_dimensions()
            .unwrap_or((SYNTHETIC_DEFAULT_WIDTH, SYNTHETIC_DEFAULT_HEIGHT));
        Self {
            width,
            height,
            frame_count: 0,
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.frame_count += 1;

        // Gradient that drifts with the frame count, so consecutive frames
        // differ and downstream consumers see motion.
        let pixel_count = self.width as usize * self.height as usize * 3;
        let mut pixels = vec![0u8; pixel_count];
        for (i, value) in pixels.iter_mut().enumerate() {
            *value = ((i as u64 + self.frame_count) % 256) as u8;
        }

        Ok(Some(Frame::new(
            pixels,
            self.width,
            self.height,
            PixelFormat::Bgr8,
        )?))
    }
}

// ----------------------------------------------------------------------------
// GStreamer stream
// ----------------------------------------------------------------------------

#[cfg(feature = "stream-gstreamer")]
mod gst {
    use anyhow::{anyhow, Context, Result};
    use std::time::Duration;

    use super::super::CaptureOptions;
    use crate::frame::{Frame, PixelFormat};

    pub(super) struct GstreamerStream {
        pipeline: gstreamer::Pipeline,
        appsink: gstreamer_app::AppSink,
        pub(super) frame_count: u64,
        pull_timeout: Duration,
    }

    impl GstreamerStream {
        /// Build uridecodebin ! videoconvert ! BGR caps ! appsink and start it.
        pub(super) fn open(uri: &str, options: CaptureOptions) -> Result<Self> {
            gstreamer::init().context("initialize gstreamer")?;

            let dims_filter = match options.forced_dimensions() {
                Some((width, height)) => format!(",width={},height={}", width, height),
                None => String::new(),
            };
            let description = format!(
                "uridecodebin uri={} ! videoconvert ! video/x-raw,format=BGR{} ! \
                 appsink name=appsink sync=false max-buffers=1 drop=true",
                uri, dims_filter
            );
            let pipeline = gstreamer::parse_launch(&description)
                .context("build stream pipeline")?
                .downcast::<gstreamer::Pipeline>()
                .map_err(|_| anyhow!("stream pipeline is not a Pipeline"))?;

            let appsink = pipeline
                .by_name("appsink")
                .context("appsink element missing from pipeline")?
                .downcast::<gstreamer_app::AppSink>()
                .map_err(|_| anyhow!("appsink element has unexpected type"))?;

            let caps = gstreamer::Caps::builder("video/x-raw")
                .field("format", "BGR")
                .build();
            appsink.set_caps(Some(&caps));
            appsink.set_max_buffers(1);
            appsink.set_drop(true);
            appsink.set_sync(false);

            pipeline
                .set_state(gstreamer::State::Playing)
                .context("set stream pipeline to Playing")?;

            let base_ms = if options.fps == 0 {
                500
            } else {
                (1000 / options.fps).saturating_mul(4)
            };
            Ok(Self {
                pipeline,
                appsink,
                frame_count: 0,
                pull_timeout: Duration::from_millis(base_ms.max(500) as u64),
            })
        }

        pub(super) fn next_frame(&mut self) -> Result<Option<Frame>> {
            self.check_bus()?;

            let Some(sample) = self.appsink.try_pull_sample(self.pull_timeout) else {
                // Stalled or between frames; treat as no new content.
                return Ok(None);
            };

            let Some(frame) = sample_to_frame(&sample)? else {
                return Ok(None);
            };
            self.frame_count += 1;
            Ok(Some(frame))
        }

        fn check_bus(&mut self) -> Result<()> {
            let Some(bus) = self.pipeline.bus() else {
                return Ok(());
            };
            while let Some(message) = bus.timed_pop(Duration::from_millis(0)) {
                use gstreamer::MessageView;
                match message.view() {
                    MessageView::Error(err) => {
                        return Err(anyhow!(
                            "gstreamer error from {:?}: {}",
                            err.src().map(|s| s.path_string()),
                            err.error()
                        ));
                    }
                    MessageView::Eos(..) => {
                        return Err(anyhow!("stream reached end of stream"));
                    }
                    _ => {}
                }
            }
            Ok(())
        }
    }

    impl Drop for GstreamerStream {
        fn drop(&mut self) {
            let _ = self.pipeline.set_state(gstreamer::State::Null);
        }
    }

    fn sample_to_frame(sample: &gstreamer::Sample) -> Result<Option<Frame>> {
        let Some(buffer) = sample.buffer() else {
            return Ok(None);
        };
        let caps = sample.caps().context("stream sample missing caps")?;
        let info = gstreamer_video::VideoInfo::from_caps(caps)
            .context("parse stream caps as video info")?;

        let width = info.width();
        let height = info.height();
        let row_bytes = width as usize * 3;
        let stride = info.stride()[0] as usize;

        let map = buffer.map_readable().context("map stream buffer")?;
        let data = map.as_slice();

        let pixels = if stride == row_bytes {
            data.to_vec()
        } else {
            let mut pixels = Vec::with_capacity(row_bytes * height as usize);
            for row in 0..height as usize {
                let start = row * stride;
                let end = start + row_bytes;
                pixels.extend_from_slice(
                    data.get(start..end)
                        .context("stream buffer row is out of bounds")?,
                );
            }
            pixels
        };

        Ok(Some(Frame::new(pixels, width, height, PixelFormat::Bgr8)?))
    }
}
