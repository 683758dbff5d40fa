//! The capture-publish loop.
//!
//! `StreamLoop` owns everything one tick touches: the frame source, the
//! transform settings, the calibration store, and the sink. The lifecycle is
//! one-directional - open, configure, stream, terminate - and within
//! streaming each tick re-decides between idle and publishing based on the
//! sink's consumer count. `tick` reports what happened as a `TickOutcome`;
//! errors propagate to the caller, which decides to exit (there is no
//! in-loop retry).

use anyhow::{Context, Result};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::calibration::CalibrationStore;
use crate::frame::{ImageHeader, ImageMessage};
use crate::ingest::FrameProducer;
use crate::publish::FrameSink;
use crate::transform::{flip_in_place, FlipAxis, NormalizePipeline};

/// What a single tick did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// A frame was acquired, transformed, and published.
    Published,
    /// No consumers registered; the device was not read.
    SkippedIdle,
    /// The source had no new content; nothing was published.
    SkippedEmptyFrame,
}

/// Fixed per-process transform and labeling parameters.
#[derive(Clone, Debug)]
pub struct StreamSettings {
    pub flip: FlipAxis,
    /// Encoding label attached to outgoing images, carried verbatim.
    pub encoding: String,
    /// Frame id attached to outgoing headers.
    pub frame_id: String,
}

/// The loop state object: source, transform, calibration, sink.
pub struct StreamLoop<P: FrameProducer, S: FrameSink> {
    source: P,
    sink: S,
    calibration: CalibrationStore,
    settings: StreamSettings,
    /// Normalization stages, resolved from the first captured frame's format
    /// and reused for the rest of the process.
    pipeline: Option<NormalizePipeline>,
    seq: u64,
}

impl<P: FrameProducer, S: FrameSink> StreamLoop<P, S> {
    pub fn new(
        source: P,
        sink: S,
        calibration: CalibrationStore,
        settings: StreamSettings,
    ) -> Self {
        Self {
            source,
            sink,
            calibration,
            settings,
            pipeline: None,
            seq: 0,
        }
    }

    /// Run one tick of the acquire-transform-publish sequence.
    pub fn tick(&mut self) -> Result<TickOutcome> {
        if self.sink.consumer_count() == 0 {
            return Ok(TickOutcome::SkippedIdle);
        }

        let Some(mut frame) = self.source.next_frame()? else {
            return Ok(TickOutcome::SkippedEmptyFrame);
        };

        if !self.settings.flip.is_none() {
            flip_in_place(&mut frame, self.settings.flip);
        }

        let pipeline = match &self.pipeline {
            Some(pipeline) => *pipeline,
            None => {
                let pipeline = NormalizePipeline::for_source(frame.format)?;
                log::info!("captured stream format: {}", frame.format.label());
                *self.pipeline.insert(pipeline)
            }
        };
        let normalized = pipeline.apply(&frame)?;

        self.seq += 1;
        let header = ImageHeader {
            frame_id: self.settings.frame_id.clone(),
            stamp_ms: epoch_millis()?,
            seq: self.seq,
            width: normalized.width,
            height: normalized.height,
            encoding: self.settings.encoding.clone(),
            step: normalized.step() as u32,
        };
        let image = ImageMessage {
            header,
            data: normalized.data,
        };

        // Synthesize and persist a default record off the first outgoing
        // image when nothing was loaded at startup.
        let calibration = match self.calibration.current() {
            Some(record) => record.clone(),
            None => {
                log::warn!(
                    "no calibration loaded, publishing a default record for {}x{}",
                    image.header.width,
                    image.header.height
                );
                self.calibration
                    .establish(
                        &self.settings.frame_id,
                        image.header.width,
                        image.header.height,
                    )?
                    .clone()
            }
        };

        self.sink.publish(&image, &calibration)?;
        Ok(TickOutcome::Published)
    }

    /// Frames the underlying source has produced, for health logging.
    pub fn frames_captured(&self) -> u64 {
        self.source.frames_captured()
    }

    /// Consumers currently registered at the sink.
    pub fn consumer_count(&mut self) -> usize {
        self.sink.consumer_count()
    }

    /// Tear the loop apart, handing the sink back for shutdown.
    pub fn into_sink(self) -> S {
        self.sink
    }
}

fn epoch_millis() -> Result<u64> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before the Unix epoch")?;
    Ok(now.as_millis() as u64)
}

/// Paces the loop to a fixed tick rate by sleeping out the remainder of each
/// period, however long the tick's work took.
pub struct RatePacer {
    period: Duration,
    deadline: Instant,
}

impl RatePacer {
    pub fn new(fps: u32) -> Self {
        // fps is validated non-zero at configuration time.
        let period = Duration::from_secs(1) / fps.max(1);
        Self {
            period,
            deadline: Instant::now() + period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Sleep until the end of the current period, then arm the next one. A
    /// tick that overran its period does not accumulate debt; the next
    /// deadline is taken from now.
    pub fn sleep_remainder(&mut self) {
        let now = Instant::now();
        if self.deadline > now {
            std::thread::sleep(self.deadline - now);
            self.deadline += self.period;
        } else {
            self.deadline = now + self.period;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationRecord;
    use crate::frame::{Frame, PixelFormat};
    use crate::ingest::FrameProducer;

    /// Scripted source: yields the queued frames, then `None` forever.
    struct ScriptedSource {
        frames: Vec<Option<Frame>>,
        reads: usize,
        produced: u64,
    }

    impl ScriptedSource {
        fn new(frames: Vec<Option<Frame>>) -> Self {
            Self {
                frames,
                reads: 0,
                produced: 0,
            }
        }
    }

    impl FrameProducer for ScriptedSource {
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            self.reads += 1;
            let next = if self.frames.is_empty() {
                None
            } else {
                self.frames.remove(0)
            };
            if next.is_some() {
                self.produced += 1;
            }
            Ok(next)
        }

        fn frames_captured(&self) -> u64 {
            self.produced
        }
    }

    /// In-memory sink capturing everything published.
    #[derive(Default)]
    struct MemorySink {
        consumers: usize,
        published: Vec<(ImageMessage, CalibrationRecord)>,
    }

    impl FrameSink for MemorySink {
        fn consumer_count(&mut self) -> usize {
            self.consumers
        }

        fn publish(
            &mut self,
            image: &ImageMessage,
            calibration: &CalibrationRecord,
        ) -> Result<()> {
            self.published.push((image.clone(), calibration.clone()));
            Ok(())
        }
    }

    fn white_bgr_frame(width: u32, height: u32) -> Frame {
        let len = (width * height * 3) as usize;
        Frame::new(vec![255u8; len], width, height, PixelFormat::Bgr8).unwrap()
    }

    fn settings() -> StreamSettings {
        StreamSettings {
            flip: FlipAxis::None,
            encoding: "bgr8".to_string(),
            frame_id: "camera".to_string(),
        }
    }

    fn make_loop(
        frames: Vec<Option<Frame>>,
        consumers: usize,
    ) -> StreamLoop<ScriptedSource, MemorySink> {
        let sink = MemorySink {
            consumers,
            ..MemorySink::default()
        };
        let calibration = CalibrationStore::open("camera", "").unwrap();
        StreamLoop::new(ScriptedSource::new(frames), sink, calibration, settings())
    }

    #[test]
    fn idle_tick_skips_device_read() -> Result<()> {
        let mut stream = make_loop(vec![Some(white_bgr_frame(2, 2))], 0);

        assert_eq!(stream.tick()?, TickOutcome::SkippedIdle);
        assert_eq!(stream.source.reads, 0, "idle tick must not touch the device");
        assert!(stream.sink.published.is_empty());
        Ok(())
    }

    #[test]
    fn empty_frame_skips_without_error() -> Result<()> {
        let mut stream = make_loop(vec![None, Some(white_bgr_frame(2, 2))], 1);

        assert_eq!(stream.tick()?, TickOutcome::SkippedEmptyFrame);
        assert!(stream.sink.published.is_empty());

        assert_eq!(stream.tick()?, TickOutcome::Published);
        assert_eq!(stream.sink.published.len(), 1);
        Ok(())
    }

    #[test]
    fn white_frame_publishes_full_scale_mono16() -> Result<()> {
        let mut stream = make_loop(vec![Some(white_bgr_frame(2, 2))], 1);

        assert_eq!(stream.tick()?, TickOutcome::Published);
        let (image, _) = &stream.sink.published[0];

        assert_eq!(image.header.width, 2);
        assert_eq!(image.header.height, 2);
        assert_eq!(image.header.step, 4);
        assert_eq!(image.header.encoding, "bgr8");
        assert_eq!(image.data.len(), 8);
        for pair in image.data.chunks_exact(2) {
            assert_eq!(u16::from_le_bytes([pair[0], pair[1]]), 65535);
        }
        Ok(())
    }

    #[test]
    fn first_publish_synthesizes_calibration_from_image_dims() -> Result<()> {
        let mut stream = make_loop(vec![Some(white_bgr_frame(4, 2))], 1);

        stream.tick()?;
        let (image, calibration) = &stream.sink.published[0];

        assert_eq!(calibration.width, image.header.width);
        assert_eq!(calibration.height, image.header.height);
        assert_eq!(calibration.k[0], 1.0);
        assert_eq!(calibration.k[2], 2.0);
        assert_eq!(calibration.k[5], 1.0);
        assert_eq!(calibration.d, vec![0.0; 5]);
        Ok(())
    }

    #[test]
    fn calibration_is_reused_after_first_publish() -> Result<()> {
        let frames = vec![
            Some(white_bgr_frame(2, 2)),
            Some(white_bgr_frame(2, 2)),
        ];
        let mut stream = make_loop(frames, 1);

        stream.tick()?;
        stream.tick()?;

        let (_, first) = &stream.sink.published[0];
        let (_, second) = &stream.sink.published[1];
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn sequence_numbers_count_published_frames_only() -> Result<()> {
        let frames = vec![
            Some(white_bgr_frame(2, 2)),
            None,
            Some(white_bgr_frame(2, 2)),
        ];
        let mut stream = make_loop(frames, 1);

        stream.tick()?;
        stream.tick()?;
        stream.tick()?;

        assert_eq!(stream.sink.published.len(), 2);
        assert_eq!(stream.sink.published[0].0.header.seq, 1);
        assert_eq!(stream.sink.published[1].0.header.seq, 2);
        Ok(())
    }

    #[test]
    fn flip_applies_before_normalization() -> Result<()> {
        // 2x1 BGR: left pixel white, right pixel black. Horizontal flip puts
        // black on the left of the published buffer.
        let frame = Frame::new(
            vec![255, 255, 255, 0, 0, 0],
            2,
            1,
            PixelFormat::Bgr8,
        )?;
        let sink = MemorySink {
            consumers: 1,
            ..MemorySink::default()
        };
        let calibration = CalibrationStore::open("camera", "")?;
        let mut stream = StreamLoop::new(
            ScriptedSource::new(vec![Some(frame)]),
            sink,
            calibration,
            StreamSettings {
                flip: FlipAxis::Horizontal,
                ..settings()
            },
        );

        stream.tick()?;
        let (image, _) = &stream.sink.published[0];
        let left = u16::from_le_bytes([image.data[0], image.data[1]]);
        let right = u16::from_le_bytes([image.data[2], image.data[3]]);
        assert_eq!(left, 0);
        assert_eq!(right, 65535);
        Ok(())
    }

    #[test]
    fn pacer_holds_the_tick_period() {
        let mut pacer = RatePacer::new(100);
        assert_eq!(pacer.period(), Duration::from_millis(10));

        let start = Instant::now();
        pacer.sleep_remainder();
        pacer.sleep_remainder();
        // Two periods of work-free ticks take at least two periods, with
        // generous slack for scheduler jitter.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(15), "elapsed {:?}", elapsed);
    }
}
