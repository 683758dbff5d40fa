//! End-to-end pipeline tests driving the capture loop with the synthetic
//! stream backend and an in-memory sink.

use anyhow::Result;
use camstream::{
    decode_image, CalibrationRecord, CalibrationStore, CaptureOptions, FlipAxis, FrameSink, FrameSource, ImageMessage, SourceKind, StreamLoop, StreamSettings, TickOutcome,
};
use tempfile::tempdir;

/// Sink that records everything and lets tests vary the consumer count.
#[derive(Default)]
struct RecordingSink {
    consumers: usize,
    published: Vec<(ImageMessage, CalibrationRecord)>,
}

impl FrameSink for RecordingSink {
    fn consumer_count(&mut self) -> usize {
        self.consumers
    }

    fn publish(&mut self, image: &ImageMessage, calibration: &CalibrationRecord) -> Result<()> {
        self.published.push((image.clone(), calibration.clone()));
        Ok(())
    }
}

fn stub_source(width: u32, height: u32) -> FrameSource {
    let kind = SourceKind::resolve("stub://integration").expect("stub uri");
    FrameSource::open(
        kind,
        CaptureOptions {
            width,
            height,
            fps: 30,
        },
    )
    .expect("open stub source")
}

fn settings() -> StreamSettings {
    StreamSettings {
        flip: FlipAxis::None,
        encoding: "bgr8".to_string(),
        frame_id: "camera".to_string(),
    }
}

#[test]
fn stub_source_publishes_mono16_images() -> Result<()> {
    let sink = RecordingSink {
        consumers: 1,
        ..RecordingSink::default()
    };
    let calibration = CalibrationStore::open("camera", "")?;
    let mut stream = StreamLoop::new(stub_source(8, 4), sink, calibration, settings());

    for _ in 0..3 {
        assert_eq!(stream.tick()?, TickOutcome::Published);
    }

    let sink = stream.into_sink();
    assert_eq!(sink.published.len(), 3);
    for (seq, (image, calibration)) in sink.published.iter().enumerate() {
        assert_eq!(image.header.seq, seq as u64 + 1);
        assert_eq!(image.header.width, 8);
        assert_eq!(image.header.height, 4);
        // Single channel, 16-bit: two bytes per pixel.
        assert_eq!(image.data.len(), 8 * 4 * 2);
        assert_eq!(image.header.step, 16);
        assert_eq!(calibration.width, 8);
        assert_eq!(calibration.height, 4);
        assert!(image.header.stamp_ms > 0);
    }
    Ok(())
}

#[test]
fn published_images_survive_the_wire_format() -> Result<()> {
    let sink = RecordingSink {
        consumers: 1,
        ..RecordingSink::default()
    };
    let calibration = CalibrationStore::open("camera", "")?;
    let mut stream = StreamLoop::new(stub_source(4, 4), sink, calibration, settings());

    stream.tick()?;
    let sink = stream.into_sink();
    let (image, _) = &sink.published[0];

    let bytes = camstream::encode_image(image)?;
    let decoded = decode_image(&bytes)?;
    assert_eq!(&decoded, image);
    Ok(())
}

#[test]
fn idle_gate_blocks_device_reads_until_a_consumer_arrives() -> Result<()> {
    let sink = RecordingSink::default();
    let calibration = CalibrationStore::open("camera", "")?;
    let mut stream = StreamLoop::new(stub_source(4, 4), sink, calibration, settings());

    for _ in 0..5 {
        assert_eq!(stream.tick()?, TickOutcome::SkippedIdle);
    }
    assert_eq!(stream.frames_captured(), 0);
    Ok(())
}

#[test]
fn calibration_synthesized_on_first_publish_is_reloaded_next_run() -> Result<()> {
    let dir = tempdir()?;
    let locator = dir.path().join("camera.json");
    let locator = locator.to_string_lossy().to_string();

    // First run: nothing persisted, a default record is written.
    {
        let sink = RecordingSink {
            consumers: 1,
            ..RecordingSink::default()
        };
        let calibration = CalibrationStore::open("camera", &locator)?;
        let mut stream = StreamLoop::new(stub_source(6, 2), sink, calibration, settings());
        stream.tick()?;

        let sink = stream.into_sink();
        let (_, record) = &sink.published[0];
        assert_eq!(record.distortion_model, "plumb_bob");
        assert_eq!(record.k[2], 3.0);
        assert_eq!(record.k[5], 1.0);
    }

    // Second run: the persisted record is loaded and attached as-is.
    {
        let calibration = CalibrationStore::open("camera", &locator)?;
        let record = calibration.current().expect("record persisted by first run");
        assert_eq!(record.width, 6);
        assert_eq!(record.height, 2);
    }
    Ok(())
}
