//! camstream - fixed-rate camera capture, normalization, and republishing.
//!
//! A single linear pipeline: open a video source (local device index or
//! stream URI), pull one frame per tick, optionally flip it, normalize it to
//! single-channel 16-bit, attach a calibration record, and publish the
//! (image, calibration, timestamp) triple over MQTT - but only while at
//! least one consumer is registered. Startup parameters are read once; any
//! runtime failure is fatal and the process is expected to be restarted by a
//! supervisor.

pub mod calibration;
pub mod config;
pub mod frame;
pub mod ingest;
pub mod publish;
pub mod stream;
pub mod transform;

pub use calibration::{CalibrationRecord, CalibrationStore};
pub use config::{MqttSettings, Overrides, StreamConfig};
pub use frame::{Frame, ImageHeader, ImageMessage, PixelFormat};
pub use ingest::{CaptureOptions, FrameProducer, FrameSource, SourceKind};
pub use publish::{decode_image, encode_image, FrameSink, MqttSink, MqttSinkConfig};
pub use stream::{RatePacer, StreamLoop, StreamSettings, TickOutcome};
pub use transform::{FlipAxis, NormalizePipeline};
