//! Frame acquisition sources.
//!
//! Two backends produce frames:
//! - Local capture devices (feature: capture-v4l2)
//! - Network/file streams (feature: stream-gstreamer)
//!
//! `stub://` URIs get a synthetic in-memory backend that is always available,
//! so the daemon and tests run without hardware or a decoder stack.
//!
//! A source identifier shorter than four characters is parsed as a device
//! index (nobody connects a thousand cameras); anything longer is a URI.
//! Sources yield at most one frame per call and hold no queue.

pub mod device;
pub mod network;

use anyhow::{Context, Result};

use crate::frame::Frame;
pub use device::DeviceSource;
pub use network::NetworkSource;

/// How many characters a source token may have before it is treated as a URI
/// rather than a device index.
const MAX_INDEX_TOKEN_LEN: usize = 3;

/// Resolved kind of a source identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Local capture device, e.g. index 0 for /dev/video0.
    DeviceIndex(u32),
    /// Network stream, file, or stub URI.
    Uri(String),
}

impl SourceKind {
    /// Decide whether a source token denotes a device index or a URI.
    ///
    /// Tokens under four characters must parse as an unsigned index; a short
    /// non-numeric token is a configuration error rather than device 0.
    pub fn resolve(token: &str) -> Result<Self> {
        let token = token.trim();
        if token.is_empty() {
            anyhow::bail!("source must not be empty");
        }
        if token.chars().count() <= MAX_INDEX_TOKEN_LEN {
            let index: u32 = token
                .parse()
                .with_context(|| format!("source {:?} is not a device index", token))?;
            Ok(SourceKind::DeviceIndex(index))
        } else {
            Ok(SourceKind::Uri(token.to_string()))
        }
    }
}

/// Capture configuration shared by all backends.
#[derive(Clone, Debug)]
pub struct CaptureOptions {
    /// Forced capture width; applied only when height is also non-zero.
    pub width: u32,
    /// Forced capture height; applied only when width is also non-zero.
    pub height: u32,
    /// Target loop rate, passed to drivers that accept a rate hint.
    pub fps: u32,
}

impl CaptureOptions {
    /// Both dimensions must be non-zero for a forced resolution to apply.
    pub fn forced_dimensions(&self) -> Option<(u32, u32)> {
        if self.width != 0 && self.height != 0 {
            Some((self.width, self.height))
        } else {
            None
        }
    }
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            fps: 240,
        }
    }
}

/// Anything the capture loop can pull frames from.
///
/// `next_frame` blocks for the next frame; `Ok(None)` means the source had no
/// new content this call (an empty or undecodable frame), which the loop
/// treats as a skipped tick, not an error.
pub trait FrameProducer {
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Frames produced so far, for health logging.
    fn frames_captured(&self) -> u64;
}

/// Facade over the concrete backends, selected by `SourceKind`.
pub enum FrameSource {
    Device(DeviceSource),
    Network(NetworkSource),
}

impl FrameSource {
    /// Open and configure a source. Failure here is fatal to the process.
    pub fn open(kind: SourceKind, options: CaptureOptions) -> Result<Self> {
        match kind {
            SourceKind::DeviceIndex(index) => {
                log::info!("opening capture device /dev/video{}", index);
                Ok(FrameSource::Device(DeviceSource::open(index, options)?))
            }
            SourceKind::Uri(uri) => {
                log::info!("opening stream {}", uri);
                Ok(FrameSource::Network(NetworkSource::open(&uri, options)?))
            }
        }
    }
}

impl FrameProducer for FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self {
            FrameSource::Device(source) => source.next_frame(),
            FrameSource::Network(source) => source.next_frame(),
        }
    }

    fn frames_captured(&self) -> u64 {
        match self {
            FrameSource::Device(source) => source.frames_captured(),
            FrameSource::Network(source) => source.frames_captured(),
        }
    }
}
