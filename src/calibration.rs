//! Camera calibration records: load, synthesize, persist.
//!
//! A record persisted at the configured locator is loaded once at startup. A
//! record whose distortion model is empty counts as absent. When no record is
//! present, a pinhole default is synthesized from the first published image's
//! dimensions (unit focal length, principal point at the image center, zero
//! distortion) and written back for future runs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Distortion model name used for synthesized defaults.
pub const DEFAULT_DISTORTION_MODEL: &str = "plumb_bob";

/// Intrinsic and extrinsic camera parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub camera_name: String,
    pub frame_id: String,
    pub width: u32,
    pub height: u32,
    /// Empty string means "no calibration" when loading persisted records.
    #[serde(default)]
    pub distortion_model: String,
    /// Distortion coefficients (5 for plumb_bob).
    #[serde(default)]
    pub d: Vec<f64>,
    /// 3x3 intrinsic matrix, row-major.
    pub k: [f64; 9],
    /// 3x3 rectification matrix, row-major.
    pub r: [f64; 9],
    /// 3x4 projection matrix, row-major.
    pub p: [f64; 12],
}

impl CalibrationRecord {
    /// Synthesize the pinhole default for an image of the given dimensions:
    /// fx = fy = 1.0, principal point at the center, identity rectification,
    /// projection = [K | 0], five zero distortion coefficients.
    pub fn default_for(camera_name: &str, frame_id: &str, width: u32, height: u32) -> Self {
        let cx = width as f64 / 2.0;
        let cy = height as f64 / 2.0;
        Self {
            camera_name: camera_name.to_string(),
            frame_id: frame_id.to_string(),
            width,
            height,
            distortion_model: DEFAULT_DISTORTION_MODEL.to_string(),
            d: vec![0.0; 5],
            k: [
                1.0, 0.0, cx,
                0.0, 1.0, cy,
                0.0, 0.0, 1.0,
            ],
            r: [
                1.0, 0.0, 0.0,
                0.0, 1.0, 0.0,
                0.0, 0.0, 1.0,
            ],
            p: [
                1.0, 0.0, cx, 0.0,
                0.0, 1.0, cy, 0.0,
                0.0, 0.0, 1.0, 0.0,
            ],
        }
    }

    /// A loaded record only counts once its distortion model is set.
    pub fn is_established(&self) -> bool {
        !self.distortion_model.is_empty()
    }
}

/// Holds the current in-memory record and its persistence locator.
pub struct CalibrationStore {
    camera_name: String,
    locator: Option<PathBuf>,
    record: Option<CalibrationRecord>,
}

impl CalibrationStore {
    /// Load any persisted record for `camera_name` at `locator`.
    ///
    /// An empty locator means nothing is persisted and nothing will be
    /// persisted. A missing file is not an error; a file that exists but does
    /// not parse is.
    pub fn open(camera_name: &str, locator: &str) -> Result<Self> {
        let locator = if locator.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(locator))
        };

        let record = match &locator {
            Some(path) if path.exists() => {
                let record = read_record(path)?;
                if record.is_established() {
                    log::info!(
                        "loaded calibration for {} from {} ({}x{})",
                        camera_name,
                        path.display(),
                        record.width,
                        record.height
                    );
                    Some(record)
                } else {
                    log::warn!(
                        "calibration at {} has no distortion model set, treating as absent",
                        path.display()
                    );
                    None
                }
            }
            Some(path) => {
                log::info!("no calibration file at {}", path.display());
                None
            }
            None => None,
        };

        Ok(Self {
            camera_name: camera_name.to_string(),
            locator,
            record,
        })
    }

    pub fn current(&self) -> Option<&CalibrationRecord> {
        self.record.as_ref()
    }

    /// Synthesize the default record from published image dimensions, persist
    /// it if a locator was configured, and keep it as the current record.
    pub fn establish(
        &mut self,
        frame_id: &str,
        width: u32,
        height: u32,
    ) -> Result<&CalibrationRecord> {
        let record = CalibrationRecord::default_for(&self.camera_name, frame_id, width, height);
        if let Some(path) = &self.locator {
            write_record(path, &record)?;
            log::info!(
                "persisted default calibration for {} to {}",
                self.camera_name,
                path.display()
            );
        }
        Ok(self.record.insert(record))
    }
}

fn read_record(path: &Path) -> Result<CalibrationRecord> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read calibration file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid calibration file {}", path.display()))
}

fn write_record(path: &Path, record: &CalibrationRecord) -> Result<()> {
    let json = serde_json::to_string_pretty(record).context("encode calibration record")?;
    std::fs::write(path, json)
        .with_context(|| format!("write calibration file {}", path.display()))
}
