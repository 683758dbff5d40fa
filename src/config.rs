//! Startup configuration.
//!
//! Values are read once at startup and fixed for the process lifetime.
//! Precedence: command line > environment > config file > default. The
//! command-line and environment layers are handled by clap in the binary and
//! arrive here as `Overrides`; this module owns the file layer, the defaults,
//! and validation.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_CAMERA_NAME: &str = "camera";
pub const DEFAULT_FPS: u32 = 240;
pub const DEFAULT_FRAME_ID: &str = "camera";
pub const DEFAULT_MSG_ENCODING: &str = "bgr8";
pub const DEFAULT_MQTT_BROKER_ADDR: &str = "127.0.0.1:1883";
pub const DEFAULT_MQTT_TOPIC_PREFIX: &str = "camstream";
pub const DEFAULT_MQTT_CLIENT_ID: &str = "camstreamd";

/// Optional TOML config file shape.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    source: Option<String>,
    camera_name: Option<String>,
    fps: Option<u32>,
    frame_id: Option<String>,
    camera_info_url: Option<String>,
    flip_horizontal: Option<bool>,
    flip_vertical: Option<bool>,
    msg_encoding: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker_addr: Option<String>,
    topic_prefix: Option<String>,
    client_id: Option<String>,
}

/// Values supplied on the command line or via environment, overriding the
/// file layer. `None` means "not given".
#[derive(Debug, Default)]
pub struct Overrides {
    pub source: Option<String>,
    pub camera_name: Option<String>,
    pub fps: Option<u32>,
    pub frame_id: Option<String>,
    pub camera_info_url: Option<String>,
    pub flip_horizontal: Option<bool>,
    pub flip_vertical: Option<bool>,
    pub msg_encoding: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub mqtt_broker_addr: Option<String>,
    pub mqtt_topic_prefix: Option<String>,
    pub mqtt_client_id: Option<String>,
}

/// Resolved startup configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Device index or stream URI. Required.
    pub source: String,
    pub camera_name: String,
    pub fps: u32,
    pub frame_id: String,
    /// Persisted calibration locator; empty means none.
    pub camera_info_url: String,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
    pub msg_encoding: String,
    /// Forced capture resolution; applied only when both are non-zero.
    pub width: u32,
    pub height: u32,
    pub mqtt: MqttSettings,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker_addr: String,
    pub topic_prefix: String,
    pub client_id: String,
}

impl StreamConfig {
    /// Merge the file layer (if any) with overrides, then validate.
    pub fn resolve(config_path: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let file = match config_path {
            Some(path) => read_config_file(path)?,
            None => ConfigFile::default(),
        };

        let mqtt_file = file.mqtt.unwrap_or_default();
        let cfg = Self {
            source: overrides
                .source
                .or(file.source)
                .ok_or_else(|| anyhow!("source is required (device index or stream URI)"))?,
            camera_name: overrides
                .camera_name
                .or(file.camera_name)
                .unwrap_or_else(|| DEFAULT_CAMERA_NAME.to_string()),
            fps: overrides.fps.or(file.fps).unwrap_or(DEFAULT_FPS),
            frame_id: overrides
                .frame_id
                .or(file.frame_id)
                .unwrap_or_else(|| DEFAULT_FRAME_ID.to_string()),
            camera_info_url: overrides
                .camera_info_url
                .or(file.camera_info_url)
                .unwrap_or_default(),
            flip_horizontal: overrides
                .flip_horizontal
                .or(file.flip_horizontal)
                .unwrap_or(false),
            flip_vertical: overrides
                .flip_vertical
                .or(file.flip_vertical)
                .unwrap_or(false),
            msg_encoding: overrides
                .msg_encoding
                .or(file.msg_encoding)
                .unwrap_or_else(|| DEFAULT_MSG_ENCODING.to_string()),
            width: overrides.width.or(file.width).unwrap_or(0),
            height: overrides.height.or(file.height).unwrap_or(0),
            mqtt: MqttSettings {
                broker_addr: overrides
                    .mqtt_broker_addr
                    .or(mqtt_file.broker_addr)
                    .unwrap_or_else(|| DEFAULT_MQTT_BROKER_ADDR.to_string()),
                topic_prefix: overrides
                    .mqtt_topic_prefix
                    .or(mqtt_file.topic_prefix)
                    .unwrap_or_else(|| DEFAULT_MQTT_TOPIC_PREFIX.to_string()),
                client_id: overrides
                    .mqtt_client_id
                    .or(mqtt_file.client_id)
                    .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
            },
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(anyhow!("source must not be empty"));
        }
        if self.fps == 0 {
            return Err(anyhow!("fps must be greater than zero"));
        }
        if self.camera_name.trim().is_empty() {
            return Err(anyhow!("camera_name must not be empty"));
        }
        if self.frame_id.trim().is_empty() {
            return Err(anyhow!("frame_id must not be empty"));
        }
        if self.msg_encoding.trim().is_empty() {
            return Err(anyhow!("msg_encoding must not be empty"));
        }
        if (self.width == 0) != (self.height == 0) {
            log::warn!(
                "forced resolution needs both width and height; ignoring {}x{}",
                self.width,
                self.height
            );
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
}
