//! camstreamd - camera stream publishing daemon.
//!
//! Opens the configured video source, then runs the fixed-rate
//! capture-transform-publish loop until terminated. Any failure after
//! argument parsing is fatal; restart policy belongs to the process
//! supervisor.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camstream::{
    CalibrationStore, CaptureOptions, FlipAxis, FrameSource, MqttSink, MqttSinkConfig, Overrides,
    RatePacer, SourceKind, StreamConfig, StreamLoop, StreamSettings, TickOutcome,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Capture frames from a camera or stream and republish them over MQTT"
)]
struct Args {
    /// Optional TOML config file; command line and environment win over it.
    #[arg(long, env = "CAMSTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Video source: device index (e.g. 0) or stream URI.
    #[arg(long, env = "CAMSTREAM_SOURCE")]
    source: Option<String>,

    /// Camera name, used as calibration key and topic segment.
    #[arg(long, env = "CAMSTREAM_CAMERA_NAME")]
    camera_name: Option<String>,

    /// Loop tick rate in frames per second.
    #[arg(long, env = "CAMSTREAM_FPS")]
    fps: Option<u32>,

    /// Frame id stamped on outgoing headers.
    #[arg(long, env = "CAMSTREAM_FRAME_ID")]
    frame_id: Option<String>,

    /// Path of the persisted calibration record (JSON).
    #[arg(long, env = "CAMSTREAM_CAMERA_INFO_URL")]
    camera_info_url: Option<String>,

    /// Mirror frames around the vertical axis.
    #[arg(long, env = "CAMSTREAM_FLIP_HORIZONTAL")]
    flip_horizontal: bool,

    /// Mirror frames around the horizontal axis.
    #[arg(long, env = "CAMSTREAM_FLIP_VERTICAL")]
    flip_vertical: bool,

    /// Encoding label carried on outgoing image messages.
    #[arg(long, env = "CAMSTREAM_MSG_ENCODING")]
    msg_encoding: Option<String>,

    /// Forced capture width; needs height too.
    #[arg(long, env = "CAMSTREAM_WIDTH")]
    width: Option<u32>,

    /// Forced capture height; needs width too.
    #[arg(long, env = "CAMSTREAM_HEIGHT")]
    height: Option<u32>,

    /// MQTT broker address.
    #[arg(long, env = "MQTT_BROKER_ADDR")]
    mqtt_broker_addr: Option<String>,

    /// MQTT topic prefix.
    #[arg(long, env = "MQTT_TOPIC_PREFIX")]
    mqtt_topic_prefix: Option<String>,

    /// MQTT client identifier.
    #[arg(long, env = "MQTT_CLIENT_ID")]
    mqtt_client_id: Option<String>,
}

impl Args {
    fn into_overrides(self) -> (Option<PathBuf>, Overrides) {
        let config = self.config;
        let overrides = Overrides {
            source: self.source,
            camera_name: self.camera_name,
            fps: self.fps,
            frame_id: self.frame_id,
            camera_info_url: self.camera_info_url,
            flip_horizontal: self.flip_horizontal.then_some(true),
            flip_vertical: self.flip_vertical.then_some(true),
            msg_encoding: self.msg_encoding,
            width: self.width,
            height: self.height,
            mqtt_broker_addr: self.mqtt_broker_addr,
            mqtt_topic_prefix: self.mqtt_topic_prefix,
            mqtt_client_id: self.mqtt_client_id,
        };
        (config, overrides)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (config_path, overrides) = Args::parse().into_overrides();
    let cfg = StreamConfig::resolve(config_path.as_deref(), overrides)?;
    log_configuration(&cfg);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("install signal handler")?;
    }

    let kind = SourceKind::resolve(&cfg.source)?;
    let source = FrameSource::open(
        kind,
        CaptureOptions {
            width: cfg.width,
            height: cfg.height,
            fps: cfg.fps,
        },
    )?;

    let calibration = CalibrationStore::open(&cfg.camera_name, &cfg.camera_info_url)?;

    let sink = MqttSink::connect(MqttSinkConfig {
        broker_addr: cfg.mqtt.broker_addr.clone(),
        client_id: cfg.mqtt.client_id.clone(),
        topic_prefix: cfg.mqtt.topic_prefix.clone(),
        camera_name: cfg.camera_name.clone(),
    })?;

    let settings = StreamSettings {
        flip: FlipAxis::from_flags(cfg.flip_horizontal, cfg.flip_vertical),
        encoding: cfg.msg_encoding.clone(),
        frame_id: cfg.frame_id.clone(),
    };
    let mut stream = StreamLoop::new(source, sink, calibration, settings);
    let mut pacer = RatePacer::new(cfg.fps);

    log::info!("opened the stream, starting to publish");

    let mut published = 0u64;
    let mut last_health_log = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        match stream.tick().context("stream tick failed")? {
            TickOutcome::Published => published += 1,
            TickOutcome::SkippedIdle | TickOutcome::SkippedEmptyFrame => {}
        }

        if last_health_log.elapsed() >= Duration::from_secs(5) {
            log::info!(
                "captured={} published={} consumers={}",
                stream.frames_captured(),
                published,
                stream.consumer_count()
            );
            last_health_log = Instant::now();
        }

        pacer.sleep_remainder();
    }

    log::info!("shutting down after {} published frames", published);
    stream.into_sink().disconnect()?;
    Ok(())
}

fn log_configuration(cfg: &StreamConfig) {
    log::info!("source: {}", cfg.source);
    log::info!("camera name: {}", cfg.camera_name);
    log::info!("throttling to fps: {}", cfg.fps);
    log::info!("publishing with frame_id: {}", cfg.frame_id);
    log::info!("camera_info_url: {:?}", cfg.camera_info_url);
    log::info!("flip horizontal: {}", cfg.flip_horizontal);
    log::info!("flip vertical: {}", cfg.flip_vertical);
    log::info!("message encoding: {}", cfg.msg_encoding);
    if cfg.width != 0 && cfg.height != 0 {
        log::info!("forced resolution: {}x{}", cfg.width, cfg.height);
    }
    log::info!(
        "mqtt broker {} prefix {} client {}",
        cfg.mqtt.broker_addr,
        cfg.mqtt.topic_prefix,
        cfg.mqtt.client_id
    );
}
