//! Publishing side: sink trait, wire encoding, and the MQTT sink.
//!
//! The capture loop talks to a `FrameSink`, which reports how many consumers
//! are registered and delivers (image, calibration) pairs. The MQTT sink
//! counts consumers cooperatively: each consumer holds a retained `online`
//! payload on `<prefix>/<camera>/consumers/<id>` with an `offline` last-will,
//! and the sink subscribes to that subtree and counts the online entries.
//! MQTT brokers expose no portable subscriber-count query, so presence is the
//! observable stand-in.
//!
//! Topics, for prefix `camstream` and camera `camera`:
//! - `camstream/camera/image` - length-prefixed JSON header + raw pixels, QoS 0
//! - `camstream/camera/camera_info` - calibration record JSON, QoS 1, retained
//! - `camstream/camera/status` - publisher availability (LWT), retained
//! - `camstream/camera/consumers/<id>` - consumer presence, retained

use anyhow::{anyhow, Context, Result};
use rumqttc::{Client, Connection, Event, LastWill, MqttOptions, Packet, QoS};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::calibration::CalibrationRecord;
use crate::frame::{ImageHeader, ImageMessage};

const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";

/// Upper bound on the encoded image header, to reject corrupt length
/// prefixes before allocating.
const MAX_HEADER_LEN: usize = 4 * 1024;

/// Destination for published frames.
pub trait FrameSink {
    /// Number of currently registered consumers.
    fn consumer_count(&mut self) -> usize;

    /// Deliver one (image, calibration) pair.
    fn publish(&mut self, image: &ImageMessage, calibration: &CalibrationRecord) -> Result<()>;
}

/// Encode an image message: 4-byte big-endian header length, JSON header,
/// then the raw pixel payload.
pub fn encode_image(message: &ImageMessage) -> Result<Vec<u8>> {
    let header = serde_json::to_vec(&message.header).context("encode image header")?;
    if header.len() > MAX_HEADER_LEN {
        return Err(anyhow!("image header too large: {} bytes", header.len()));
    }
    let mut out = Vec::with_capacity(4 + header.len() + message.data.len());
    out.extend_from_slice(&(header.len() as u32).to_be_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(&message.data);
    Ok(out)
}

/// Decode the wire form produced by `encode_image`.
pub fn decode_image(bytes: &[u8]) -> Result<ImageMessage> {
    let prefix: [u8; 4] = bytes
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| anyhow!("image payload shorter than length prefix"))?;
    let header_len = u32::from_be_bytes(prefix) as usize;
    if header_len > MAX_HEADER_LEN {
        return Err(anyhow!("image header length {} exceeds limit", header_len));
    }
    let header_bytes = bytes
        .get(4..4 + header_len)
        .ok_or_else(|| anyhow!("image payload truncated inside header"))?;
    let header: ImageHeader =
        serde_json::from_slice(header_bytes).context("decode image header")?;
    let data = bytes[4 + header_len..].to_vec();
    Ok(ImageMessage { header, data })
}

/// MQTT sink configuration.
#[derive(Clone, Debug)]
pub struct MqttSinkConfig {
    /// Broker address as `host:port`.
    pub broker_addr: String,
    pub client_id: String,
    pub topic_prefix: String,
    pub camera_name: String,
}

struct Topics {
    image: String,
    camera_info: String,
    status: String,
    consumers_filter: String,
    consumers_prefix: String,
}

impl Topics {
    fn new(prefix: &str, camera: &str) -> Self {
        let base = format!("{}/{}", prefix, camera);
        Self {
            image: format!("{}/image", base),
            camera_info: format!("{}/camera_info", base),
            status: format!("{}/status", base),
            consumers_filter: format!("{}/consumers/+", base),
            consumers_prefix: format!("{}/consumers/", base),
        }
    }
}

/// MQTT frame sink backed by a background connection-drive thread.
pub struct MqttSink {
    client: Client,
    topics: Topics,
    consumers: Arc<Mutex<HashSet<String>>>,
    drive_handle: Option<std::thread::JoinHandle<()>>,
}

impl MqttSink {
    /// Connect to the broker, announce availability, and subscribe to the
    /// consumer presence subtree.
    pub fn connect(config: MqttSinkConfig) -> Result<Self> {
        let (host, port) = parse_broker_addr(&config.broker_addr)?;
        let topics = Topics::new(&config.topic_prefix, &config.camera_name);

        let mut options = MqttOptions::new(config.client_id.as_str(), host, port);
        options.set_keep_alive(Duration::from_secs(5));
        options.set_last_will(LastWill::new(
            topics.status.as_str(),
            PAYLOAD_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        let (client, connection) = Client::new(options, 16);
        let consumers = Arc::new(Mutex::new(HashSet::new()));
        let drive_handle = spawn_drive_thread(connection, consumers.clone(), &topics);

        client
            .subscribe(topics.consumers_filter.as_str(), QoS::AtLeastOnce)
            .context("subscribe to consumer presence")?;
        client
            .publish(topics.status.as_str(), QoS::AtLeastOnce, true, PAYLOAD_ONLINE)
            .context("announce publisher availability")?;

        log::info!(
            "mqtt sink connected to {} publishing on {}",
            config.broker_addr,
            topics.image
        );

        Ok(Self {
            client,
            topics,
            consumers,
            drive_handle: Some(drive_handle),
        })
    }

    /// Announce departure and tear down the connection thread.
    pub fn disconnect(mut self) -> Result<()> {
        self.client
            .publish(self.topics.status.as_str(), QoS::AtLeastOnce, true, PAYLOAD_OFFLINE)
            .context("announce publisher departure")?;
        self.client.disconnect().context("disconnect mqtt client")?;
        if let Some(handle) = self.drive_handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl FrameSink for MqttSink {
    fn consumer_count(&mut self) -> usize {
        let set = self
            .consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        set.len()
    }

    fn publish(&mut self, image: &ImageMessage, calibration: &CalibrationRecord) -> Result<()> {
        // Frames are at-most-once, latest-wins; calibration is retained so a
        // late consumer still sees the current record.
        let payload = encode_image(image)?;
        self.client
            .publish(self.topics.image.as_str(), QoS::AtMostOnce, false, payload)
            .context("publish image")?;

        let calibration_json =
            serde_json::to_vec(calibration).context("encode calibration record")?;
        self.client
            .publish(
                self.topics.camera_info.as_str(),
                QoS::AtLeastOnce,
                true,
                calibration_json,
            )
            .context("publish calibration")?;
        Ok(())
    }
}

fn spawn_drive_thread(
    mut connection: Connection,
    consumers: Arc<Mutex<HashSet<String>>>,
    topics: &Topics,
) -> std::thread::JoinHandle<()> {
    let consumers_prefix = topics.consumers_prefix.clone();
    std::thread::spawn(move || {
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if let Some(id) = publish.topic.strip_prefix(&consumers_prefix) {
                        let online = publish.payload.as_ref() == PAYLOAD_ONLINE.as_bytes();
                        let mut set = consumers
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        if online {
                            if set.insert(id.to_string()) {
                                log::info!("consumer {} registered", id);
                            }
                        } else if set.remove(id) {
                            log::info!("consumer {} departed", id);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("mqtt connection error: {}", e);
                    break;
                }
            }
        }
    })
}

fn parse_broker_addr(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("broker address {:?} must be host:port", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid broker port in {:?}", addr))?;
    if host.is_empty() {
        return Err(anyhow!("broker address {:?} has an empty host", addr));
    }
    Ok((host.to_string(), port))
}
