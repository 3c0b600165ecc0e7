use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::queue::OverflowPolicy;

const DEFAULT_SOURCE: &str = "stub://camera";
const DEFAULT_CAPTURE_WIDTH: u32 = 1280;
const DEFAULT_CAPTURE_HEIGHT: u32 = 720;
const DEFAULT_CAPTURE_FPS: u32 = 25;
const DEFAULT_MODEL: &str = "yolov8m.onnx";
const DEFAULT_DEVICE: &str = "auto";
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_IOU: f32 = 0.85;
const DEFAULT_QUEUE_CAPACITY: usize = 16;
const DEFAULT_ENQUEUE_TIMEOUT_MS: u64 = 50;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;
const DEFAULT_JOIN_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_STATS_INTERVAL: u64 = 100;
const DEFAULT_REDIS_HOST: &str = "localhost";
const DEFAULT_REDIS_PORT: u16 = 6379;
const DEFAULT_KEY_PREFIX: &str = "image_metadata";
const DEFAULT_CHANNEL: &str = "image:metadata:updates";
const DEFAULT_TTL_SECS: u64 = 3_600;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_STREAM_URL: &str = "rtmp://localhost/live/stream";
const DEFAULT_ENCODER: &str = "ffmpeg";
const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    source: Option<SourceConfigFile>,
    detector: Option<DetectorConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    metadata: Option<MetadataConfigFile>,
    stream: Option<StreamConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    uri: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    model: Option<String>,
    device: Option<String>,
    confidence: Option<f32>,
    iou: Option<f32>,
    input_width: Option<u32>,
    input_height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    frame_queue_capacity: Option<usize>,
    result_queue_capacity: Option<usize>,
    overflow: Option<OverflowPolicy>,
    enqueue_timeout_ms: Option<u64>,
    poll_timeout_ms: Option<u64>,
    join_timeout_ms: Option<u64>,
    stats_interval: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct MetadataConfigFile {
    enabled: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    db: Option<i64>,
    password: Option<String>,
    key_prefix: Option<String>,
    channel: Option<String>,
    ttl_secs: Option<u64>,
    connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    enabled: Option<bool>,
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    encoder: Option<String>,
    close_timeout_ms: Option<u64>,
}

/// Fully resolved relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub source: SourceSettings,
    pub detector: DetectorSettings,
    pub pipeline: PipelineSettings,
    pub metadata: MetadataSettings,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// Device index, path, URL or `stub://name`.
    pub uri: String,
    /// Capture resolution frames are decoded to.
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Model weights path, or `stub` for the synthetic detector.
    pub model: String,
    pub device: String,
    pub confidence: f32,
    pub iou: f32,
    /// Model input size; frames are resized to it before inference.
    pub input_width: u32,
    pub input_height: u32,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub frame_queue_capacity: usize,
    pub result_queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub enqueue_timeout: Duration,
    pub poll_timeout: Duration,
    pub join_timeout: Duration,
    /// Log progress every this many processed frames (0 disables).
    pub stats_interval: u64,
}

#[derive(Debug, Clone)]
pub struct MetadataSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    pub key_prefix: String,
    pub channel: String,
    pub ttl: Duration,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub enabled: bool,
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Encoder program, looked up on `PATH` when not absolute.
    pub encoder: String,
    pub close_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        // every field of an empty file falls back to its default
        Self::from_file(RelayConfigFile::default())
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        RelayConfig::default().source
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        RelayConfig::default().detector
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        RelayConfig::default().pipeline
    }
}

impl Default for MetadataSettings {
    fn default() -> Self {
        RelayConfig::default().metadata
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        RelayConfig::default().stream
    }
}

impl RelayConfig {
    /// Defaults, then the file named by `RELAY_CONFIG`, then `RELAY_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = non_empty_env("RELAY_CONFIG");
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like [`RelayConfig::load`] with an explicit config file.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Self {
        let source = file.source.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();
        let metadata = file.metadata.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();

        Self {
            source: SourceSettings {
                uri: source.uri.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
                width: source.width.unwrap_or(DEFAULT_CAPTURE_WIDTH),
                height: source.height.unwrap_or(DEFAULT_CAPTURE_HEIGHT),
                fps: source.fps.unwrap_or(DEFAULT_CAPTURE_FPS),
            },
            detector: DetectorSettings {
                model: detector.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                device: detector.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
                confidence: detector.confidence.unwrap_or(DEFAULT_CONFIDENCE),
                iou: detector.iou.unwrap_or(DEFAULT_IOU),
                input_width: detector.input_width.unwrap_or(DEFAULT_CAPTURE_WIDTH),
                input_height: detector.input_height.unwrap_or(DEFAULT_CAPTURE_HEIGHT),
            },
            pipeline: PipelineSettings {
                frame_queue_capacity: pipeline
                    .frame_queue_capacity
                    .unwrap_or(DEFAULT_QUEUE_CAPACITY),
                result_queue_capacity: pipeline
                    .result_queue_capacity
                    .unwrap_or(DEFAULT_QUEUE_CAPACITY),
                overflow: pipeline.overflow.unwrap_or_default(),
                enqueue_timeout: Duration::from_millis(
                    pipeline
                        .enqueue_timeout_ms
                        .unwrap_or(DEFAULT_ENQUEUE_TIMEOUT_MS),
                ),
                poll_timeout: Duration::from_millis(
                    pipeline.poll_timeout_ms.unwrap_or(DEFAULT_POLL_TIMEOUT_MS),
                ),
                join_timeout: Duration::from_millis(
                    pipeline.join_timeout_ms.unwrap_or(DEFAULT_JOIN_TIMEOUT_MS),
                ),
                stats_interval: pipeline.stats_interval.unwrap_or(DEFAULT_STATS_INTERVAL),
            },
            metadata: MetadataSettings {
                enabled: metadata.enabled.unwrap_or(true),
                host: metadata
                    .host
                    .unwrap_or_else(|| DEFAULT_REDIS_HOST.to_string()),
                port: metadata.port.unwrap_or(DEFAULT_REDIS_PORT),
                db: metadata.db.unwrap_or(0),
                password: metadata.password.filter(|p| !p.is_empty()),
                key_prefix: metadata
                    .key_prefix
                    .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
                channel: metadata
                    .channel
                    .unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
                ttl: Duration::from_secs(metadata.ttl_secs.unwrap_or(DEFAULT_TTL_SECS)),
                connect_timeout: Duration::from_millis(
                    metadata
                        .connect_timeout_ms
                        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
                ),
            },
            stream: StreamSettings {
                enabled: stream.enabled.unwrap_or(false),
                url: stream.url.unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
                width: stream.width.unwrap_or(DEFAULT_CAPTURE_WIDTH),
                height: stream.height.unwrap_or(DEFAULT_CAPTURE_HEIGHT),
                fps: stream.fps.unwrap_or(DEFAULT_CAPTURE_FPS),
                encoder: stream.encoder.unwrap_or_else(|| DEFAULT_ENCODER.to_string()),
                close_timeout: Duration::from_millis(
                    stream.close_timeout_ms.unwrap_or(DEFAULT_CLOSE_TIMEOUT_MS),
                ),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(source) = non_empty_env("RELAY_SOURCE") {
            self.source.uri = source;
        }
        if let Some(model) = non_empty_env("RELAY_MODEL") {
            self.detector.model = model;
        }
        if let Some(device) = non_empty_env("RELAY_DEVICE") {
            self.detector.device = device;
        }
        if let Some(host) = non_empty_env("RELAY_REDIS_HOST") {
            self.metadata.host = host;
        }
        if let Some(port) = non_empty_env("RELAY_REDIS_PORT") {
            self.metadata.port = port
                .parse()
                .map_err(|_| anyhow!("RELAY_REDIS_PORT must be a port number"))?;
        }
        if let Some(password) = non_empty_env("RELAY_REDIS_PASSWORD") {
            self.metadata.password = Some(password);
        }
        if let Some(url) = non_empty_env("RELAY_STREAM_URL") {
            self.stream.url = url;
            self.stream.enabled = true;
        }
        if let Some(flag) = non_empty_env("RELAY_DISABLE_METADATA") {
            self.metadata.enabled = !parse_bool(&flag)
                .ok_or_else(|| anyhow!("RELAY_DISABLE_METADATA must be true/false"))?;
        }
        Ok(())
    }

    /// Check value ranges. Also called by `relayd` after CLI overrides.
    pub fn validate(&self) -> Result<()> {
        if self.source.uri.trim().is_empty() {
            return Err(anyhow!("source must not be empty"));
        }
        if self.source.width == 0 || self.source.height == 0 || self.source.fps == 0 {
            return Err(anyhow!("capture width, height and fps must be greater than zero"));
        }
        if self.detector.model.trim().is_empty() {
            return Err(anyhow!("model must not be empty"));
        }
        for (name, value) in [
            ("confidence", self.detector.confidence),
            ("iou", self.detector.iou),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} threshold {} outside [0, 1]", name, value));
            }
        }
        if self.detector.input_width == 0 || self.detector.input_height == 0 {
            return Err(anyhow!("model input size must be greater than zero"));
        }
        if self.pipeline.frame_queue_capacity == 0 || self.pipeline.result_queue_capacity == 0 {
            return Err(anyhow!("queue capacities must be at least 1"));
        }
        if self.pipeline.poll_timeout.is_zero() {
            return Err(anyhow!("poll timeout must be greater than zero"));
        }
        if self.metadata.ttl.as_secs() == 0 {
            return Err(anyhow!("metadata ttl must be greater than zero"));
        }
        if self.metadata.key_prefix.trim().is_empty() || self.metadata.channel.trim().is_empty() {
            return Err(anyhow!("metadata key prefix and channel must not be empty"));
        }
        if self.stream.width == 0 || self.stream.height == 0 || self.stream.fps == 0 {
            return Err(anyhow!("stream width, height and fps must be greater than zero"));
        }
        if self.stream.enabled && self.stream.url.trim().is_empty() {
            return Err(anyhow!("stream url must be set when streaming is enabled"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
