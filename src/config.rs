use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::device::DevicePath;
use crate::format::{FormatRequest, FrameRate, Resolution};
use crate::frame::PixelFormat;
use crate::ingest::callback::DEFAULT_QUEUE_CAPACITY;
use crate::ingest::ring::{RingConfig, DEFAULT_RING_BUFFERS, MIN_RING_BUFFERS};
use crate::playback::{PlaybackConfig, DEFAULT_BACKOFF_DIVISOR, DEFAULT_FALLBACK_FPS};
use crate::session::SessionConfig;

const DEFAULT_DEVICE: &str = "stub://camera";
const DEFAULT_POLL_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_READ_QUANTUM_MS: u64 = 1;

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<FpsValue>,
    pixel_format: Option<String>,
    ring: Option<RingConfigFile>,
    queue: Option<QueueConfigFile>,
    playback: Option<PlaybackConfigFile>,
    read_quantum_ms: Option<u64>,
}

/// `30` or `"30000/1001"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FpsValue {
    Whole(u32),
    Ratio(String),
}

#[derive(Debug, Deserialize, Default)]
struct RingConfigFile {
    buffer_count: Option<u32>,
    min_buffers: Option<u32>,
    poll_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct QueueConfigFile {
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct PlaybackConfigFile {
    backoff_divisor: Option<u32>,
    fallback_fps: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub device: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<FrameRate>,
    pub pixel_format: Option<PixelFormat>,
    pub ring: RingSettings,
    pub queue_capacity: usize,
    pub playback: PlaybackConfig,
    pub read_quantum: Duration,
}

#[derive(Debug, Clone)]
pub struct RingSettings {
    pub buffer_count: u32,
    pub min_buffers: u32,
    pub poll_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            width: None,
            height: None,
            fps: None,
            pixel_format: None,
            ring: RingSettings {
                buffer_count: DEFAULT_RING_BUFFERS,
                min_buffers: MIN_RING_BUFFERS,
                poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            },
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            playback: PlaybackConfig {
                backoff_divisor: DEFAULT_BACKOFF_DIVISOR,
                fallback_fps: DEFAULT_FALLBACK_FPS,
            },
            read_quantum: Duration::from_millis(DEFAULT_READ_QUANTUM_MS),
        }
    }
}

impl CaptureConfig {
    /// Read `FRAMEGRAB_CONFIG` (if set), apply `FRAMEGRAB_*` overrides, validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FRAMEGRAB_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CaptureConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let fps = match file.fps {
            Some(FpsValue::Whole(fps)) => Some(FrameRate::fps(fps)),
            Some(FpsValue::Ratio(ratio)) => Some(
                ratio
                    .parse()
                    .with_context(|| format!("invalid fps '{}' in config file", ratio))?,
            ),
            None => None,
        };
        let pixel_format = file
            .pixel_format
            .as_deref()
            .map(str::parse)
            .transpose()
            .context("invalid pixel_format in config file")?;
        let ring = file.ring.unwrap_or_default();
        let playback = file.playback.unwrap_or_default();

        Ok(Self {
            device: file.device.unwrap_or(defaults.device),
            width: file.width,
            height: file.height,
            fps,
            pixel_format,
            ring: RingSettings {
                buffer_count: ring.buffer_count.unwrap_or(defaults.ring.buffer_count),
                min_buffers: ring.min_buffers.unwrap_or(defaults.ring.min_buffers),
                poll_timeout: ring
                    .poll_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.ring.poll_timeout),
            },
            queue_capacity: file
                .queue
                .and_then(|queue| queue.capacity)
                .unwrap_or(defaults.queue_capacity),
            playback: PlaybackConfig {
                backoff_divisor: playback
                    .backoff_divisor
                    .unwrap_or(defaults.playback.backoff_divisor),
                fallback_fps: playback
                    .fallback_fps
                    .unwrap_or(defaults.playback.fallback_fps),
            },
            read_quantum: file
                .read_quantum_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.read_quantum),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("FRAMEGRAB_DEVICE") {
            if !device.trim().is_empty() {
                self.device = device.trim().to_string();
            }
        }
        if let Some(width) = env_number::<u32>("FRAMEGRAB_WIDTH")? {
            self.width = Some(width);
        }
        if let Some(height) = env_number::<u32>("FRAMEGRAB_HEIGHT")? {
            self.height = Some(height);
        }
        if let Ok(fps) = std::env::var("FRAMEGRAB_FPS") {
            if !fps.trim().is_empty() {
                self.fps = Some(fps.parse().map_err(|_| {
                    anyhow!("FRAMEGRAB_FPS must be a frame rate such as 30 or 30000/1001")
                })?);
            }
        }
        if let Ok(format) = std::env::var("FRAMEGRAB_PIXEL_FORMAT") {
            if !format.trim().is_empty() {
                self.pixel_format = Some(
                    format
                        .parse()
                        .with_context(|| format!("FRAMEGRAB_PIXEL_FORMAT '{}'", format))?,
                );
            }
        }
        if let Some(count) = env_number::<u32>("FRAMEGRAB_BUFFER_COUNT")? {
            self.ring.buffer_count = count;
        }
        if let Some(capacity) = env_number::<usize>("FRAMEGRAB_QUEUE_CAPACITY")? {
            self.queue_capacity = capacity;
        }
        if let Some(ms) = env_number::<u64>("FRAMEGRAB_POLL_TIMEOUT_MS")? {
            self.ring.poll_timeout = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.device.trim().is_empty() {
            return Err(anyhow!("device must not be empty"));
        }
        if self.width.is_some() != self.height.is_some() {
            return Err(anyhow!("width and height must be set together"));
        }
        if self.width == Some(0) || self.height == Some(0) {
            return Err(anyhow!("width and height must be greater than zero"));
        }
        if let Some(fps) = self.fps {
            if fps.as_hz().map_or(true, |hz| hz <= 0.0) {
                return Err(anyhow!("fps must be greater than zero"));
            }
        }
        if self.ring.min_buffers < MIN_RING_BUFFERS {
            return Err(anyhow!(
                "ring.min_buffers must be at least {}",
                MIN_RING_BUFFERS
            ));
        }
        if self.ring.buffer_count < self.ring.min_buffers {
            return Err(anyhow!(
                "ring.buffer_count ({}) must be at least ring.min_buffers ({})",
                self.ring.buffer_count,
                self.ring.min_buffers
            ));
        }
        if self.ring.poll_timeout.is_zero() {
            return Err(anyhow!("ring.poll_timeout_ms must be greater than zero"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("queue.capacity must be at least 1"));
        }
        if self.playback.backoff_divisor == 0 {
            return Err(anyhow!("playback.backoff_divisor must be at least 1"));
        }
        if !(self.playback.fallback_fps.is_finite() && self.playback.fallback_fps > 0.0) {
            return Err(anyhow!("playback.fallback_fps must be greater than zero"));
        }
        Ok(())
    }

    pub fn device_path(&self) -> DevicePath {
        DevicePath::parse(&self.device)
    }

    pub fn format_request(&self) -> FormatRequest {
        FormatRequest {
            resolution: self
                .width
                .zip(self.height)
                .map(|(width, height)| Resolution::new(width, height)),
            pixel_format: self.pixel_format,
            frame_rate: self.fps,
            ..FormatRequest::default()
        }
    }

    pub fn ring_config(&self) -> RingConfig {
        RingConfig {
            buffer_count: self.ring.buffer_count,
            min_buffers: self.ring.min_buffers,
            poll_timeout: self.ring.poll_timeout,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ring: self.ring_config(),
            queue_capacity: self.queue_capacity,
            read_quantum: self.read_quantum,
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        self.playback
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer", key)),
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<CaptureConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
