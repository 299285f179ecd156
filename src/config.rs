use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::frame::{DEFAULT_DISTRIBUTION_CAPACITY, DEFAULT_INGEST_CAPACITY};
use crate::imaging::{CAPTURE_QUALITY, STREAM_QUALITY};
use crate::reassembly::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FRAME_BYTES};

const DEFAULT_PROTOCOL_ADDR: &str = "0.0.0.0:8888";
const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_SOURCE_PROGRAM: &str = "rpicam-vid";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FRAMERATE: u32 = 20;
const DEFAULT_SOURCE_QUALITY: u8 = 80;
const DEFAULT_POLL_INTERVAL_MS: u64 = 200;
const DEFAULT_RESTART_BACKOFF_MS: u64 = 1000;
const DEFAULT_CAPTURE_WAIT_MS: u64 = 2000;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_STALL_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    protocol_addr: Option<String>,
    http_addr: Option<String>,
    source: Option<SourceConfigFile>,
    buffer: Option<BufferConfigFile>,
    jpeg: Option<JpegConfigFile>,
    timing: Option<TimingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    program: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    framerate: Option<u32>,
    quality: Option<u8>,
    vflip: Option<bool>,
    hflip: Option<bool>,
    extra_args: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct BufferConfigFile {
    ingest_capacity: Option<usize>,
    distribution_capacity: Option<usize>,
    chunk_size: Option<usize>,
    max_frame_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct JpegConfigFile {
    stream_quality: Option<u8>,
    capture_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct TimingConfigFile {
    poll_interval_ms: Option<u64>,
    restart_backoff_ms: Option<u64>,
    capture_wait_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
    stall_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub protocol_addr: String,
    pub http_addr: String,
    pub source: SourceSettings,
    pub buffer: BufferSettings,
    pub jpeg: JpegSettings,
    pub timing: TimingSettings,
}

/// Camera source. `program` is the capture tool; a `stub://` prefix selects the
/// synthetic source and an `http(s)://` URL an upstream MJPEG stream.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub program: String,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub quality: u8,
    pub vflip: bool,
    pub hflip: bool,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BufferSettings {
    pub ingest_capacity: usize,
    pub distribution_capacity: usize,
    pub chunk_size: usize,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct JpegSettings {
    pub stream_quality: u8,
    pub capture_quality: u8,
}

#[derive(Debug, Clone)]
pub struct TimingSettings {
    /// Upper bound on how long any loop waits before re-checking shutdown.
    pub poll_interval: Duration,
    pub restart_backoff: Duration,
    pub capture_wait: Duration,
    pub write_timeout: Duration,
    /// A running source that yields no bytes for this long is restarted.
    pub stall_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(ServerConfigFile::default())
    }
}

impl ServerConfig {
    /// Load from the file named by `PICAM_CONFIG` (if set), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PICAM_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a specific file, then apply environment overrides and validate.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ServerConfigFile) -> Self {
        let source = file.source.unwrap_or_default();
        let buffer = file.buffer.unwrap_or_default();
        let jpeg = file.jpeg.unwrap_or_default();
        let timing = file.timing.unwrap_or_default();
        Self {
            protocol_addr: file
                .protocol_addr
                .unwrap_or_else(|| DEFAULT_PROTOCOL_ADDR.to_string()),
            http_addr: file
                .http_addr
                .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
            source: SourceSettings {
                program: source
                    .program
                    .unwrap_or_else(|| DEFAULT_SOURCE_PROGRAM.to_string()),
                width: source.width.unwrap_or(DEFAULT_WIDTH),
                height: source.height.unwrap_or(DEFAULT_HEIGHT),
                framerate: source.framerate.unwrap_or(DEFAULT_FRAMERATE),
                quality: source.quality.unwrap_or(DEFAULT_SOURCE_QUALITY),
                vflip: source.vflip.unwrap_or(false),
                hflip: source.hflip.unwrap_or(false),
                extra_args: source.extra_args.unwrap_or_default(),
            },
            buffer: BufferSettings {
                ingest_capacity: buffer.ingest_capacity.unwrap_or(DEFAULT_INGEST_CAPACITY),
                distribution_capacity: buffer
                    .distribution_capacity
                    .unwrap_or(DEFAULT_DISTRIBUTION_CAPACITY),
                chunk_size: buffer.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
                max_frame_bytes: buffer.max_frame_bytes.unwrap_or(DEFAULT_MAX_FRAME_BYTES),
            },
            jpeg: JpegSettings {
                stream_quality: jpeg.stream_quality.unwrap_or(STREAM_QUALITY),
                capture_quality: jpeg.capture_quality.unwrap_or(CAPTURE_QUALITY),
            },
            timing: TimingSettings {
                poll_interval: Duration::from_millis(
                    timing.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
                ),
                restart_backoff: Duration::from_millis(
                    timing.restart_backoff_ms.unwrap_or(DEFAULT_RESTART_BACKOFF_MS),
                ),
                capture_wait: Duration::from_millis(
                    timing.capture_wait_ms.unwrap_or(DEFAULT_CAPTURE_WAIT_MS),
                ),
                write_timeout: Duration::from_millis(
                    timing.write_timeout_ms.unwrap_or(DEFAULT_WRITE_TIMEOUT_MS),
                ),
                stall_timeout: Duration::from_millis(
                    timing.stall_timeout_ms.unwrap_or(DEFAULT_STALL_TIMEOUT_MS),
                ),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("PICAM_PROTOCOL_ADDR") {
            if !addr.trim().is_empty() {
                self.protocol_addr = addr;
            }
        }
        if let Ok(addr) = std::env::var("PICAM_HTTP_ADDR") {
            if !addr.trim().is_empty() {
                self.http_addr = addr;
            }
        }
        if let Ok(program) = std::env::var("PICAM_SOURCE") {
            if !program.trim().is_empty() {
                self.source.program = program;
            }
        }
        if let Ok(quality) = std::env::var("PICAM_STREAM_QUALITY") {
            self.jpeg.stream_quality = quality
                .trim()
                .parse()
                .map_err(|_| anyhow!("PICAM_STREAM_QUALITY must be an integer 1-100"))?;
        }
        if let Ok(quality) = std::env::var("PICAM_CAPTURE_QUALITY") {
            self.jpeg.capture_quality = quality
                .trim()
                .parse()
                .map_err(|_| anyhow!("PICAM_CAPTURE_QUALITY must be an integer 1-100"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, quality) in [
            ("source.quality", self.source.quality),
            ("jpeg.stream_quality", self.jpeg.stream_quality),
            ("jpeg.capture_quality", self.jpeg.capture_quality),
        ] {
            if !(1..=100).contains(&quality) {
                return Err(anyhow!("{} must be within 1-100, got {}", name, quality));
            }
        }
        if self.buffer.ingest_capacity == 0 || self.buffer.distribution_capacity == 0 {
            return Err(anyhow!("buffer capacities must be at least 1"));
        }
        if self.buffer.chunk_size < 2 {
            return Err(anyhow!("buffer.chunk_size must be at least 2 bytes"));
        }
        if self.buffer.max_frame_bytes < self.buffer.chunk_size.saturating_mul(2) {
            return Err(anyhow!(
                "buffer.max_frame_bytes must be at least twice buffer.chunk_size"
            ));
        }
        if self.timing.poll_interval.is_zero() {
            return Err(anyhow!("timing.poll_interval_ms must be greater than zero"));
        }
        if self.source.program.trim().is_empty() {
            return Err(anyhow!("source.program must not be empty"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ServerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_camera_deployment() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.protocol_addr, "0.0.0.0:8888");
        assert_eq!(cfg.http_addr, "0.0.0.0:8080");
        assert_eq!(cfg.source.program, "rpicam-vid");
        assert_eq!(cfg.buffer.ingest_capacity, 10);
        assert_eq!(cfg.buffer.distribution_capacity, 1);
        assert_eq!(cfg.jpeg.stream_quality, 80);
        assert_eq!(cfg.jpeg.capture_quality, 95);
        assert_eq!(cfg.timing.poll_interval, Duration::from_millis(200));
        assert_eq!(cfg.timing.capture_wait, Duration::from_secs(2));
        cfg.validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_quality() {
        let mut cfg = ServerConfig::default();
        cfg.jpeg.capture_quality = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_poll_interval() {
        let mut cfg = ServerConfig::default();
        cfg.timing.poll_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validation_rejects_huge_chunk_size() {
        let mut cfg = ServerConfig::default();
        cfg.buffer.chunk_size = usize::MAX / 2 + 1;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_frame_bytes"));

        cfg.buffer.chunk_size = usize::MAX;
        cfg.buffer.max_frame_bytes = usize::MAX;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let file: ServerConfigFile =
            serde_json::from_str(r#"{"jpeg": {"stream_quality": 60}}"#).unwrap();
        let cfg = ServerConfig::from_file(file);
        assert_eq!(cfg.jpeg.stream_quality, 60);
        assert_eq!(cfg.jpeg.capture_quality, 95);
        assert_eq!(cfg.source.width, 640);
    }
}
