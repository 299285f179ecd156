//! Video sources and the ingestion pipeline.
//!
//! This module provides different sources of MJPEG bytes:
//! - Camera capture subprocess stdout (`rpicam-vid` by default)
//! - Upstream HTTP MJPEG streams (`http://` / `https://`)
//! - Synthetic test pattern (`stub://`)
//!
//! Sources only deliver bytes. The `Ingestor` turns them into frames:
//! - Reassembling JPEG frames from the byte stream
//! - Decoding frames and dropping the ones that fail
//! - Restarting the source whenever it exits, errors or stalls

pub mod command;
pub mod http;
pub mod pipeline;
pub mod synthetic;

pub use command::CommandSource;
pub use http::HttpSource;
pub use pipeline::{IngestHandle, Ingestor};
pub use synthetic::SyntheticSource;

use anyhow::Result;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{ServerConfig, SourceSettings};

/// A restartable producer of raw MJPEG bytes.
///
/// `read` follows `std::io::Read`: `Ok(0)` means the source ended. It should
/// return within a bounded time; a source with nothing to deliver yet returns
/// an error of kind `TimedOut` or `WouldBlock` instead of blocking forever.
pub trait VideoSource: Send {
    /// Start (or restart) producing bytes.
    fn start(&mut self) -> Result<()>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Release the underlying process or connection. Safe to call repeatedly.
    fn stop(&mut self);

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// `std::io::Read` view over a running source.
pub struct SourceReader<'a> {
    source: &'a mut dyn VideoSource,
    bytes_read: Option<&'a AtomicU64>,
}

impl<'a> SourceReader<'a> {
    pub fn new(source: &'a mut dyn VideoSource) -> Self {
        Self {
            source,
            bytes_read: None,
        }
    }

    /// Add every byte read from the source, framed or not, to `counter`.
    pub fn counting(source: &'a mut dyn VideoSource, counter: &'a AtomicU64) -> Self {
        Self {
            source,
            bytes_read: Some(counter),
        }
    }
}

impl io::Read for SourceReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.source.read(buf)?;
        if let Some(counter) = self.bytes_read {
            counter.fetch_add(n as u64, Ordering::Relaxed);
        }
        Ok(n)
    }
}

/// Build the source selected by `source.program`.
pub fn source_from_config(config: &ServerConfig) -> Result<Box<dyn VideoSource>> {
    let settings = &config.source;
    let read_timeout = config.timing.poll_interval;
    if settings.program.starts_with("stub://") {
        Ok(Box::new(SyntheticSource::from_settings(settings)?))
    } else if settings.program.starts_with("http://") || settings.program.starts_with("https://") {
        Ok(Box::new(HttpSource::new(&settings.program, read_timeout)?))
    } else {
        Ok(Box::new(CommandSource::new(
            settings.program.clone(),
            command_args(settings),
            config.buffer.chunk_size,
            read_timeout,
        )))
    }
}

/// Arguments for the configured capture program.
///
/// `rpicam-vid` and `libcamera-vid` get MJPEG-to-stdout flags derived from the
/// settings; any other program receives `extra_args` only.
pub fn command_args(settings: &SourceSettings) -> Vec<String> {
    let program = std::path::Path::new(&settings.program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(&settings.program);
    if !matches!(program, "rpicam-vid" | "libcamera-vid") {
        return settings.extra_args.clone();
    }
    let mut args: Vec<String> = vec![
        "-n".into(),
        "-t".into(),
        "0".into(),
        "--codec".into(),
        "mjpeg".into(),
        "--width".into(),
        settings.width.to_string(),
        "--height".into(),
        settings.height.to_string(),
        "--framerate".into(),
        settings.framerate.to_string(),
        "--quality".into(),
        settings.quality.to_string(),
    ];
    if settings.vflip {
        args.push("--vflip".into());
    }
    if settings.hflip {
        args.push("--hflip".into());
    }
    args.extend(settings.extra_args.iter().cloned());
    args.push("--output".into());
    args.push("-".into());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpicam_args_follow_settings() {
        let mut cfg = ServerConfig::default();
        cfg.source.vflip = true;
        cfg.source.framerate = 15;
        let args = command_args(&cfg.source);
        let joined = args.join(" ");
        assert!(joined.starts_with("-n -t 0 --codec mjpeg --width 640 --height 480"));
        assert!(joined.contains("--framerate 15"));
        assert!(joined.contains("--vflip"));
        assert!(!joined.contains("--hflip"));
        assert!(joined.ends_with("--output -"));
    }

    #[test]
    fn other_programs_get_extra_args_only() {
        let mut cfg = ServerConfig::default();
        cfg.source.program = "/usr/bin/cat".into();
        cfg.source.extra_args = vec!["capture.mjpeg".into()];
        assert_eq!(command_args(&cfg.source), vec!["capture.mjpeg".to_string()]);
    }

    #[test]
    fn stub_program_selects_synthetic_source() {
        let mut cfg = ServerConfig::default();
        cfg.source.program = "stub://bench".into();
        let source = source_from_config(&cfg).unwrap();
        assert!(source.describe().contains("stub://bench"));
    }
}
