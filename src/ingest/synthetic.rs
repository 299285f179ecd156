//! Synthetic source (`stub://`) for tests and benches without a camera.
//!
//! Produces JPEG-encoded moving test patterns at the configured frame rate.
//! `stub://name?frames=N` ends the stream after N frames, the same way a
//! crashing capture process would, so restart handling can be exercised.

use anyhow::{anyhow, Context, Result};
use std::io;
use std::time::{Duration, Instant};
use url::Url;

use super::VideoSource;
use crate::config::SourceSettings;
use crate::imaging::{encode_jpeg, test_pattern};

pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    quality: u8,
    interval: Duration,
    frames_per_run: Option<u64>,
    running: bool,
    emitted: u64,
    phase: u64,
    next_due: Instant,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, framerate: u32, quality: u8) -> Self {
        Self {
            name: "stub://camera".to_string(),
            width,
            height,
            quality,
            interval: frame_interval(framerate),
            frames_per_run: None,
            running: false,
            emitted: 0,
            phase: 0,
            next_due: Instant::now(),
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    pub fn from_settings(settings: &SourceSettings) -> Result<Self> {
        let url = Url::parse(&settings.program).context("parse stub source url")?;
        if url.scheme() != "stub" {
            return Err(anyhow!("synthetic source requires a stub:// url"));
        }
        let mut source = Self::new(
            settings.width,
            settings.height,
            settings.framerate,
            settings.quality,
        );
        source.name = settings.program.clone();
        for (key, value) in url.query_pairs() {
            if key == "frames" {
                let frames: u64 = value
                    .parse()
                    .map_err(|_| anyhow!("stub source 'frames' must be an integer"))?;
                source.frames_per_run = Some(frames);
            }
        }
        Ok(source)
    }

    /// End each run after `frames` frames.
    pub fn with_frames_per_run(mut self, frames: u64) -> Self {
        self.frames_per_run = Some(frames);
        self
    }

    fn next_frame(&mut self) -> io::Result<()> {
        let now = Instant::now();
        if self.next_due > now {
            std::thread::sleep(self.next_due - now);
        }
        self.next_due = Instant::now() + self.interval;
        let image = test_pattern(self.width, self.height, self.phase);
        self.phase += 1;
        self.pending = encode_jpeg(&image, self.quality)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, format!("{:#}", err)))?;
        self.pending_pos = 0;
        self.emitted += 1;
        Ok(())
    }
}

impl VideoSource for SyntheticSource {
    fn start(&mut self) -> Result<()> {
        self.running = true;
        self.emitted = 0;
        self.pending.clear();
        self.pending_pos = 0;
        self.next_due = Instant::now();
        log::info!("{} started (synthetic)", self.name);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.running {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "synthetic source not started",
            ));
        }
        if self.pending_pos >= self.pending.len() {
            if self
                .frames_per_run
                .is_some_and(|limit| self.emitted >= limit)
            {
                return Ok(0);
            }
            self.next_frame()?;
        }
        let available = &self.pending[self.pending_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pending_pos += n;
        Ok(n)
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn describe(&self) -> String {
        format!("{} ({}x{})", self.name, self.width, self.height)
    }
}

fn frame_interval(framerate: u32) -> Duration {
    if framerate == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / framerate).max(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::imaging::decode_jpeg;
    use crate::reassembly::JpegFrames;
    use crate::ingest::SourceReader;

    #[test]
    fn emits_decodable_frames_then_ends() {
        let mut source = SyntheticSource::new(32, 24, 0, 80).with_frames_per_run(3);
        source.start().unwrap();
        let frames: Vec<Vec<u8>> = JpegFrames::new(SourceReader::new(&mut source), 512, 1 << 20)
            .collect::<io::Result<_>>()
            .unwrap();
        assert_eq!(frames.len(), 3);
        for frame in &frames {
            assert!(decode_jpeg(frame).is_ok());
        }
        assert_ne!(frames[0], frames[1]);
    }

    #[test]
    fn restart_resets_frame_budget() {
        let mut source = SyntheticSource::new(8, 8, 0, 50).with_frames_per_run(1);
        let mut buf = vec![0u8; 64 * 1024];
        source.start().unwrap();
        assert!(source.read(&mut buf).unwrap() > 0);
        assert_eq!(source.read(&mut buf).unwrap(), 0);
        source.stop();
        assert!(source.read(&mut buf).is_err());
        source.start().unwrap();
        assert!(source.read(&mut buf).unwrap() > 0);
    }

    #[test]
    fn parses_frame_limit_from_url() {
        let mut cfg = ServerConfig::default();
        cfg.source.program = "stub://porch?frames=30".into();
        let source = SyntheticSource::from_settings(&cfg.source).unwrap();
        assert_eq!(source.frames_per_run, Some(30));

        cfg.source.program = "stub://porch?frames=lots".into();
        assert!(SyntheticSource::from_settings(&cfg.source).is_err());
    }
}
