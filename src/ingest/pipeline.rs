//! Ingestion threads.
//!
//! Two threads per server:
//! - reader: runs the `VideoSource`, reassembles JPEG frames and pushes them
//!   into the ingestion queue; restarts the source after a backoff whenever it
//!   ends, fails or stalls.
//! - decoder: pops raw JPEGs, decodes them, drops the ones that fail and
//!   publishes the rest to the distribution buffer.

use anyhow::{anyhow, Context, Result};
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use super::{SourceReader, VideoSource};
use crate::context::ServerContext;
use crate::frame::Frame;
use crate::imaging::decode_jpeg;
use crate::reassembly::{is_transient, JpegFrames};

const LOG_EVERY_FRAMES: u64 = 30;

/// Why a source run ended.
#[derive(Debug)]
enum RunExit {
    Eof,
    Failed(io::Error),
    Stalled,
    Shutdown,
}

pub struct Ingestor {
    context: Arc<ServerContext>,
    source: Box<dyn VideoSource>,
}

pub struct IngestHandle {
    reader: Option<JoinHandle<()>>,
    decoder: Option<JoinHandle<()>>,
}

impl IngestHandle {
    /// Wait for both threads. Call after requesting shutdown.
    pub fn join(mut self) -> Result<()> {
        let mut panicked = false;
        for handle in [self.reader.take(), self.decoder.take()].into_iter().flatten() {
            panicked |= handle.join().is_err();
        }
        if panicked {
            return Err(anyhow!("ingest thread panicked"));
        }
        Ok(())
    }
}

impl Ingestor {
    pub fn new(context: Arc<ServerContext>, source: Box<dyn VideoSource>) -> Self {
        Self { context, source }
    }

    /// Start the source and both threads. A source that cannot start the first
    /// time is a setup error; later failures are retried indefinitely.
    pub fn spawn(mut self) -> Result<IngestHandle> {
        self.source
            .start()
            .with_context(|| format!("start video source {}", self.source.describe()))?;
        log::info!("ingesting from {}", self.source.describe());

        let decoder_ctx = self.context.clone();
        let decoder = std::thread::Builder::new()
            .name("ingest-decode".into())
            .spawn(move || run_decoder(&decoder_ctx))
            .context("spawn decode thread")?;
        let reader = match std::thread::Builder::new()
            .name("ingest-read".into())
            .spawn(move || self.run_reader())
        {
            Ok(handle) => handle,
            Err(err) => {
                // The decoder exits once shutdown is requested.
                drop(decoder);
                return Err(err).context("spawn ingest thread");
            }
        };
        Ok(IngestHandle {
            reader: Some(reader),
            decoder: Some(decoder),
        })
    }

    /// Runs with the source already started by `spawn`.
    fn run_reader(mut self) {
        let ctx = self.context.clone();
        loop {
            let exit = self.pump_frames();
            self.source.stop();
            match exit {
                RunExit::Shutdown => break,
                RunExit::Eof => log::warn!("video source ended (EOF)"),
                RunExit::Failed(err) => log::error!("video source read failed: {}", err),
                RunExit::Stalled => log::warn!(
                    "video source produced no frames for {:?}",
                    ctx.config.timing.stall_timeout
                ),
            }
            if ctx.is_shutting_down() {
                break;
            }
            ctx.ingest.restarts.fetch_add(1, Ordering::Relaxed);
            if !self.restart_source() {
                break;
            }
        }
        log::info!("ingest reader stopped");
    }

    /// Sleep the backoff and start the source again until it comes up.
    /// Returns false if shutdown was requested first.
    fn restart_source(&mut self) -> bool {
        let backoff = self.context.config.timing.restart_backoff;
        loop {
            log::warn!("restarting video source in {:?}", backoff);
            if !self.context.sleep(backoff) {
                return false;
            }
            match self.source.start() {
                Ok(()) => {
                    log::info!("video source restarted: {}", self.source.describe());
                    return true;
                }
                Err(err) => log::error!("video source failed to start: {:#}", err),
            }
        }
    }

    fn pump_frames(&mut self) -> RunExit {
        let ctx = &self.context;
        let buffer = &ctx.config.buffer;
        let stall_timeout = ctx.config.timing.stall_timeout;
        let mut frames = JpegFrames::new(
            SourceReader::counting(self.source.as_mut(), &ctx.ingest.bytes_read),
            buffer.chunk_size,
            buffer.max_frame_bytes,
        );
        let mut last_frame_at = Instant::now();
        let mut bytes_seen = 0u64;

        while let Some(item) = frames.next() {
            if ctx.is_shutting_down() {
                return RunExit::Shutdown;
            }
            match item {
                Ok(jpeg) => {
                    last_frame_at = Instant::now();
                    bytes_seen += jpeg.len() as u64;
                    let count = ctx.ingest.frames_reassembled.fetch_add(1, Ordering::Relaxed) + 1;
                    if count % LOG_EVERY_FRAMES == 0 {
                        log::info!("ingest: reassembled frames={}", count);
                    }
                    log::trace!("reassembled frame of {} bytes", jpeg.len());
                    ctx.raw_frames.push(jpeg);
                }
                Err(err) if is_transient(&err) => {
                    if !stall_timeout.is_zero() && last_frame_at.elapsed() >= stall_timeout {
                        return RunExit::Stalled;
                    }
                }
                Err(err) => return RunExit::Failed(err),
            }
        }
        let stats = frames.reassembler().stats();
        log::debug!(
            "source run ended: {} frame bytes, {} bytes discarded, {} resyncs",
            bytes_seen,
            stats.discarded_bytes,
            stats.resyncs
        );
        if ctx.is_shutting_down() {
            RunExit::Shutdown
        } else {
            RunExit::Eof
        }
    }
}

fn run_decoder(ctx: &ServerContext) {
    let poll = ctx.poll_interval();
    let mut sequence = 0u64;
    while !ctx.is_shutting_down() {
        let Some(jpeg) = ctx.raw_frames.wait_pop(poll) else {
            continue;
        };
        match decode_jpeg(&jpeg) {
            Ok(image) => {
                sequence += 1;
                ctx.frames.push(Frame::new(sequence, jpeg, image));
                ctx.ingest.frames_published.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                ctx.ingest.decode_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("dropping undecodable frame ({} bytes): {:#}", jpeg.len(), err);
            }
        }
    }
    log::info!("ingest decoder stopped");
}
