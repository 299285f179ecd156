//! Server-lifetime shared state.
//!
//! One `ServerContext` exists per running server and is handed (as an `Arc`)
//! to the ingestion threads and to every connection handler. Nothing here is
//! process-global, so independent servers can run side by side in one process.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ServerConfig;
use crate::frame::{Frame, FrameBuffer};

pub struct ServerContext {
    pub config: ServerConfig,
    /// Raw JPEGs from the reassembler, consumed by the decode stage.
    pub raw_frames: FrameBuffer<Vec<u8>>,
    /// Decoded frames, read (never consumed) by every handler.
    pub frames: FrameBuffer<Frame>,
    pub ingest: IngestStats,
    active_clients: AtomicUsize,
    shutdown: AtomicBool,
}

impl ServerContext {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            raw_frames: FrameBuffer::new(config.buffer.ingest_capacity),
            frames: FrameBuffer::new(config.buffer.distribution_capacity),
            config,
            ingest: IngestStats::default(),
            active_clients: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Set the shutdown flag and wake everything blocked on a buffer.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.raw_frames.close();
        self.frames.close();
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.timing.poll_interval
    }

    /// Sleep for `duration` in poll-interval slices. Returns `false` if
    /// shutdown was requested meanwhile.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_shutting_down() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(self.poll_interval()));
        }
    }

    /// Count a client for the lifetime of the returned guard.
    pub fn client_guard(self: &Arc<Self>) -> ClientGuard {
        self.active_clients.fetch_add(1, Ordering::SeqCst);
        ClientGuard {
            context: self.clone(),
        }
    }

    pub fn active_clients(&self) -> usize {
        self.active_clients.load(Ordering::SeqCst)
    }
}

pub struct ClientGuard {
    context: Arc<ServerContext>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.context.active_clients.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Ingestion counters, updated by the ingest threads.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub bytes_read: AtomicU64,
    pub frames_reassembled: AtomicU64,
    pub frames_published: AtomicU64,
    pub decode_failures: AtomicU64,
    pub restarts: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestSnapshot {
    pub bytes_read: u64,
    pub frames_reassembled: u64,
    pub frames_published: u64,
    pub decode_failures: u64,
    pub restarts: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            frames_reassembled: self.frames_reassembled.load(Ordering::Relaxed),
            frames_published: self.frames_published.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> ServerConfig {
        let mut cfg = ServerConfig::default();
        cfg.timing.poll_interval = Duration::from_millis(10);
        cfg
    }

    #[test]
    fn sleep_returns_early_on_shutdown() {
        let ctx = ServerContext::new(fast_config());
        let sleeper = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                let start = Instant::now();
                (ctx.sleep(Duration::from_secs(10)), start.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(30));
        ctx.request_shutdown();
        let (completed, elapsed) = sleeper.join().unwrap();
        assert!(!completed);
        assert!(elapsed < Duration::from_secs(5));
        assert!(ctx.frames.is_closed());
    }

    #[test]
    fn client_guard_tracks_active_clients() {
        let ctx = ServerContext::new(fast_config());
        let first = ctx.client_guard();
        let second = ctx.client_guard();
        assert_eq!(ctx.active_clients(), 2);
        drop(first);
        assert_eq!(ctx.active_clients(), 1);
        drop(second);
        assert_eq!(ctx.active_clients(), 0);
    }
}
