//! JPEG frame reassembly from an unframed byte stream.
//!
//! Camera tools that write MJPEG to stdout (and HTTP MJPEG bodies) deliver a
//! plain concatenation of JPEG images cut into arbitrary read chunks. Frames are
//! recovered by scanning for the start-of-image (`FF D8`) and end-of-image
//! (`FF D9`) markers. Entropy-coded JPEG data byte-stuffs every `FF`, so an
//! `FF D9` inside a frame only appears as its terminator.

use std::collections::VecDeque;
use std::io::{self, Read};

/// Start-of-image marker.
pub const SOI: [u8; 2] = [0xFF, 0xD8];
/// End-of-image marker.
pub const EOI: [u8; 2] = [0xFF, 0xD9];

pub const DEFAULT_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 5 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReassemblyState {
    /// No start marker in the buffer yet.
    SearchingSoi,
    /// Buffer starts with a start marker; waiting for the end marker.
    SearchingEoi,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub frames: u64,
    pub discarded_bytes: u64,
    pub resyncs: u64,
}

/// Incremental SOI/EOI frame splitter.
#[derive(Debug)]
pub struct FrameReassembler {
    buffer: Vec<u8>,
    state: ReassemblyState,
    /// Where the next EOI search starts (only meaningful in `SearchingEoi`).
    scan_from: usize,
    /// Bytes kept while no start marker has been seen.
    window: usize,
    max_frame_bytes: usize,
    stats: ReassemblyStats,
}

impl FrameReassembler {
    /// `window` bounds the garbage kept while searching for a start marker;
    /// `max_frame_bytes` bounds an unterminated frame before resync.
    pub fn new(window: usize, max_frame_bytes: usize) -> Self {
        let window = window.max(SOI.len());
        Self {
            buffer: Vec::with_capacity(64 * 1024),
            state: ReassemblyState::SearchingSoi,
            scan_from: 0,
            window,
            max_frame_bytes: max_frame_bytes.max(window),
            stats: ReassemblyStats::default(),
        }
    }

    /// Reassembler sized for reads of `chunk_size` bytes.
    pub fn for_chunk_size(chunk_size: usize) -> Self {
        Self::new(chunk_size.saturating_mul(2), DEFAULT_MAX_FRAME_BYTES)
    }

    /// Append a chunk; returns every frame it completed, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            match self.state {
                ReassemblyState::SearchingSoi => {
                    let Some(start) = find_marker(&self.buffer, 0, SOI) else {
                        if self.buffer.len() > self.window {
                            let excess = self.buffer.len() - self.window;
                            self.discard_front(excess);
                        }
                        break;
                    };
                    self.discard_front(start);
                    self.state = ReassemblyState::SearchingEoi;
                    self.scan_from = SOI.len();
                }
                ReassemblyState::SearchingEoi => {
                    if let Some(end) = find_marker(&self.buffer, self.scan_from, EOI) {
                        let frame_end = end + EOI.len();
                        frames.push(self.buffer.drain(..frame_end).collect());
                        self.stats.frames += 1;
                        self.state = ReassemblyState::SearchingSoi;
                        continue;
                    }
                    if self.buffer.len() > self.max_frame_bytes {
                        log::warn!(
                            "jpeg frame exceeded {} bytes without end marker; resyncing",
                            self.max_frame_bytes
                        );
                        // The final byte may be the first half of the next marker.
                        let drop_len = self.buffer.len() - 1;
                        self.discard_front(drop_len);
                        self.stats.resyncs += 1;
                        self.state = ReassemblyState::SearchingSoi;
                        continue;
                    }
                    self.scan_from = self.buffer.len().saturating_sub(1).max(SOI.len());
                    break;
                }
            }
        }
        frames
    }

    pub fn state(&self) -> ReassemblyState {
        self.state
    }

    /// Bytes currently held awaiting more input.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    fn discard_front(&mut self, len: usize) {
        if len == 0 {
            return;
        }
        self.buffer.drain(..len);
        self.stats.discarded_bytes += len as u64;
    }
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::for_chunk_size(DEFAULT_CHUNK_SIZE)
    }
}

fn find_marker(buffer: &[u8], from: usize, marker: [u8; 2]) -> Option<usize> {
    if buffer.len() < from + marker.len() {
        return None;
    }
    buffer[from..]
        .windows(marker.len())
        .position(|w| w == marker)
        .map(|pos| pos + from)
}

// ----------------------------------------------------------------------------
// JpegFrames: lazy frame sequence over a reader
// ----------------------------------------------------------------------------

/// Lazy, non-restartable sequence of frames read from `R`.
///
/// Ends at EOF. A read error ends the sequence, except `TimedOut` and
/// `WouldBlock`, which are yielded and iteration may continue.
pub struct JpegFrames<R> {
    reader: R,
    reassembler: FrameReassembler,
    pending: VecDeque<Vec<u8>>,
    chunk: Vec<u8>,
    finished: bool,
}

impl<R: Read> JpegFrames<R> {
    pub fn new(reader: R, chunk_size: usize, max_frame_bytes: usize) -> Self {
        let chunk_size = chunk_size.max(SOI.len());
        Self {
            reader,
            reassembler: FrameReassembler::new(chunk_size * 2, max_frame_bytes),
            pending: VecDeque::new(),
            chunk: vec![0u8; chunk_size],
            finished: false,
        }
    }

    pub fn reassembler(&self) -> &FrameReassembler {
        &self.reassembler
    }
}

impl<R: Read> Iterator for JpegFrames<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(Ok(frame));
            }
            if self.finished {
                return None;
            }
            match self.reader.read(&mut self.chunk) {
                Ok(0) => {
                    self.finished = true;
                    return None;
                }
                Ok(n) => {
                    let frames = self.reassembler.push(&self.chunk[..n]);
                    self.pending.extend(frames);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if is_transient(&err) => return Some(Err(err)),
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Read errors that mean "no data yet" rather than "stream broken".
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
