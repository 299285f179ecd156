//! Frames and the shared frame buffer.
//!
//! - `Frame`: one complete JPEG image as ingested, plus its decoded pixels.
//! - `FrameBuffer`: bounded, thread-safe holder of the most recent items.
//!
//! A `FrameBuffer` has exactly one producer and any number of readers. Readers
//! that use the non-consuming calls (`latest`, `wait_latest`, `wait_newer`) never
//! interfere with each other: every reader tracks the last version it has seen
//! and observes the same newest item. The consuming calls (`pop`, `wait_pop`)
//! exist for the single-consumer ingestion queue only.

use image::DynamicImage;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Capacity of the queue between the reassembler and the decode stage.
pub const DEFAULT_INGEST_CAPACITY: usize = 10;

/// Capacity of the buffer handlers read from ("latest frame wins").
pub const DEFAULT_DISTRIBUTION_CAPACITY: usize = 1;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One complete frame. Immutable once produced; clones share the underlying data.
#[derive(Clone)]
pub struct Frame {
    sequence: u64,
    jpeg: Arc<[u8]>,
    image: Arc<DynamicImage>,
    received_at: Instant,
}

impl Frame {
    pub fn new(sequence: u64, jpeg: Vec<u8>, image: DynamicImage) -> Self {
        Self {
            sequence,
            jpeg: Arc::from(jpeg),
            image: Arc::new(image),
            received_at: Instant::now(),
        }
    }

    /// Arrival order assigned by the decode stage.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// JPEG bytes exactly as they were cut from the source stream.
    pub fn jpeg(&self) -> &[u8] {
        &self.jpeg
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("jpeg_len", &self.jpeg.len())
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer
// ----------------------------------------------------------------------------

/// Bounded buffer of the most recently pushed items.
///
/// Every push gets a version number (starting at 1) that grows monotonically.
/// A push into a full buffer evicts the oldest item and never blocks.
/// Every push wakes every waiter.
pub struct FrameBuffer<T> {
    state: Mutex<BufferState<T>>,
    ready: Condvar,
    capacity: usize,
}

struct BufferState<T> {
    items: VecDeque<(u64, T)>,
    version: u64,
    closed: bool,
}

impl<T: Clone> FrameBuffer<T> {
    /// Create a buffer holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(BufferState {
                items: VecDeque::with_capacity(capacity),
                version: 0,
                closed: false,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Store an item, evicting the oldest when full. Returns the item's version.
    pub fn push(&self, item: T) -> u64 {
        let version = {
            let mut state = self.lock();
            while state.items.len() >= self.capacity {
                state.items.pop_front();
            }
            state.version += 1;
            let version = state.version;
            state.items.push_back((version, item));
            version
        };
        self.ready.notify_all();
        version
    }

    /// Newest item, without removing it.
    pub fn latest(&self) -> Option<T> {
        self.lock().items.back().map(|(_, item)| item.clone())
    }

    /// Remove and return the oldest item.
    pub fn pop(&self) -> Option<T> {
        self.lock().items.pop_front().map(|(_, item)| item)
    }

    /// Block until an item exists (or `timeout` elapses), then remove and return the oldest.
    pub fn wait_pop(&self, timeout: Duration) -> Option<T> {
        let guard = self.lock();
        let (mut state, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |s| !s.closed && s.items.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return None;
        }
        state.items.pop_front().map(|(_, item)| item)
    }

    /// Block until an item exists (or `timeout` elapses), then return the newest
    /// without removing it.
    pub fn wait_latest(&self, timeout: Duration) -> Option<T> {
        let guard = self.lock();
        let (state, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |s| !s.closed && s.items.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return None;
        }
        state.items.back().map(|(_, item)| item.clone())
    }

    /// Block until an item newer than `seen` exists (or `timeout` elapses).
    ///
    /// Returns the newest item and its version; intermediate items are skipped.
    /// Pass `0` to accept anything already buffered.
    pub fn wait_newer(&self, seen: u64, timeout: Duration) -> Option<(u64, T)> {
        let guard = self.lock();
        let (state, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |s| !s.closed && s.version <= seen)
            .unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return None;
        }
        state
            .items
            .back()
            .filter(|(version, _)| *version > seen)
            .map(|(version, item)| (*version, item.clone()))
    }

    /// Version of the most recent push (0 if nothing was ever pushed).
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wake every waiter; all later waits return `None` immediately.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, BufferState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn push_beyond_capacity_keeps_last_c() {
        let buf = FrameBuffer::new(10);
        for i in 0..25u32 {
            buf.push(i);
        }
        assert_eq!(buf.len(), 10);
        let drained: Vec<u32> = std::iter::from_fn(|| buf.pop()).collect();
        assert_eq!(drained, (15..25).collect::<Vec<_>>());
    }

    #[test]
    fn single_slot_holds_only_latest() {
        let buf = FrameBuffer::new(1);
        buf.push("a");
        buf.push("b");
        buf.push("c");
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.latest(), Some("c"));
        assert_eq!(buf.version(), 3);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let buf = FrameBuffer::new(0);
        assert_eq!(buf.capacity(), 1);
        buf.push(1);
        assert_eq!(buf.latest(), Some(1));
    }

    #[test]
    fn latest_does_not_consume() {
        let buf = FrameBuffer::new(1);
        buf.push(7);
        assert_eq!(buf.latest(), Some(7));
        assert_eq!(buf.latest(), Some(7));
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn independent_readers_see_the_same_frame() {
        let buf = FrameBuffer::new(1);
        let version = buf.push(String::from("frame-1"));

        let first = buf.wait_newer(0, SHORT);
        let second = buf.wait_newer(0, SHORT);
        assert_eq!(first, Some((version, String::from("frame-1"))));
        assert_eq!(first, second);

        // Both readers have now seen `version`; neither gets it twice.
        assert_eq!(buf.wait_newer(version, SHORT), None);
    }

    #[test]
    fn wait_newer_skips_to_newest() {
        let buf = FrameBuffer::new(4);
        buf.push(1);
        buf.push(2);
        let v3 = buf.push(3);
        assert_eq!(buf.wait_newer(1, SHORT), Some((v3, 3)));
    }

    #[test]
    fn wait_latest_times_out_when_empty() {
        let buf: FrameBuffer<u8> = FrameBuffer::new(1);
        let start = Instant::now();
        assert_eq!(buf.wait_latest(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn waiters_wake_on_push_from_other_thread() {
        let buf = Arc::new(FrameBuffer::new(1));
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let buf = buf.clone();
                thread::spawn(move || buf.wait_newer(0, Duration::from_secs(5)))
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        buf.push(99u32);

        for reader in readers {
            assert_eq!(reader.join().unwrap(), Some((1, 99)));
        }
    }

    #[test]
    fn wait_pop_consumes_in_order() {
        let buf = FrameBuffer::new(3);
        buf.push(1);
        buf.push(2);
        assert_eq!(buf.wait_pop(SHORT), Some(1));
        assert_eq!(buf.wait_pop(SHORT), Some(2));
        assert_eq!(buf.wait_pop(SHORT), None);
    }

    #[test]
    fn close_wakes_blocked_waiters() {
        let buf: Arc<FrameBuffer<u8>> = Arc::new(FrameBuffer::new(1));
        let waiter = {
            let buf = buf.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let got = buf.wait_latest(Duration::from_secs(10));
                (got, start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        buf.close();
        let (got, waited) = waiter.join().unwrap();
        assert_eq!(got, None);
        assert!(waited < Duration::from_secs(5));
        assert!(buf.is_closed());
    }

    #[test]
    fn frame_clones_share_bytes() {
        let image = DynamicImage::new_rgb8(4, 2);
        let frame = Frame::new(5, vec![0xFF, 0xD8, 0xFF, 0xD9], image);
        let copy = frame.clone();
        assert_eq!(copy.sequence(), 5);
        assert_eq!(copy.jpeg(), &[0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!((copy.width(), copy.height()), (4, 2));
        assert!(std::ptr::eq(frame.jpeg().as_ptr(), copy.jpeg().as_ptr()));
    }
}
