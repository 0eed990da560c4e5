use crate::pool::PooledBuffer;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A complete JPEG frame (SOI through EOI) with capture metadata.
///
/// Frames are cheap to clone: all clones share one pooled buffer, and the
/// buffer returns to its pool when the last clone drops. Viewers, the
/// pre-motion buffer, and worker submissions each hold a clone for as long as
/// they need the bytes.
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameInner>,
}

struct FrameInner {
    source_id: Arc<str>,
    sequence: u64,
    wall: SystemTime,
    mono: Instant,
    buffer: PooledBuffer,
}

impl Frame {
    /// Wrap a filled pool buffer as a frame, stamping both clocks
    pub fn new(source_id: Arc<str>, sequence: u64, buffer: PooledBuffer) -> Self {
        Self {
            inner: Arc::new(FrameInner {
                source_id,
                sequence,
                wall: SystemTime::now(),
                mono: Instant::now(),
                buffer,
            }),
        }
    }

    /// JPEG bytes, SOI through EOI inclusive
    pub fn data(&self) -> &[u8] {
        self.inner.buffer.as_slice()
    }

    pub fn len(&self) -> usize {
        self.inner.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.buffer.is_empty()
    }

    pub fn source_id(&self) -> &str {
        &self.inner.source_id
    }

    /// Per-source sequence number, monotonically increasing from 1
    pub fn sequence(&self) -> u64 {
        self.inner.sequence
    }

    /// Wall-clock arrival time
    pub fn wall_time(&self) -> SystemTime {
        self.inner.wall
    }

    /// Monotonic arrival time
    pub fn mono_time(&self) -> Instant {
        self.inner.mono
    }

    /// Wall-clock arrival time as milliseconds since the Unix epoch
    pub fn epoch_ms(&self) -> u64 {
        self.inner
            .wall
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Number of live references to this frame's buffer (diagnostics)
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("source_id", &self.source_id())
            .field("sequence", &self.sequence())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FrameBufferPool;

    fn test_frame(pool: &FrameBufferPool, sequence: u64, payload: &[u8]) -> Frame {
        Frame::new(Arc::from("coop"), sequence, pool.acquire_from(payload))
    }

    #[test]
    fn test_frame_metadata() {
        let pool = FrameBufferPool::with_capacity(2, 1024);
        let frame = test_frame(&pool, 7, b"\xFF\xD8jpeg\xFF\xD9");

        assert_eq!(frame.source_id(), "coop");
        assert_eq!(frame.sequence(), 7);
        assert_eq!(frame.len(), 8);
        assert!(frame.epoch_ms() > 0);
    }

    #[test]
    fn test_clones_share_one_buffer() {
        let pool = FrameBufferPool::with_capacity(2, 1024);
        let frame = test_frame(&pool, 1, b"payload");

        let clone = frame.clone();
        assert_eq!(frame.ref_count(), 2);
        assert_eq!(clone.data(), frame.data());
        assert_eq!(pool.stats().in_use, 1);
    }

    #[test]
    fn test_buffer_returns_when_last_clone_drops() {
        let pool = FrameBufferPool::with_capacity(1, 1024);
        let frame = test_frame(&pool, 1, b"payload");
        let clone = frame.clone();

        drop(frame);
        assert_eq!(pool.stats().in_use, 1);

        drop(clone);
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.stats().available, 1);
    }
}
