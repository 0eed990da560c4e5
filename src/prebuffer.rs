use crate::frame::Frame;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

/// Fixed-capacity rolling window of recent frames for one source.
///
/// Holds a reference to each pushed frame so that a motion-triggered
/// recording can reach back in time; eviction drops exactly one reference,
/// returning the buffer to the pool once no other consumer holds it.
pub struct PreBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
    stats: PreBufferStats,
}

struct Inner {
    frames: VecDeque<Frame>,
    wrapped: bool,
}

#[derive(Debug, Default)]
struct PreBufferStats {
    pushed: AtomicU64,
    evicted: AtomicU64,
}

/// Point-in-time view of the buffer contents
#[derive(Debug, Clone)]
pub struct PreBufferStatsSnapshot {
    pub count: usize,
    pub capacity: usize,
    pub wrapped: bool,
    pub oldest: Option<SystemTime>,
    pub newest: Option<SystemTime>,
    pub span: Duration,
    pub bytes: usize,
    pub pushed: u64,
    pub evicted: u64,
}

impl PreBuffer {
    /// Create a buffer holding at most `capacity` frames
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "pre-buffer capacity must be greater than 0");

        debug!("Created pre-motion buffer with capacity {}", capacity);

        Self {
            capacity,
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                wrapped: false,
            }),
            stats: PreBufferStats::default(),
        }
    }

    /// Push a frame, evicting the oldest when full. O(1).
    pub fn push(&self, frame: Frame) {
        let mut inner = self.inner.lock();
        if inner.frames.len() == self.capacity {
            inner.wrapped = true;
            inner.frames.pop_front();
            self.stats.evicted.fetch_add(1, Ordering::Relaxed);
        }
        inner.frames.push_back(frame);
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames whose monotonic timestamp is at or after `t`, oldest first.
    ///
    /// Pushes arrive in arrival order, so the window is already sorted.
    pub fn snapshot_since(&self, t: Instant) -> Vec<Frame> {
        let inner = self.inner.lock();
        inner
            .frames
            .iter()
            .filter(|f| f.mono_time() >= t)
            .cloned()
            .collect()
    }

    /// All buffered frames, oldest first
    pub fn snapshot_all(&self) -> Vec<Frame> {
        let inner = self.inner.lock();
        inner.frames.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop all buffered frames (releasing their references)
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.frames.clear();
        inner.wrapped = false;
    }

    pub fn stats(&self) -> PreBufferStatsSnapshot {
        let inner = self.inner.lock();
        let oldest = inner.frames.front().map(|f| f.wall_time());
        let newest = inner.frames.back().map(|f| f.wall_time());
        let span = match (inner.frames.front(), inner.frames.back()) {
            (Some(first), Some(last)) => {
                last.mono_time().saturating_duration_since(first.mono_time())
            }
            _ => Duration::ZERO,
        };

        PreBufferStatsSnapshot {
            count: inner.frames.len(),
            capacity: self.capacity,
            wrapped: inner.wrapped,
            oldest,
            newest,
            span,
            bytes: inner.frames.iter().map(|f| f.len()).sum(),
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FrameBufferPool;
    use std::sync::Arc;

    fn push_frame(buffer: &PreBuffer, pool: &FrameBufferPool, sequence: u64) -> Frame {
        let frame = Frame::new(Arc::from("coop"), sequence, pool.acquire_from(b"jpeg"));
        buffer.push(frame.clone());
        frame
    }

    #[test]
    fn test_bounded_by_capacity() {
        let pool = FrameBufferPool::with_capacity(8, 64);
        let buffer = PreBuffer::new(3);

        for seq in 1..=10 {
            push_frame(&buffer, &pool, seq);
        }

        let stats = buffer.stats();
        assert_eq!(stats.count, 3);
        assert!(stats.wrapped);
        assert_eq!(stats.pushed, 10);
        assert_eq!(stats.evicted, 7);
    }

    #[test]
    fn test_wrapped_buffer_holds_newest_frames() {
        let pool = FrameBufferPool::with_capacity(8, 64);
        let buffer = PreBuffer::new(2);

        for seq in 1..=4 {
            push_frame(&buffer, &pool, seq);
        }

        let frames = buffer.snapshot_all();
        let sequences: Vec<u64> = frames.iter().map(|f| f.sequence()).collect();
        assert_eq!(sequences, vec![3, 4]);
    }

    #[test]
    fn test_eviction_releases_exactly_one_reference() {
        let pool = FrameBufferPool::with_capacity(8, 64);
        let buffer = PreBuffer::new(2);

        push_frame(&buffer, &pool, 1);
        push_frame(&buffer, &pool, 2);
        // Buffer is the only holder of both frames now
        assert_eq!(pool.stats().in_use, 2);

        push_frame(&buffer, &pool, 3);
        assert_eq!(pool.stats().in_use, 2);
    }

    #[test]
    fn test_snapshot_since_is_chronological() {
        let pool = FrameBufferPool::with_capacity(16, 64);
        let buffer = PreBuffer::new(10);

        for seq in 1..=3 {
            push_frame(&buffer, &pool, seq);
        }
        // Give the cutoff frame a strictly later monotonic timestamp
        std::thread::sleep(std::time::Duration::from_millis(2));
        let cutoff_frame = push_frame(&buffer, &pool, 4);
        for seq in 5..=7 {
            push_frame(&buffer, &pool, seq);
        }

        let frames = buffer.snapshot_since(cutoff_frame.mono_time());
        let sequences: Vec<u64> = frames.iter().map(|f| f.sequence()).collect();
        assert_eq!(sequences, vec![4, 5, 6, 7]);

        for pair in frames.windows(2) {
            assert!(pair[0].mono_time() <= pair[1].mono_time());
        }
    }

    #[test]
    fn test_clear_releases_references() {
        let pool = FrameBufferPool::with_capacity(8, 64);
        let buffer = PreBuffer::new(4);

        for seq in 1..=4 {
            push_frame(&buffer, &pool, seq);
        }
        assert_eq!(pool.stats().in_use, 4);

        buffer.clear();
        assert_eq!(pool.stats().in_use, 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_stats_span_and_bytes() {
        let pool = FrameBufferPool::with_capacity(8, 64);
        let buffer = PreBuffer::new(4);

        push_frame(&buffer, &pool, 1);
        push_frame(&buffer, &pool, 2);

        let stats = buffer.stats();
        assert_eq!(stats.bytes, 8);
        assert!(stats.oldest.is_some());
        assert!(stats.newest.is_some());
        assert!(!stats.wrapped);
    }
}
