use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Default capacity of a pooled slot; frames larger than this bypass the pool
pub const DEFAULT_SLOT_SIZE: usize = 1024 * 1024;

/// Number of slots the pool starts with and never automatically shrinks below
pub const DEFAULT_POOL_SLOTS: usize = 20;

/// Pool of reusable byte buffers sized for one JPEG frame each.
///
/// Upstream delivery is bursty; recycling buffers keeps the hot path free of
/// per-frame allocations. Requests larger than the slot size get a one-off
/// allocation that is not pooled back.
pub struct FrameBufferPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    slot_size: usize,
    baseline: usize,
    free: Mutex<Vec<Vec<u8>>>,
    stats: PoolStats,
}

#[derive(Debug, Default)]
struct PoolStats {
    created: AtomicU64,
    reused: AtomicU64,
    expanded: AtomicU64,
    in_use: AtomicUsize,
}

/// Weakly-consistent snapshot of pool counters
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStatsSnapshot {
    pub created: u64,
    pub reused: u64,
    pub expanded: u64,
    pub in_use: usize,
    pub available: usize,
    pub slot_size: usize,
}

impl FrameBufferPool {
    /// Create a pool with the default slot size and starting capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_SLOTS, DEFAULT_SLOT_SIZE)
    }

    /// Create a pool with `slots` pre-allocated buffers of `slot_size` bytes
    pub fn with_capacity(slots: usize, slot_size: usize) -> Self {
        assert!(slot_size > 0, "pool slot size must be greater than 0");

        let mut free = Vec::with_capacity(slots);
        for _ in 0..slots {
            free.push(Vec::with_capacity(slot_size));
        }

        debug!(
            "Created frame buffer pool: {} slots of {} bytes",
            slots, slot_size
        );

        let shared = Arc::new(PoolShared {
            slot_size,
            baseline: slots,
            free: Mutex::new(free),
            stats: PoolStats::default(),
        });
        shared.stats.created.store(slots as u64, Ordering::Relaxed);

        Self { shared }
    }

    /// Acquire a buffer holding at least `n` bytes.
    ///
    /// Requests above the slot size return a fresh allocation that is dropped
    /// on release instead of returning to the pool.
    pub fn acquire(&self, n: usize) -> PooledBuffer {
        if n > self.shared.slot_size {
            trace!("Oversize acquire ({} bytes), bypassing pool", n);
            self.shared.stats.created.fetch_add(1, Ordering::Relaxed);
            self.shared.stats.expanded.fetch_add(1, Ordering::Relaxed);
            self.shared.stats.in_use.fetch_add(1, Ordering::Relaxed);
            return PooledBuffer {
                data: Vec::with_capacity(n),
                pool: None,
                in_use_tracked: Some(Arc::clone(&self.shared)),
            };
        }

        let recycled = self.shared.free.lock().pop();
        let data = match recycled {
            Some(buf) => {
                self.shared.stats.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.shared.stats.created.fetch_add(1, Ordering::Relaxed);
                self.shared.stats.expanded.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.shared.slot_size)
            }
        };
        self.shared.stats.in_use.fetch_add(1, Ordering::Relaxed);

        PooledBuffer {
            data,
            pool: Some(Arc::clone(&self.shared)),
            in_use_tracked: None,
        }
    }

    /// Acquire a buffer and copy `bytes` into it
    pub fn acquire_from(&self, bytes: &[u8]) -> PooledBuffer {
        let mut buf = self.acquire(bytes.len());
        buf.fill_from(bytes);
        buf
    }

    /// Drop idle buffers down to the starting pool size
    pub fn shrink(&self) {
        let mut free = self.shared.free.lock();
        if free.len() > self.shared.baseline {
            let dropped = free.len() - self.shared.baseline;
            free.truncate(self.shared.baseline);
            debug!("Shrunk frame buffer pool by {} idle buffers", dropped);
        }
    }

    /// Current counter snapshot; counters are individually atomic only
    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            created: self.shared.stats.created.load(Ordering::Relaxed),
            reused: self.shared.stats.reused.load(Ordering::Relaxed),
            expanded: self.shared.stats.expanded.load(Ordering::Relaxed),
            in_use: self.shared.stats.in_use.load(Ordering::Relaxed),
            available: self.shared.free.lock().len(),
            slot_size: self.shared.slot_size,
        }
    }

    /// Configured slot size in bytes
    pub fn slot_size(&self) -> usize {
        self.shared.slot_size
    }
}

impl Default for FrameBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer checked out of the pool.
///
/// Dropping the handle returns the buffer to the pool (or frees it, for
/// oversize allocations). Release-on-drop makes double release
/// unrepresentable.
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Option<Arc<PoolShared>>,
    in_use_tracked: Option<Arc<PoolShared>>,
}

impl PooledBuffer {
    /// Replace the buffer contents with `bytes`
    pub fn fill_from(&mut self, bytes: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(bytes);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Capacity of the underlying allocation
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let mut buf = std::mem::take(&mut self.data);
            buf.clear();
            pool.free.lock().push(buf);
            pool.stats.in_use.fetch_sub(1, Ordering::Relaxed);
        } else if let Some(pool) = self.in_use_tracked.take() {
            pool.stats.in_use.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_starts_with_baseline_slots() {
        let pool = FrameBufferPool::new();
        let stats = pool.stats();
        assert_eq!(stats.available, DEFAULT_POOL_SLOTS);
        assert_eq!(stats.created, DEFAULT_POOL_SLOTS as u64);
        assert_eq!(stats.in_use, 0);
    }

    #[test]
    fn test_acquire_release_reuses_buffers() {
        let pool = FrameBufferPool::with_capacity(2, 1024);

        let buf = pool.acquire_from(b"frame");
        assert_eq!(buf.as_slice(), b"frame");
        assert_eq!(pool.stats().in_use, 1);
        assert_eq!(pool.stats().available, 1);
        drop(buf);

        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.stats().available, 2);

        let _a = pool.acquire(10);
        let _b = pool.acquire(10);
        assert_eq!(pool.stats().reused, 3);
    }

    #[test]
    fn test_pool_grows_on_demand() {
        let pool = FrameBufferPool::with_capacity(1, 1024);

        let a = pool.acquire(10);
        let b = pool.acquire(10);
        assert_eq!(pool.stats().expanded, 1);
        drop(a);
        drop(b);

        // Both buffers return; pool is now above its baseline
        assert_eq!(pool.stats().available, 2);
    }

    #[test]
    fn test_oversize_acquire_bypasses_pool() {
        let pool = FrameBufferPool::with_capacity(2, 64);

        let big = pool.acquire_from(&vec![0xAB; 256]);
        assert_eq!(big.len(), 256);
        assert_eq!(pool.stats().in_use, 1);
        drop(big);

        // The oversize buffer is freed, not pooled
        assert_eq!(pool.stats().available, 2);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_shrink_restores_baseline() {
        let pool = FrameBufferPool::with_capacity(2, 1024);

        let bufs: Vec<_> = (0..6).map(|_| pool.acquire(8)).collect();
        drop(bufs);
        assert_eq!(pool.stats().available, 6);

        pool.shrink();
        assert_eq!(pool.stats().available, 2);
    }

    #[test]
    fn test_fill_from_replaces_contents() {
        let pool = FrameBufferPool::with_capacity(1, 1024);
        let mut buf = pool.acquire_from(b"first");
        buf.fill_from(b"second frame");
        assert_eq!(buf.as_slice(), b"second frame");
    }
}
