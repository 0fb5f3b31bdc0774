//! Reusable packet buffers
//!
//! Buffers are handed out by value and travel through the queues
//! (reader -> processor -> interface writer). Whoever holds a `PoolBuffer`
//! is its only writer; dropping it puts the storage back on the free list.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

/// Minimum capacity of every pooled buffer.
pub const MIN_BUFFER_SIZE: usize = 4096;

/// Buffer pool with a lock-free free list.
///
/// The free list is not keyed by size: a recycled buffer that turns out to be
/// too small for a request is grown in place. When the free list is empty a
/// fresh buffer is allocated, so `alloc` never fails.
pub struct BufferPool {
    free: ArrayQueue<Vec<u8>>,
    allocated: AtomicU64,
    reused: AtomicU64,
}

/// Allocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers created or grown because no suitable free buffer existed
    pub allocated: u64,
    /// Requests served from the free list without allocating
    pub reused: u64,
}

impl BufferPool {
    /// Create a pool that keeps at most `retain` idle buffers.
    pub fn new(retain: usize) -> Self {
        Self {
            free: ArrayQueue::new(retain.max(1)),
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Get a buffer with at least `size` bytes of capacity (and never less
    /// than `MIN_BUFFER_SIZE`). The returned buffer has length 0.
    pub fn alloc(self: &Arc<Self>, size: usize) -> PoolBuffer {
        let wanted = size.max(MIN_BUFFER_SIZE);

        let storage = match self.free.pop() {
            Some(storage) if storage.len() >= wanted => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                storage
            }
            Some(mut storage) => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                storage.resize(wanted, 0);
                storage
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; wanted]
            }
        };

        PoolBuffer {
            pool: Arc::clone(self),
            storage,
            len: 0,
        }
    }

    /// Number of idle buffers on the free list
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn return_buffer(&self, storage: Vec<u8>) {
        // A full free list just lets the storage go.
        let _ = self.free.push(storage);
    }
}

/// A buffer owned from the pool
///
/// Only `[0, len)` is valid data; bytes past `len` may be left over from a
/// previous user and are never exposed through `data()`.
pub struct PoolBuffer {
    pool: Arc<BufferPool>,
    storage: Vec<u8>,
    len: usize,
}

impl PoolBuffer {
    /// Valid bytes
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.storage[..self.len]
    }

    /// Whole storage, for filling the buffer before calling `set_len`.
    #[inline]
    pub fn write_area(&mut self) -> &mut [u8] {
        &mut self.storage
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Mark the first `len` bytes as valid.
    ///
    /// # Panics
    /// Panics if `len` exceeds the capacity.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.storage.len(), "length beyond buffer capacity");
        self.len = len;
    }

    /// Copy `bytes` into the buffer, replacing its contents.
    ///
    /// # Panics
    /// Panics if `bytes` does not fit.
    pub fn fill_from(&mut self, bytes: &[u8]) {
        self.storage[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
    }
}

impl Drop for PoolBuffer {
    #[inline]
    fn drop(&mut self) {
        self.pool.return_buffer(std::mem::take(&mut self.storage));
    }
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("len", &self.len)
            .field("capacity", &self.storage.len())
            .finish()
    }
}
