//! Fixed-size frame buffers and the pool that recycles them.
//!
//! Every frame on the hot path lives in a `FrameBuffer` drawn from a
//! `BufferPool`. Buffers are moved, never copied; whoever holds one owns it
//! and returns it to the pool on its terminal path.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Capacity of a single frame buffer, the MTU ceiling.
pub const FRAME_BUFFER_SIZE: usize = 1500;

/// Default number of buffers a pool retains.
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// A fixed-capacity byte region carrying a current length.
#[derive(Debug)]
pub struct FrameBuffer {
    data: Box<[u8; FRAME_BUFFER_SIZE]>,
    len: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; FRAME_BUFFER_SIZE]),
            len: 0,
        }
    }

    /// Build a buffer holding a copy of `src`, truncated at capacity.
    pub fn from_slice(src: &[u8]) -> Self {
        let mut buf = Self::new();
        buf.fill_from(src);
        buf
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        FRAME_BUFFER_SIZE
    }

    /// Set the current length. Out-of-range values are logged and ignored.
    pub fn set_len(&mut self, len: usize) {
        if len > FRAME_BUFFER_SIZE {
            log::warn!("frame buffer resize out of range: {}", len);
            return;
        }
        self.len = len;
    }

    /// Copy `src` into the buffer, truncating at capacity.
    pub fn fill_from(&mut self, src: &[u8]) {
        if src.len() > FRAME_BUFFER_SIZE {
            log::warn!(
                "frame larger than buffer capacity: {}/{}",
                src.len(),
                FRAME_BUFFER_SIZE
            );
        }
        self.len = src.len().min(FRAME_BUFFER_SIZE);
        self.data[..self.len].copy_from_slice(&src[..self.len]);
    }

    /// Discard the first `n` bytes, shifting the remainder to the front.
    /// Used after a partial write to keep the unwritten tail queued.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.data.copy_within(n..self.len, 0);
        self.len -= n;
    }

    /// The valid bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The whole backing region, for reads up to capacity.
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded free-list of frame buffers with a high-water mark.
///
/// `acquire` never blocks: an empty pool yields the current thread once to
/// relieve contention and falls back to a fresh allocation. `release` drops
/// the buffer when the pool is already at capacity.
pub struct BufferPool {
    inner: Mutex<PoolState>,
    capacity: usize,
}

struct PoolState {
    pool: VecDeque<FrameBuffer>,
    outstanding: usize,
    max_used: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PoolState {
                pool: VecDeque::with_capacity(capacity),
                outstanding: 0,
                max_used: 0,
            }),
            capacity,
        }
    }

    pub fn acquire(&self) -> FrameBuffer {
        let recycled = {
            let mut state = self.inner.lock().expect("buffer pool poisoned");
            state.outstanding += 1;
            state.max_used = state.max_used.max(state.outstanding);
            state.pool.pop_front()
        };
        match recycled {
            Some(buf) => buf,
            None => {
                std::thread::yield_now();
                FrameBuffer::new()
            }
        }
    }

    pub fn release(&self, mut buf: FrameBuffer) {
        let mut state = self.inner.lock().expect("buffer pool poisoned");
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.pool.len() < self.capacity {
            buf.set_len(0);
            state.pool.push_back(buf);
        }
        // at capacity the buffer is simply dropped
    }

    /// High-water mark of concurrently outstanding buffers.
    pub fn max_used(&self) -> usize {
        self.inner.lock().expect("buffer pool poisoned").max_used
    }

    /// Buffers currently held by the pool.
    pub fn available(&self) -> usize {
        self.inner.lock().expect("buffer pool poisoned").pool.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_roundtrip() {
        let pool = BufferPool::new(4);
        let mut buf = pool.acquire();
        buf.fill_from(b"hello");
        assert_eq!(buf.bytes(), b"hello");
        pool.release(buf);
        let buf = pool.acquire();
        // released buffers come back with zero length
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_underflow_allocates() {
        let pool = BufferPool::new(2);
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        assert_eq!(pool.max_used(), 3);
        pool.release(a);
        pool.release(b);
        pool.release(c);
        // pool retains only its configured capacity
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_max_used_tracks_burst() {
        let pool = BufferPool::new(8);
        let held: Vec<_> = (0..16).map(|_| pool.acquire()).collect();
        assert!(pool.max_used() >= 16);
        for buf in held {
            pool.release(buf);
        }
        assert_eq!(pool.available(), 8);
        // further releases beyond capacity free the extras
        assert!(pool.max_used() >= 16);
    }

    #[test]
    fn test_consume_shifts_tail() {
        let mut buf = FrameBuffer::from_slice(b"abcdef");
        buf.consume(2);
        assert_eq!(buf.bytes(), b"cdef");
        buf.consume(10);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_fill_truncates_at_capacity() {
        let big = vec![0xAAu8; FRAME_BUFFER_SIZE + 100];
        let buf = FrameBuffer::from_slice(&big);
        assert_eq!(buf.len(), FRAME_BUFFER_SIZE);
    }
}
