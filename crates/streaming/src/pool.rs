//! Pooled receive buffers
//!
//! Connection handlers rent a buffer per raw frame and the parser workers
//! return it once the frame is decoded, so the hot path allocates nothing.
//! The pool is a fixed-size lock-free queue; when it runs dry a fresh buffer
//! is allocated and joins the pool on return.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;

/// Lock-free pool of `BytesMut` receive buffers
pub struct BufferPool {
    queue: ArrayQueue<BytesMut>,
    buffer_capacity: usize,
    rents: AtomicU64,
    returns: AtomicU64,
}

impl BufferPool {
    /// Pre-allocate `pool_size` buffers of `buffer_capacity` bytes
    pub fn new(pool_size: usize, buffer_capacity: usize) -> Self {
        let queue = ArrayQueue::new(pool_size.max(1));
        for _ in 0..pool_size {
            let _ = queue.push(BytesMut::with_capacity(buffer_capacity));
        }
        Self {
            queue,
            buffer_capacity,
            rents: AtomicU64::new(0),
            returns: AtomicU64::new(0),
        }
    }

    /// Rent a buffer; allocates when the pool is dry
    #[inline]
    pub fn rent(&self) -> BytesMut {
        self.rents.fetch_add(1, Ordering::Relaxed);
        self.queue
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_capacity))
    }

    /// Return a buffer; its contents are discarded
    #[inline]
    pub fn give_back(&self, mut buf: BytesMut) {
        self.returns.fetch_add(1, Ordering::Relaxed);
        buf.clear();
        // shrunken buffers (split off by a previous user) are not worth pooling
        if buf.capacity() >= self.buffer_capacity {
            let _ = self.queue.push(buf);
        }
    }

    /// Capacity every rented buffer starts with
    #[inline]
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Buffers currently parked in the pool
    #[inline]
    pub fn available(&self) -> usize {
        self.queue.len()
    }

    /// Rent/return balance, for leak assertions
    pub fn outstanding(&self) -> u64 {
        self.rents
            .load(Ordering::Relaxed)
            .saturating_sub(self.returns.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rent_and_return() {
        let pool = BufferPool::new(2, 128);
        assert_eq!(pool.available(), 2);

        let a = pool.rent();
        let b = pool.rent();
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.outstanding(), 2);

        pool.give_back(a);
        pool.give_back(b);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn dry_pool_allocates() {
        let pool = BufferPool::new(1, 64);
        let a = pool.rent();
        let b = pool.rent();
        assert_eq!(b.capacity(), 64);
        pool.give_back(a);
        pool.give_back(b);
        // the overflow buffer is parked only if there is room
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn returned_buffers_are_cleared() {
        let pool = BufferPool::new(1, 64);
        let mut buf = pool.rent();
        buf.extend_from_slice(b"leftovers");
        pool.give_back(buf);
        assert!(pool.rent().is_empty());
    }
}
