//! Per-I/O-channel state: a FIFO retry queue for stripe-acquisition
//! backpressure and a pool of reusable scatter-gather buffers.
//!
//! One [`Channel`] exists per I/O channel the enclosing framework hands
//! the array (conventionally one per reactor thread). Its retry queue and
//! buffer pool are only ever touched from that channel's own thread in
//! the original design; here they're behind [`parking_lot::Mutex`] so the
//! simplified synchronous call paths can share a `Channel` across test
//! threads without requiring a dedicated reactor per test.

use std::collections::VecDeque;

use parking_lot::Mutex;


/// A submission deferred because stripe acquisition returned
/// [`crate::error::RaidError::NoMem`]. Boxed as `FnOnce` so the caller
/// doesn't need to name the concrete closure type; `submit_rw` in
/// [`crate::dispatcher`] retries it by calling it again.
pub type RetryEntry = Box<dyn FnOnce() + Send>;

/// Per-channel resources: retry queue plus a fixed-size pool of
/// reusable scatter-gather buffers for the (disabled by default)
/// non-degraded read fast path.
pub struct Channel {
    retry_queue: Mutex<VecDeque<RetryEntry>>,
    iov_pool: Mutex<Vec<Vec<u8>>>,
    iov_pool_capacity: usize,
}

impl Channel {
    #[must_use]
    pub fn new(iov_pool_capacity: usize) -> Self {
        Self { retry_queue: Mutex::new(VecDeque::new()), iov_pool: Mutex::new(Vec::new()), iov_pool_capacity }
    }

    /// Queues a submission for retry after the next completion frees a
    /// resource.
    pub fn push_retry(&self, entry: RetryEntry) {
        self.retry_queue.lock().push_back(entry);
    }

    /// Pops and returns one deferred submission, if any, to be rerun by
    /// the caller.
    pub fn pop_retry(&self) -> Option<RetryEntry> {
        self.retry_queue.lock().pop_front()
    }

    #[must_use]
    pub fn retry_queue_is_empty(&self) -> bool {
        self.retry_queue.lock().is_empty()
    }

    /// Takes a buffer of at least `len` bytes from the pool, or allocates
    /// a fresh one if the pool is empty or every pooled buffer is too
    /// small.
    #[must_use]
    pub fn acquire_iov(&self, len: usize) -> Vec<u8> {
        let mut pool = self.iov_pool.lock();
        if let Some(pos) = pool.iter().position(|b| b.len() >= len) {
            let mut buf = pool.swap_remove(pos);
            buf.truncate(len);
            buf
        } else {
            vec![0u8; len]
        }
    }

    /// Returns a buffer to the pool, up to `iov_pool_capacity` entries;
    /// buffers beyond that are simply dropped.
    pub fn release_iov(&self, buf: Vec<u8>) {
        let mut pool = self.iov_pool.lock();
        if pool.len() < self.iov_pool_capacity {
            pool.push(buf);
        }
    }

    #[cfg(test)]
    fn pool_len(&self) -> usize {
        self.iov_pool.lock().len()
    }

    /// Asserts the channel is quiescent: no deferred retries, and drains
    /// the buffer pool. Call on channel teardown.
    pub fn deinit(&self) {
        debug_assert!(self.retry_queue_is_empty(), "channel deinit with pending retries");
        self.iov_pool.lock().clear();
    }
}
