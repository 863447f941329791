//! Pooled per-logical-stripe state: scratch buffers, in-flight request
//! queue, and the reference count that guards reclamation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::stripe_request::StripeRequest;


/// Per-stripe state, reused across different `stripe_index` bindings as the
/// cache reclaims and rebinds free slots.
pub struct StripeState {
    stripe_index: AtomicU64,
    /// Guards reclamation: non-zero while any stripe request references
    /// this stripe.
    pub ref_count: AtomicUsize,
    /// FIFO of stripe requests against this stripe; the front element is
    /// the one currently in flight against the member devices.
    pub requests: Mutex<VecDeque<Arc<StripeRequest>>>,
    /// One scratch buffer per member, sized `strip_size * blocklen`.
    pub scratch: Vec<Mutex<Vec<u8>>>,
}

impl StripeState {
    #[must_use]
    pub fn new(num_members: usize, strip_size: u64, blocklen: u64) -> Self {
        let scratch_len = (strip_size * blocklen) as usize;
        Self {
            stripe_index: AtomicU64::new(u64::MAX),
            ref_count: AtomicUsize::new(0),
            requests: Mutex::new(VecDeque::new()),
            scratch: (0..num_members).map(|_| Mutex::new(vec![0u8; scratch_len])).collect(),
        }
    }

    #[must_use]
    pub fn stripe_index(&self) -> u64 {
        self.stripe_index.load(Ordering::Acquire)
    }

    /// Rebinds this (now-free) stripe slot to a different logical stripe.
    pub fn rebind(&self, stripe_index: u64) {
        self.stripe_index.store(stripe_index, Ordering::Release);
    }

    /// Enqueues a stripe request; returns `true` if the queue was empty
    /// (meaning the caller must submit it immediately rather than waiting
    /// for a predecessor's completion to dequeue it).
    pub fn enqueue(&self, req: Arc<StripeRequest>) -> bool {
        let mut q = self.requests.lock();
        let was_empty = q.is_empty();
        q.push_back(req);
        was_empty
    }

    /// Unlinks the completed request (expected to be at the front of the
    /// queue) and returns the next queued request, if any, without
    /// removing it — the caller submits it and it stays at the front until
    /// *its* completion.
    pub fn complete_and_advance(&self, completed: &Arc<StripeRequest>) -> Option<Arc<StripeRequest>> {
        let mut q = self.requests.lock();
        let front = q.pop_front();
        debug_assert!(
            front.is_some_and(|f| Arc::ptr_eq(&f, completed)),
            "stripe request completed out of FIFO order"
        );
        q.front().cloned()
    }

    pub fn release(&self) {
        self.ref_count.fetch_sub(1, Ordering::AcqRel);
    }
}
