//! Bounded cache of active [`StripeState`] slots, keyed by stripe index,
//! with LRU-ish reclamation under a single lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::stripe_state::StripeState;


struct Inner {
    hash: HashMap<u64, Arc<StripeState>>,
    /// MRU at the front, LRU at the back.
    active: VecDeque<Arc<StripeState>>,
    free: Vec<Arc<StripeState>>,
}

/// Fixed-capacity pool of stripe slots. All `capacity` slots are allocated
/// up front at construction and never grown; a miss with an empty free
/// list reclaims from the tail of `active` before giving up with
/// [`RaidError::NoMem`](crate::error::RaidError::NoMem).
pub struct StripeCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl StripeCache {
    #[must_use]
    pub fn new(capacity: usize, num_members: usize, strip_size: u64, blocklen: u64) -> Self {
        let free = (0..capacity).map(|_| Arc::new(StripeState::new(num_members, strip_size, blocklen))).collect();
        Self { capacity, inner: Mutex::new(Inner { hash: HashMap::new(), active: VecDeque::new(), free }) }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Looks up `stripe_index`, binding a free (or reclaimed) slot on miss.
    /// Returns `None` if the cache is full and nothing could be reclaimed.
    /// The returned stripe's `ref_count` has been incremented by one; the
    /// caller must eventually call [`StripeState::release`].
    pub fn get(&self, stripe_index: u64) -> Option<Arc<StripeState>> {
        let mut inner = self.inner.lock();

        if let Some(stripe) = inner.hash.get(&stripe_index).cloned() {
            stripe.ref_count.fetch_add(1, Ordering::AcqRel);
            Self::move_to_front(&mut inner.active, &stripe);
            return Some(stripe);
        }

        if inner.free.is_empty() {
            self.reclaim_locked(&mut inner);
        }
        let stripe = inner.free.pop()?;
        stripe.rebind(stripe_index);
        stripe.ref_count.store(1, Ordering::Release);
        inner.hash.insert(stripe_index, Arc::clone(&stripe));
        inner.active.push_front(Arc::clone(&stripe));
        Some(stripe)
    }

    fn move_to_front(active: &mut VecDeque<Arc<StripeState>>, stripe: &Arc<StripeState>) {
        if let Some(pos) = active.iter().position(|s| Arc::ptr_eq(s, stripe)) {
            let s = active.remove(pos).expect("position just found");
            active.push_front(s);
        }
    }

    /// Walks `active` from the tail, reclaiming idle (`ref_count == 0`)
    /// stripes into `free` until the target count is met or the walk hits
    /// a stripe it can't evict.
    ///
    /// Target count: freeing down to 7/8 capacity when the hash is nearly
    /// full, at least one slot otherwise — `hash.len() - (capacity -
    /// capacity/8)`, floored at 1. A cache well below capacity only needs
    /// one reclaimed slot to satisfy the caller that triggered this walk.
    fn reclaim_locked(&self, inner: &mut Inner) {
        let target = inner.hash.len().saturating_sub(self.capacity - self.capacity / 8).max(1);
        let mut reclaimed = 0usize;
        let mut idx = inner.active.len();
        while reclaimed < target && idx > 0 {
            idx -= 1;
            if inner.active[idx].ref_count.load(Ordering::Acquire) != 0 {
                continue;
            }
            let stripe = inner.active.remove(idx).expect("index in bounds");
            inner.hash.remove(&stripe.stripe_index());
            inner.free.push(stripe);
            reclaimed += 1;
        }
    }

    #[must_use]
    pub fn active_len(&self) -> usize {
        self.inner.lock().active.len()
    }

    #[must_use]
    pub fn free_len(&self) -> usize {
        self.inner.lock().free.len()
    }
}
