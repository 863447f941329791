//! RAID-5 stripe I/O engine: striping, rotating parity and degraded-mode
//! reconstruction above N block-device members.
//!
//! This crate implements only the core described in its design notes: chunk
//! planning, the RMW/RCW vote, parity computation, degraded-mode
//! reconstruction, the bounded stripe cache, and per-stripe FIFO
//! serialization. The enclosing framework (base-device discovery, CLI/RPC,
//! the base block-device layer itself) is out of scope; [`BaseBdev`] is the
//! trait boundary a caller implements to plug one in.

pub mod base_device;
pub mod cache;
pub mod channel;
pub mod chunk;
pub mod dispatcher;
pub mod error;
pub mod geometry;
pub mod iov;
pub mod metrics;
pub mod stripe_request;
pub mod stripe_state;

use std::sync::Arc;

pub use base_device::{BaseBdev, MemberSet};
pub use cache::StripeCache;
pub use channel::Channel;
pub use chunk::RequestType;
pub use error::{RaidError, RaidResult};
pub use geometry::Geometry;

use tracing::info;

/// Default number of stripe slots kept resident per array, mirroring this
/// corpus's convention of a generous fixed pool sized for sequential
/// workloads rather than grown on demand.
pub const DEFAULT_STRIPE_CACHE_CAPACITY: usize = 1024;

/// Module descriptor and lifecycle hooks for a RAID-5 logical device built
/// from `N` member devices.
///
/// Owns the immutable [`Geometry`], the member set, the bounded stripe
/// cache, and one [`Channel`] per caller-visible I/O channel. Construction
/// performs the `spec`'s `start` hook inline (there is no separate
/// asynchronous `start`/`stop` pair in this synchronous re-rendering); a
/// [`RaidBdev`] is ready for I/O as soon as [`RaidBdev::new`] returns.
pub struct RaidBdev {
    geometry: Geometry,
    members: Arc<MemberSet>,
    cache: Arc<StripeCache>,
}

impl RaidBdev {
    pub const LEVEL: &'static str = "raid5";
    pub const BASE_BDEVS_MIN: usize = 3;
    pub const BASE_BDEVS_MAX_DEGRADED: usize = 1;

    /// Builds the array geometry from `members` and starts it:
    /// `base_bdevs_min`/`base_bdevs_max_degraded` are enforced here, not
    /// left to the caller.
    ///
    /// # Errors
    /// [`RaidError::InvalidInput`] if fewer than [`Self::BASE_BDEVS_MIN`]
    /// members are given, if more than [`Self::BASE_BDEVS_MAX_DEGRADED`]
    /// start out degraded, or if `strip_size`/`blocklen` are not powers of
    /// two.
    pub fn new(members: Vec<Box<dyn BaseBdev>>, strip_size: u64, blocklen: u64, min_member_blockcnt: u64, cache_capacity: usize) -> RaidResult<Self> {
        if members.len() < Self::BASE_BDEVS_MIN {
            return Err(RaidError::InvalidInput);
        }
        let member_set = MemberSet::new(members);
        if member_set.degraded_count() > Self::BASE_BDEVS_MAX_DEGRADED {
            return Err(RaidError::InvalidInput);
        }
        let geometry = Geometry::new(member_set.len(), 1, strip_size, blocklen, min_member_blockcnt)?;
        info!(
            num_members = geometry.num_members,
            strip_size = geometry.strip_size,
            blocklen = geometry.blocklen,
            total_stripes = geometry.total_stripes,
            "raid5 array started"
        );
        Ok(Self {
            geometry,
            members: Arc::new(member_set),
            cache: Arc::new(StripeCache::new(cache_capacity, geometry.num_members, geometry.strip_size, geometry.blocklen)),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Logical size of the array, in blocks. The optimal I/O boundary a
    /// caller should split requests on is `geometry().stripe_blocks`.
    #[must_use]
    pub fn logical_blocks(&self) -> u64 {
        self.geometry.logical_blocks()
    }

    /// Allocates an I/O channel: one [`Channel`] with its own retry queue
    /// and fast-path buffer pool. Callers issuing I/O from multiple threads
    /// should allocate one channel per thread, the way the framework this
    /// crate's trait boundary stands in for allocates one per reactor.
    #[must_use]
    pub fn io_channel_resource_init(&self, iov_pool_capacity: usize) -> Arc<Channel> {
        Arc::new(Channel::new(iov_pool_capacity))
    }

    /// Tears down a channel: asserts its retry queue is empty.
    pub fn io_channel_resource_deinit(&self, channel: &Channel) {
        channel.deinit();
    }

    /// Submits one logical read or write. `data` carries the new bytes for
    /// a write (ignored for reads); the returned buffer holds the bytes
    /// read (empty for writes).
    ///
    /// # Errors
    /// See [`dispatcher::submit_rw`].
    pub fn submit_rw_request(&self, channel: &Arc<Channel>, offset_blocks: u64, num_blocks: u64, request_type: RequestType, data: Vec<u8>) -> RaidResult<Vec<u8>> {
        dispatcher::submit_rw(self.geometry, &self.members, &self.cache, channel, offset_blocks, num_blocks, request_type, data)
    }

    #[must_use]
    pub fn members(&self) -> &MemberSet {
        &self.members
    }

    #[must_use]
    pub fn cache(&self) -> &StripeCache {
        &self.cache
    }
}
