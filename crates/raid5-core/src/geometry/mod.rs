//! Immutable logical geometry: member count, strip size, parity placement.
//!
//! Everything here is fixed once the array starts; nothing in this module
//! allocates or touches a base device.

use crate::error::RaidError;


/// Logical geometry of a RAID-5 (or, with `parity_count` generalized,
/// RAID-N) array. `parity_count` is factored out as a field rather than
/// hardcoded to one so a future RAID-6 layout can reuse this type.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    /// Total member (base device) count, N.
    pub num_members: usize,
    /// Parity members per stripe. RAID-5 uses 1.
    pub parity_count: usize,
    /// Contiguous run of blocks per member per stripe. Must be a power of two.
    pub strip_size: u64,
    pub strip_size_shift: u32,
    /// Block size in bytes. Must be a power of two.
    pub blocklen: u64,
    pub blocklen_shift: u32,
    /// Data members per stripe, `D = N - parity_count`.
    pub data_members: usize,
    /// Logical blocks per stripe, `D * strip_size`.
    pub stripe_blocks: u64,
    /// Number of stripes the array exposes.
    pub total_stripes: u64,
}

impl Geometry {
    /// Builds a geometry from the member count, strip size, block size and
    /// the smallest member's block count.
    ///
    /// # Errors
    /// Returns [`RaidError::InvalidInput`] if there are fewer than 3
    /// members, more parity members than data members, or either
    /// `strip_size` or `blocklen` is not a power of two.
    pub fn new(
        num_members: usize,
        parity_count: usize,
        strip_size: u64,
        blocklen: u64,
        min_member_blockcnt: u64,
    ) -> Result<Self, RaidError> {
        if num_members < 3 {
            return Err(RaidError::InvalidInput);
        }
        if parity_count == 0 || parity_count >= num_members {
            return Err(RaidError::InvalidInput);
        }
        if strip_size == 0 || !strip_size.is_power_of_two() {
            return Err(RaidError::InvalidInput);
        }
        if blocklen == 0 || !blocklen.is_power_of_two() {
            return Err(RaidError::InvalidInput);
        }

        let data_members = num_members - parity_count;
        let stripe_blocks = data_members as u64 * strip_size;
        let total_stripes = min_member_blockcnt / strip_size;

        Ok(Self {
            num_members,
            parity_count,
            strip_size,
            strip_size_shift: strip_size.trailing_zeros(),
            blocklen,
            blocklen_shift: blocklen.trailing_zeros(),
            data_members,
            stripe_blocks,
            total_stripes,
        })
    }

    /// Logical size of the array, in blocks.
    #[must_use]
    pub fn logical_blocks(&self) -> u64 {
        self.stripe_blocks * self.total_stripes
    }

    /// The member index holding stripe `s`'s (sole, for RAID-5) parity strip.
    ///
    /// `P(s) = D - (s mod N)`, the rotating left-symmetric placement this
    /// engine uses (see the crate's design notes for why this differs
    /// cosmetically, but not in effect, from the textbook
    /// `N - 1 - (s mod N))` form).
    #[must_use]
    pub fn parity_member(&self, stripe_index: u64) -> usize {
        self.data_members - (stripe_index % self.num_members as u64) as usize
    }

    /// Maps a data index `k` in `[0, D)` to its member index within stripe `s`.
    #[must_use]
    pub fn member_for_data_index(&self, stripe_index: u64, data_index: usize) -> usize {
        let p = self.parity_member(stripe_index);
        if data_index < p { data_index } else { data_index + 1 }
    }

    /// Inverse of [`Self::member_for_data_index`]: the data index for a
    /// non-parity member index within stripe `s`.
    #[must_use]
    pub fn data_index_for_member(&self, stripe_index: u64, member_index: usize) -> usize {
        let p = self.parity_member(stripe_index);
        if member_index < p { member_index } else { member_index - 1 }
    }

    /// Byte offset of a block offset for one member.
    #[must_use]
    pub fn bytes(&self, blocks: u64) -> usize {
        (blocks << self.blocklen_shift) as usize
    }
}
