//! Entry point that splits an incoming logical I/O at strip boundaries,
//! acquires a stripe, serializes it against that stripe's queue, and runs
//! it to completion.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::base_device::MemberSet;
use crate::cache::StripeCache;
use crate::channel::Channel;
use crate::chunk::RequestType;
use crate::error::{RaidError, RaidResult};
use crate::geometry::Geometry;
use crate::metrics::{self, IoOpType, RaidOp};
use crate::stripe_request::{self, ChunkPlan, StripeRequest};

/// Submits one logical I/O. `data` holds the new bytes to write (ignored,
/// may be empty, for reads); the return value holds the bytes read (empty
/// for writes).
///
/// Computes `stripe_index`/`stripe_offset` from `offset_blocks`, acquires
/// the stripe from `cache`, and hands off to [`handle_stripe`]. A
/// cache miss with nothing reclaimable queues `data` on `channel`'s retry
/// queue and returns [`RaidError::NoMem`] — the queued closure re-invokes
/// `submit_rw` the next time something calls [`Channel::pop_retry`].
///
/// # Errors
/// [`RaidError::InvalidInput`] if `data`'s length doesn't match
/// `num_blocks * blocklen` on a write (the caller-side mapping failure
/// `spec.md` §4.2/§7 describe, normally unreachable given correct upstream
/// splitting); [`RaidError::NoMem`] on stripe-pool exhaustion;
/// [`RaidError::Failed`] on a base-device I/O failure or more than one
/// degraded member; propagates whatever the member devices return
/// otherwise.
pub fn submit_rw(
    geometry: Geometry,
    members: &Arc<MemberSet>,
    cache: &Arc<StripeCache>,
    channel: &Arc<Channel>,
    offset_blocks: u64,
    num_blocks: u64,
    request_type: RequestType,
    data: Vec<u8>,
) -> RaidResult<Vec<u8>> {
    if request_type == RequestType::Write && data.len() as u64 != num_blocks * geometry.blocklen {
        return Err(RaidError::InvalidInput);
    }

    let stripe_index = offset_blocks / geometry.stripe_blocks;
    let stripe_offset = offset_blocks % geometry.stripe_blocks;

    let Some(stripe) = cache.get(stripe_index) else {
        warn!(stripe_index, "stripe cache exhausted, queuing retry");
        let geometry = geometry;
        let members = Arc::clone(members);
        let cache = Arc::clone(cache);
        let channel = Arc::clone(channel);
        channel.push_retry(Box::new(move || {
            let _ = submit_rw(geometry, &members, &cache, &channel, offset_blocks, num_blocks, request_type, data);
        }));
        return Err(RaidError::NoMem);
    };

    let started = Instant::now();
    let result = handle_stripe(&geometry, members, &stripe, stripe_index, stripe_offset, num_blocks, request_type, data);

    stripe.release();
    if let Some(retry) = channel.pop_retry() {
        retry();
    }

    if metrics::is_enabled() {
        let op = match request_type {
            RequestType::Write => IoOpType::Write,
            RequestType::Read | RequestType::Preread => IoOpType::Read,
        };
        let bytes = num_blocks * geometry.blocklen;
        metrics::record_raid_op(RaidOp { op, bytes, latency_seconds: started.elapsed().as_secs_f64(), error: result.is_err() });
    }
    debug!(stripe_index, stripe_offset, num_blocks, ?request_type, ok = result.is_ok(), "submit_rw complete");

    result
}

/// Splits a write that would straddle a strip boundary into two
/// sub-requests (the parity window must stay contiguous within one
/// strip), then plans, queues and executes against the member devices.
fn handle_stripe(
    geometry: &Geometry,
    members: &Arc<MemberSet>,
    stripe: &Arc<crate::stripe_state::StripeState>,
    stripe_index: u64,
    stripe_offset: u64,
    blocks: u64,
    request_type: RequestType,
    data: Vec<u8>,
) -> RaidResult<Vec<u8>> {
    let strip_off = stripe_offset % geometry.strip_size;
    if request_type == RequestType::Write && strip_off + blocks > geometry.strip_size {
        let blocklen = geometry.blocklen as usize;
        let first_blocks = geometry.strip_size - strip_off;
        let first_len = (first_blocks as usize) * blocklen;
        let (first_data, rest_data) = data.split_at(first_len.min(data.len()));

        handle_stripe(geometry, members, stripe, stripe_index, stripe_offset, first_blocks, request_type, first_data.to_vec())?;
        return handle_stripe(geometry, members, stripe, stripe_index, stripe_offset + first_blocks, blocks - first_blocks, request_type, rest_data.to_vec());
    }

    let req = StripeRequest::new(stripe_index, stripe_offset, blocks, request_type);
    let was_front = stripe.enqueue(Arc::clone(&req));
    if was_front {
        req.signal_ready();
    }
    req.wait_for_turn();

    let result = execute_one(geometry, members, stripe, stripe_index, stripe_offset, blocks, request_type, &data);

    if let Some(next) = stripe.complete_and_advance(&req) {
        next.signal_ready();
    }

    result
}

/// Plans and runs a single (already dequeued) stripe request against the
/// member devices; does not touch the stripe's queue.
fn execute_one(
    geometry: &Geometry,
    members: &Arc<MemberSet>,
    stripe: &Arc<crate::stripe_state::StripeState>,
    stripe_index: u64,
    stripe_offset: u64,
    blocks: u64,
    request_type: RequestType,
    data: &[u8],
) -> RaidResult<Vec<u8>> {
    let degraded = stripe_request::check_degraded(members)?;
    if let Some(d) = degraded {
        debug!(stripe_index, degraded_member = d, "running in degraded mode");
    }
    let mut plan: ChunkPlan = stripe_request::plan_chunks(geometry, stripe_index, stripe_offset, blocks, request_type);
    // Every member addresses the same stripe at the same physical block:
    // `stripe_index * strip_size` is member-independent, not `member *
    // strip_size` — each member's device holds one strip per stripe, back
    // to back, regardless of which member it is.
    let stripe_base_block = stripe_index * geometry.strip_size;
    let blocklen = geometry.blocklen as usize;

    match request_type {
        RequestType::Write => {
            let per_member = split_write_data_by_member(geometry, stripe_index, stripe_offset, &plan, data, blocklen);
            let refs: Vec<&[u8]> = per_member.iter().map(Vec::as_slice).collect();
            match degraded {
                Some(d) => {
                    stripe_request::execute_degraded_write(geometry, members, stripe_base_block, &stripe.scratch, &plan, d, &refs)?;
                }
                None => {
                    let strategy = stripe_request::vote(&plan.chunks, plan.parity_chunk);
                    stripe_request::execute_write(geometry, members, stripe_base_block, &stripe.scratch, &mut plan, strategy, &refs)?;
                }
            }
            Ok(Vec::new())
        }
        RequestType::Read | RequestType::Preread => {
            let total_len = (blocks as usize) * blocklen;
            let mut dest_storage: Vec<Vec<u8>> = (0..geometry.num_members).map(|_| Vec::new()).collect();
            for (member, chunk) in plan.chunks.iter().enumerate() {
                if chunk.req_blocks > 0 {
                    dest_storage[member] = vec![0u8; chunk.req_blocks as usize * blocklen];
                }
            }
            {
                let mut dest: Vec<&mut [u8]> = dest_storage.iter_mut().map(Vec::as_mut_slice).collect();
                match degraded {
                    Some(d) if d != plan.parity_chunk && plan.chunks[d].req_blocks > 0 => {
                        stripe_request::execute_degraded_read(geometry, members, stripe_base_block, &plan, d, &mut dest)?;
                    }
                    _ => {
                        stripe_request::execute_read(geometry, members, stripe_base_block, &plan, &mut dest)?;
                    }
                }
            }
            let mut out = vec![0u8; total_len];
            for (member, chunk) in plan.chunks.iter().enumerate() {
                if chunk.req_blocks == 0 || member == plan.parity_chunk {
                    continue;
                }
                let data_index = geometry.data_index_for_member(stripe_index, member);
                let abs_start = data_index as u64 * geometry.strip_size + chunk.req_offset;
                let out_off = (abs_start - stripe_offset) as usize * blocklen;
                let len = chunk.req_blocks as usize * blocklen;
                out[out_off..out_off + len].copy_from_slice(&dest_storage[member]);
            }
            Ok(out)
        }
    }
}

/// Slices a flat, logically-ordered `data` buffer (as supplied to
/// [`submit_rw`]) into one contiguous piece per touched member, indexed
/// by member index so it lines up with `plan.chunks`.
fn split_write_data_by_member(geometry: &Geometry, stripe_index: u64, stripe_offset: u64, plan: &ChunkPlan, data: &[u8], blocklen: usize) -> Vec<Vec<u8>> {
    let mut out: Vec<Vec<u8>> = (0..geometry.num_members).map(|_| Vec::new()).collect();
    for (member, chunk) in plan.chunks.iter().enumerate() {
        if chunk.req_blocks == 0 || member == plan.parity_chunk {
            continue;
        }
        let data_index = geometry.data_index_for_member(stripe_index, member);
        let abs_start = data_index as u64 * geometry.strip_size + chunk.req_offset;
        let data_off = (abs_start - stripe_offset) as usize * blocklen;
        let len = chunk.req_blocks as usize * blocklen;
        out[member] = data[data_off..data_off + len].to_vec();
    }
    out
}
