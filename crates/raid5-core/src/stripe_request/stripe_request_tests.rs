use std::sync::Mutex as StdMutex;

use parking_lot::Mutex;

use super::*;
use crate::base_device::BaseBdev;
use crate::chunk::RequestType;

struct FakeMember {
    bytes: StdMutex<Vec<u8>>,
    degraded: bool,
}

impl FakeMember {
    fn new(len: usize) -> Self {
        Self { bytes: StdMutex::new(vec![0u8; len]), degraded: false }
    }

    fn degraded_at(len: usize) -> Self {
        Self { bytes: StdMutex::new(vec![0u8; len]), degraded: true }
    }
}

impl BaseBdev for FakeMember {
    fn degraded(&self) -> bool {
        self.degraded
    }

    fn readv_blocks(&self, dst: &mut [&mut [u8]], offset_blocks: u64, num_blocks: u64) -> RaidResult<()> {
        if self.degraded {
            return Err(RaidError::Failed);
        }
        let blocklen = 512;
        let off = offset_blocks as usize * blocklen;
        let len = num_blocks as usize * blocklen;
        let guard = self.bytes.lock().unwrap();
        let mut written = 0;
        for seg in dst.iter_mut() {
            let n = seg.len().min(len - written);
            seg[..n].copy_from_slice(&guard[off + written..off + written + n]);
            written += n;
        }
        Ok(())
    }

    fn writev_blocks(&self, src: &[&[u8]], offset_blocks: u64, num_blocks: u64) -> RaidResult<()> {
        if self.degraded {
            return Err(RaidError::Failed);
        }
        let blocklen = 512;
        let off = offset_blocks as usize * blocklen;
        let len = num_blocks as usize * blocklen;
        let mut guard = self.bytes.lock().unwrap();
        let mut written = 0;
        for seg in src.iter() {
            let n = seg.len().min(len - written);
            guard[off + written..off + written + n].copy_from_slice(&seg[..n]);
            written += n;
        }
        Ok(())
    }
}

fn geometry3() -> Geometry {
    Geometry::new(3, 1, 4, 512, 8).unwrap()
}

fn members3(member_blocks: u64) -> MemberSet {
    let len = (member_blocks * 512) as usize;
    MemberSet::new(vec![Box::new(FakeMember::new(len)), Box::new(FakeMember::new(len)), Box::new(FakeMember::new(len))])
}

fn scratch3(strip_blocks: u64) -> Vec<Mutex<Vec<u8>>> {
    (0..3).map(|_| Mutex::new(vec![0u8; (strip_blocks * 512) as usize])).collect()
}

#[test]
fn plan_chunks_full_stripe_touches_both_data_members_and_parity() {
    let g = geometry3();
    let plan = plan_chunks(&g, 0, 0, 8, RequestType::Write);
    assert_eq!(plan.parity_chunk, 2);
    assert_eq!(plan.chunks[0].req_blocks, 4);
    assert_eq!(plan.chunks[1].req_blocks, 4);
    assert_eq!(plan.chunks[2].req_blocks, 4);
    assert_eq!(plan.first_data_chunk, Some(0));
    assert_eq!(plan.last_data_chunk, Some(1));
}

#[test]
fn plan_chunks_single_block_touches_one_data_member_and_narrow_parity() {
    let g = geometry3();
    let plan = plan_chunks(&g, 0, 0, 1, RequestType::Write);
    assert_eq!(plan.chunks[0].req_blocks, 1);
    assert_eq!(plan.chunks[1].req_blocks, 0);
    assert_eq!(plan.chunks[2].req_offset, 0);
    assert_eq!(plan.chunks[2].req_blocks, 1);
}

#[test]
fn vote_prefers_rcw_on_full_stripe_write() {
    let g = geometry3();
    let plan = plan_chunks(&g, 0, 0, 8, RequestType::Write);
    assert_eq!(vote(&plan.chunks, plan.parity_chunk), WriteStrategy::Rcw);
}

#[test]
fn vote_ties_go_to_rcw_on_minimal_three_member_array() {
    // N=3 means a single-block write leaves exactly one untouched data
    // chunk, which balances the touched chunk's vote to zero.
    let g = geometry3();
    let plan = plan_chunks(&g, 0, 0, 1, RequestType::Write);
    assert_eq!(vote(&plan.chunks, plan.parity_chunk), WriteStrategy::Rcw);
}

#[test]
fn vote_prefers_rmw_on_narrow_write_to_a_wider_array() {
    // N=5 (D=4): three untouched chunks outvote the one touched chunk.
    let g = Geometry::new(5, 1, 4, 512, 8).unwrap();
    let plan = plan_chunks(&g, 0, 0, 1, RequestType::Write);
    assert_eq!(vote(&plan.chunks, plan.parity_chunk), WriteStrategy::Rmw);
}

#[test]
fn full_stripe_write_then_read_round_trips_with_correct_parity() {
    let g = geometry3();
    let members = members3(8);
    let scratch = scratch3(4);
    let mut plan = plan_chunks(&g, 0, 0, 8, RequestType::Write);
    let strategy = vote(&plan.chunks, plan.parity_chunk);

    let data0 = vec![0xAAu8; 2048];
    let data1 = vec![0xAAu8; 2048];
    let new_data: Vec<&[u8]> = vec![&data0, &data1, &[]];
    execute_write(&g, &members, 0, &scratch, &mut plan, strategy, &new_data).unwrap();

    let mut parity_buf = vec![0u8; 2048];
    {
        let mut dst: [&mut [u8]; 1] = [&mut parity_buf];
        members.get(2).readv_blocks(&mut dst, 0, 4).unwrap();
    }
    assert!(parity_buf.iter().all(|&b| b == 0), "XOR of two identical patterns must be zero");
}

#[test]
fn single_block_write_updates_only_touched_bytes_and_parity() {
    let g = geometry3();
    let members = members3(8);
    let scratch = scratch3(4);

    let full = plan_chunks(&g, 0, 0, 8, RequestType::Write).chunks;
    let full_strategy = vote(&full, 2);
    let mut full_plan = ChunkPlan { chunks: full, parity_chunk: 2, first_data_chunk: Some(0), last_data_chunk: Some(1) };
    let data0 = vec![0xAAu8; 2048];
    let data1 = vec![0xAAu8; 2048];
    execute_write(&g, &members, 0, &scratch, &mut full_plan, full_strategy, &[&data0, &data1, &[]]).unwrap();

    let mut plan = plan_chunks(&g, 0, 0, 1, RequestType::Write);
    let strategy = vote(&plan.chunks, plan.parity_chunk);
    assert_eq!(strategy, WriteStrategy::Rcw);
    let new_block0 = vec![0x11u8; 512];
    execute_write(&g, &members, 0, &scratch, &mut plan, strategy, &[&new_block0, &[], &[]]).unwrap();

    let mut block0 = vec![0u8; 512];
    {
        let mut dst: [&mut [u8]; 1] = [&mut block0];
        members.get(0).readv_blocks(&mut dst, 0, 1).unwrap();
    }
    assert_eq!(block0, vec![0x11u8; 512]);

    let mut parity0 = vec![0u8; 512];
    {
        let mut dst: [&mut [u8]; 1] = [&mut parity0];
        members.get(2).readv_blocks(&mut dst, 0, 1).unwrap();
    }
    // RCW: parity = old_D1 (untouched neighbor, 0xAA) ^ new_D0 (0x11)
    assert_eq!(parity0, vec![0xAAu8 ^ 0x11u8; 512]);
}

#[test]
fn degraded_read_reconstructs_missing_member_from_data_and_parity() {
    let g = geometry3();
    let members = MemberSet::new(vec![
        Box::new(FakeMember::new(8 * 512)),
        Box::new(FakeMember::degraded_at(8 * 512)),
        Box::new(FakeMember::new(8 * 512)),
    ]);
    let data0 = vec![0x11u8; 2048];
    let data1 = vec![0xBBu8; 2048];

    // member1 is degraded and can't be written to directly; seed member0
    // and parity as if member1 already held `data1`: member0 = data0,
    // parity = data0 XOR data1.
    let mut parity = vec![0u8; 2048];
    for i in 0..2048 {
        parity[i] = data0[i] ^ data1[i];
    }
    {
        let src0: [&[u8]; 1] = [&data0];
        members.get(0).writev_blocks(&src0, 0, 4).unwrap();
    }
    {
        let srcp: [&[u8]; 1] = [&parity];
        members.get(2).writev_blocks(&srcp, 0, 4).unwrap();
    }

    let read_plan = plan_chunks(&g, 0, 0, 8, RequestType::Read);
    let mut dest0 = vec![0u8; 2048];
    let mut dest1 = vec![0u8; 2048];
    let mut dest2 = vec![0u8; 0];
    {
        let mut dest: [&mut [u8]; 3] = [&mut dest0, &mut dest1, &mut dest2];
        let blocks = execute_degraded_read(&g, &members, 0, &read_plan, 1, &mut dest).unwrap();
        assert_eq!(blocks, 4);
    }
    assert_eq!(dest1, data1);
}

#[test]
fn check_degraded_fails_when_more_than_one_member_down() {
    let members = MemberSet::new(vec![Box::new(FakeMember::degraded_at(512)), Box::new(FakeMember::degraded_at(512)), Box::new(FakeMember::new(512))]);
    assert_eq!(check_degraded(&members), Err(RaidError::Failed));
}

#[test]
fn check_degraded_reports_the_sole_offending_member() {
    let members = MemberSet::new(vec![Box::new(FakeMember::new(512)), Box::new(FakeMember::degraded_at(512)), Box::new(FakeMember::new(512))]);
    assert_eq!(check_degraded(&members), Ok(Some(1)));
}
