//! Fake [`BaseBdev`] members shared by the integration test binaries: a
//! plain in-memory one, and an mmap-backed one grounded in this corpus's
//! `Disk` type (file-backed `MmapMut`, `read_at`/`write_at` returning the
//! bytes actually moved).
#![allow(dead_code)]

use parking_lot::Mutex;
use raid5_core::{BaseBdev, RaidError, RaidResult};

pub struct MemMember {
    bytes: Mutex<Vec<u8>>,
    degraded: bool,
}

impl MemMember {
    pub fn new(len: usize) -> Self {
        Self { bytes: Mutex::new(vec![0u8; len]), degraded: false }
    }

    pub fn degraded_at(len: usize) -> Self {
        Self { bytes: Mutex::new(vec![0u8; len]), degraded: true }
    }

    /// Overwrites this member's on-disk contents directly, bypassing the
    /// RAID layer entirely. Used to seed a rebuilt array with known bytes
    /// before reading it back in degraded mode.
    pub fn seed(&self, bytes: Vec<u8>) {
        *self.bytes.lock() = bytes;
    }
}

impl BaseBdev for MemMember {
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
        let guard = self.bytes.lock();
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
        let mut guard = self.bytes.lock();
        let mut written = 0;
        for seg in src.iter() {
            let n = seg.len().min(len - written);
            guard[off + written..off + written + n].copy_from_slice(&seg[..n]);
            written += n;
        }
        Ok(())
    }
}

pub struct MmapMember {
    disk: Mutex<memmap2::MmapMut>,
    degraded: bool,
}

impl MmapMember {
    pub fn open(dir: &tempfile::TempDir, name: &str, len: u64) -> Self {
        let path = dir.path().join(name);
        let file = std::fs::OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path).unwrap();
        file.set_len(len).unwrap();
        let map = unsafe { memmap2::MmapOptions::new().len(len as usize).map_mut(&file).unwrap() };
        Self { disk: Mutex::new(map), degraded: false }
    }

    pub fn degraded(dir: &tempfile::TempDir, name: &str, len: u64) -> Self {
        let mut m = Self::open(dir, name, len);
        m.degraded = true;
        m
    }
}

impl BaseBdev for MmapMember {
    fn degraded(&self) -> bool {
        self.degraded
    }

    fn readv_blocks(&self, dst: &mut [&mut [u8]], offset_blocks: u64, num_blocks: u64) -> RaidResult<()> {
        if self.degraded {
            return Err(RaidError::Failed);
        }
        let blocklen = 512u64;
        let off = (offset_blocks * blocklen) as usize;
        let len = (num_blocks * blocklen) as usize;
        let map = self.disk.lock();
        let src = &map[off..off + len];
        let mut written = 0;
        for seg in dst.iter_mut() {
            let n = seg.len().min(len - written);
            seg[..n].copy_from_slice(&src[written..written + n]);
            written += n;
        }
        Ok(())
    }

    fn writev_blocks(&self, src: &[&[u8]], offset_blocks: u64, num_blocks: u64) -> RaidResult<()> {
        if self.degraded {
            return Err(RaidError::Failed);
        }
        let blocklen = 512u64;
        let off = (offset_blocks * blocklen) as usize;
        let len = (num_blocks * blocklen) as usize;
        let mut map = self.disk.lock();
        let mut written = 0;
        for seg in src.iter() {
            let n = seg.len().min(len - written);
            map[off + written..off + written + n].copy_from_slice(&seg[..n]);
            written += n;
        }
        Ok(())
    }
}
