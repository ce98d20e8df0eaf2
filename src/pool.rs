//! # Receive Pool
//!
//! Per-connection shared-memory region that holds every delivered message
//! until the consumer releases it. The segment is created with a stable
//! os id so the owning process can map it; delivery copies message bytes
//! into reserved slices through the raw mapping.
//!
//! ## Discipline
//!
//! - `reserve` hands out non-overlapping, 8-aligned offsets; a slice stays
//!   valid and immobile until `release`.
//! - `release` accepts each reserved offset exactly once; anything else is
//!   rejected as invalid.
//! - The allocator lock is a leaf: nothing else is ever locked under it.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use shared_memory::{Shmem, ShmemConf};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::utils::{align8, page_size};

struct PoolState {
    /// Live reservations, offset -> reserved length (8-aligned).
    allocs: BTreeMap<usize, usize>,
}

/// Shared receive buffer of one connection.
pub struct Pool {
    shmem: Shmem,
    size: usize,
    os_id: String,
    state: Mutex<PoolState>,
}

// The raw mapping is only dereferenced inside this module, always within a
// reservation owned by the calling thread or under the allocator lock.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// Create and map the backing segment. `size` must be a non-zero
    /// multiple of the page size.
    pub fn new(os_id: &str, size: usize) -> Result<Self> {
        if size == 0 || size % page_size() != 0 {
            return Err(Error::Invalid("pool size must be a non-zero page multiple"));
        }
        let shmem = ShmemConf::new()
            .size(size)
            .os_id(os_id)
            .create()
            .map_err(|e| Error::Resource(e.to_string()))?;
        debug!(os_id, size, "created receive pool segment");
        Ok(Self {
            shmem,
            size,
            os_id: os_id.to_string(),
            state: Mutex::new(PoolState {
                allocs: BTreeMap::new(),
            }),
        })
    }

    /// Total mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// System-wide segment identifier, usable by the owning process to map
    /// the pool into its own address space.
    pub fn os_id(&self) -> &str {
        &self.os_id
    }

    /// Reserve a slice for one delivery. Returns the offset of the slice;
    /// fails with `QuotaExceeded` when no gap is large enough.
    pub(crate) fn reserve(&self, size: usize) -> Result<usize> {
        if size == 0 {
            return Err(Error::Invalid("zero-sized pool reservation"));
        }
        let need = align8(size);
        let mut state = self.state.lock();
        let mut cursor = 0usize;
        let mut found = None;
        for (&off, &len) in state.allocs.iter() {
            if off - cursor >= need {
                found = Some(cursor);
                break;
            }
            cursor = off + len;
        }
        let offset = match found {
            Some(off) => off,
            None if self.size - cursor >= need => cursor,
            None => {
                trace!(need, "pool exhausted");
                return Err(Error::QuotaExceeded);
            }
        };
        state.allocs.insert(offset, need);
        Ok(offset)
    }

    /// Release a previously reserved offset. Each offset is accepted once.
    pub(crate) fn release(&self, offset: usize) -> Result<()> {
        let mut state = self.state.lock();
        state
            .allocs
            .remove(&offset)
            .map(|_| ())
            .ok_or(Error::Invalid("unknown pool offset"))
    }

    /// Copy `bytes` into a reservation at relative position `pos`.
    pub(crate) fn write(&self, offset: usize, pos: usize, bytes: &[u8]) -> Result<()> {
        let state = self.state.lock();
        let len = *state
            .allocs
            .get(&offset)
            .ok_or(Error::Invalid("write outside any pool reservation"))?;
        if pos + bytes.len() > len {
            return Err(Error::Invalid("write overruns its pool reservation"));
        }
        unsafe {
            let dst = self.shmem.as_ptr().add(offset + pos);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
        Ok(())
    }

    /// Copy `len` bytes out of a reservation, for consumers that do not map
    /// the segment themselves.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let reserved = *state
            .allocs
            .get(&offset)
            .ok_or(Error::Invalid("unknown pool offset"))?;
        if len > reserved {
            return Err(Error::Invalid("read overruns its pool reservation"));
        }
        let mut out = vec![0u8; len];
        unsafe {
            let src = self.shmem.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    /// Number of live reservations; used by teardown diagnostics.
    pub fn outstanding(&self) -> usize {
        self.state.lock().allocs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_pool(pages: usize) -> Pool {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let id = format!(
            "capbus_test_{}_{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        );
        Pool::new(&id, pages * page_size()).unwrap()
    }

    #[test]
    fn unaligned_pool_size_is_rejected() {
        assert!(matches!(
            Pool::new("capbus_test_bad", page_size() + 1),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn reserve_write_read_release() {
        let pool = test_pool(1);
        let off = pool.reserve(100).unwrap();
        pool.write(off, 0, b"hello").unwrap();
        pool.write(off, 5, b" pool").unwrap();
        assert_eq!(pool.read(off, 10).unwrap(), b"hello pool");
        pool.release(off).unwrap();
    }

    #[test]
    fn release_accepts_each_offset_exactly_once() {
        let pool = test_pool(1);
        let off = pool.reserve(64).unwrap();
        pool.release(off).unwrap();
        assert!(matches!(pool.release(off), Err(Error::Invalid(_))));
        assert!(matches!(pool.release(0x12345), Err(Error::Invalid(_))));
    }

    #[test]
    fn exhaustion_reports_quota() {
        let pool = test_pool(1);
        let _a = pool.reserve(page_size() - 8).unwrap();
        assert!(matches!(pool.reserve(64), Err(Error::QuotaExceeded)));
    }

    #[test]
    fn reservations_never_overlap() {
        let pool = test_pool(4);
        let mut rng = rand::thread_rng();
        let mut live: Vec<(usize, usize)> = Vec::new();
        for _ in 0..200 {
            if !live.is_empty() && rng.gen_bool(0.4) {
                let (off, _) = live.swap_remove(rng.gen_range(0..live.len()));
                pool.release(off).unwrap();
                continue;
            }
            let want = rng.gen_range(1..512);
            if let Ok(off) = pool.reserve(want) {
                let end = off + align8(want);
                for &(o, l) in &live {
                    assert!(end <= o || off >= o + l, "overlap at {off}");
                }
                live.push((off, align8(want)));
            }
        }
        for (off, _) in live {
            pool.release(off).unwrap();
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn freed_space_is_reusable() {
        let pool = test_pool(1);
        let a = pool.reserve(page_size() / 2).unwrap();
        let b = pool.reserve(page_size() / 4).unwrap();
        pool.release(a).unwrap();
        // the freed front gap fits a new reservation of the same size
        let c = pool.reserve(page_size() / 2).unwrap();
        assert_eq!(c, 0);
        pool.release(b).unwrap();
        pool.release(c).unwrap();
    }
}
