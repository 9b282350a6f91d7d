//! File-descriptor-index table (spec.md §6 "File descriptor table").
//!
//! "Exposed file and socket handles store an integer 'fd index'... Both
//! rings share the same indexing." User code never sees a raw `fd`; it
//! gets an `FdIndex` that both the non-write and write ring's
//! `register_files_update` agree on, so a single registration call keeps
//! both rings' fixed-file tables in sync.

use rex_core::error::{RexError, SchedResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FdIndex(u32);

impl FdIndex {
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Fixed-size slot table mapping [`FdIndex`] to a raw fd, sized to the
/// process `RLIMIT_NOFILE` soft limit (raised toward 4096 at construction,
/// spec.md §6).
pub struct FdTable {
    slots: Vec<Option<i32>>,
    free: Vec<u32>,
}

impl FdTable {
    pub fn new() -> SchedResult<Self> {
        let capacity = raise_and_read_nofile_limit()?;
        Ok(FdTable {
            slots: vec![None; capacity],
            free: (0..capacity as u32).rev().collect(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Reserve a slot for `raw_fd`, returning the index both rings should
    /// register it under via `register_files_update`.
    pub fn insert(&mut self, raw_fd: i32) -> SchedResult<FdIndex> {
        let idx = self
            .free
            .pop()
            .ok_or(RexError::Construction("fd index table exhausted"))?;
        self.slots[idx as usize] = Some(raw_fd);
        Ok(FdIndex(idx))
    }

    pub fn get(&self, index: FdIndex) -> Option<i32> {
        self.slots.get(index.as_usize()).copied().flatten()
    }

    /// Release a slot, returning the raw fd it held so the caller can
    /// close it and issue the matching `register_files_update(-1)`.
    pub fn remove(&mut self, index: FdIndex) -> Option<i32> {
        let slot = self.slots.get_mut(index.as_usize())?;
        let raw = slot.take()?;
        self.free.push(index.as_u32());
        Some(raw)
    }
}

fn raise_and_read_nofile_limit() -> SchedResult<usize> {
    const TARGET: u64 = 4096;
    unsafe {
        let mut lim = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) != 0 {
            return Err(RexError::Construction("getrlimit(RLIMIT_NOFILE) failed"));
        }
        if lim.rlim_cur < TARGET {
            let want = TARGET.min(lim.rlim_max);
            let raised = libc::rlimit { rlim_cur: want, rlim_max: lim.rlim_max };
            // Best-effort: an unprivileged process may not be able to
            // raise past rlim_max; fall back to whatever is already set.
            if libc::setrlimit(libc::RLIMIT_NOFILE, &raised) == 0 {
                lim.rlim_cur = want;
            }
        }
        Ok(lim.rlim_cur as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_remove_roundtrip() {
        let mut table = FdTable::new().expect("fd table");
        let idx = table.insert(42).expect("slot");
        assert_eq!(table.get(idx), Some(42));
        assert_eq!(table.remove(idx), Some(42));
        assert_eq!(table.get(idx), None);
    }

    #[test]
    fn capacity_is_at_least_the_soft_limit() {
        let table = FdTable::new().expect("fd table");
        assert!(table.capacity() >= 256);
    }
}
