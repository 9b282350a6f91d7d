//! Registered I/O buffer pool (spec.md §4.5, §6 "Buffer descriptor").
//!
//! Each ring (non-write, write) owns one [`BufferPool`] with two size
//! classes — *small* (page multiples, `MAP_ANONYMOUS`) and *large*
//! (huge-page multiples) — each a [`Bucket`] of pre-registered,
//! page-aligned slots. A subset of the non-write ring's small bucket is
//! additionally registered as a kernel-selected ("provided") buffer ring:
//! io_uring itself picks a free slot for reads that ask for one, signalled
//! via the CQE's buffer-selected flag rather than the caller pre-choosing
//! an index.
//!
//! This module owns only the free-list/waiter-list bookkeeping and the
//! backing memory. The FIFO-under-priority-boost reinsertion into an
//! executor's `suspended_completed` list (spec.md §4.5 release protocol)
//! needs the executor's task arena and lives on `Executor::release_buffer`
//! in `executor.rs`; [`Bucket::release`] here only tells the caller *which*
//! task (if any) was waiting so the executor can place it correctly.

use rex_core::error::{RexError, SchedResult};
use rex_core::id::TaskId;
use std::collections::VecDeque;

/// A page-aligned backing region sliced into fixed-size slots.
struct SlotArena {
    base: *mut u8,
    total_len: usize,
    slot_len: usize,
    count: usize,
}

unsafe impl Send for SlotArena {}

impl SlotArena {
    fn new(slot_len: usize, count: usize, huge: bool) -> SchedResult<Self> {
        let total_len = slot_len * count;
        if total_len == 0 {
            // An empty bucket (e.g. a ring with no large-page buffers
            // configured) needs no backing memory at all; `mmap(..., 0,
            // ...)` is `EINVAL` on Linux, so skip the syscall entirely.
            return Ok(SlotArena {
                base: std::ptr::NonNull::dangling().as_ptr(),
                total_len: 0,
                slot_len,
                count: 0,
            });
        }
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if huge {
            flags |= libc::MAP_HUGETLB;
        }
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            if huge {
                // Huge pages are frequently unavailable in CI/dev
                // environments; fall back to ordinary anonymous pages
                // rather than failing executor construction outright.
                return Self::new(slot_len, count, false);
            }
            return Err(RexError::Construction("buffer pool mmap failed"));
        }
        Ok(SlotArena {
            base: base as *mut u8,
            total_len,
            slot_len,
            count,
        })
    }

    #[inline]
    fn slot_ptr(&self, index: u32) -> *mut u8 {
        unsafe { self.base.add(index as usize * self.slot_len) }
    }

    #[inline]
    fn iov(&self, index: u32) -> libc::iovec {
        libc::iovec {
            iov_base: self.slot_ptr(index) as *mut libc::c_void,
            iov_len: self.slot_len,
        }
    }

    fn iovecs(&self) -> Vec<libc::iovec> {
        (0..self.count as u32).map(|i| self.iov(i)).collect()
    }
}

impl Drop for SlotArena {
    fn drop(&mut self) {
        if self.total_len == 0 {
            return;
        }
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total_len);
        }
    }
}

/// One size class's free list and FIFO waiter queue (spec.md §4.5: "Each
/// bucket has a free list of buffer slots and a FIFO wait list of tasks
/// that asked for a buffer when the bucket was empty").
pub struct Bucket {
    arena: SlotArena,
    free: Vec<u32>,
    waiters: VecDeque<TaskId>,
}

/// Outcome of [`Bucket::claim`].
pub enum ClaimOutcome {
    /// A slot was free; here it is.
    Granted(u32),
    /// No free slot; the caller was enqueued as a waiter and must suspend.
    /// The executor is responsible for setting the task's `io_buffer_wait_*`
    /// fields and boosting its effective priority.
    Queued,
    /// No free slot and the caller asked not to suspend.
    WouldBlock,
}

impl Bucket {
    fn new(slot_len: usize, count: usize, huge: bool) -> SchedResult<Self> {
        let arena = SlotArena::new(slot_len, count, huge)?;
        Ok(Bucket {
            arena,
            free: (0..count as u32).rev().collect(),
            waiters: VecDeque::new(),
        })
    }

    pub fn slot_len(&self) -> usize {
        self.arena.slot_len
    }

    pub fn iov(&self, index: u32) -> libc::iovec {
        self.arena.iov(index)
    }

    pub fn iovecs_for_registration(&self) -> Vec<libc::iovec> {
        self.arena.iovecs()
    }

    /// spec.md §4.5 claim protocol: "If the free list is non-empty *and*
    /// no tasks are queued waiting, pop and return the slot. Otherwise...
    /// append the task to the bucket's FIFO waiter list."
    pub fn claim(&mut self, requester: TaskId, fail_dont_suspend: bool) -> ClaimOutcome {
        if self.waiters.is_empty() {
            if let Some(slot) = self.free.pop() {
                return ClaimOutcome::Granted(slot);
            }
        }
        if fail_dont_suspend {
            return ClaimOutcome::WouldBlock;
        }
        self.waiters.push_back(requester);
        ClaimOutcome::Queued
    }

    /// spec.md §4.5 release protocol: "If the bucket has a waiter, dequeue
    /// the head waiter, hand off the free buffer... Otherwise return the
    /// slot to the free list." Returns the waiter to resume, if any; the
    /// slot identity does not change (spec.md §8 invariant: "A buffer that
    /// was returned by claim and then released always comes back to the
    /// same pool bucket it was drawn from").
    pub fn release(&mut self, slot: u32) -> Option<TaskId> {
        if let Some(waiter) = self.waiters.pop_front() {
            return Some(waiter);
        }
        self.free.push(slot);
        None
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}

/// Per-ring counts configuring a [`BufferPool`] (spec.md §6 "Ring
/// configuration"). Non-write rings additionally carry the subset sizes
/// registered as the kernel-selected buffer ring.
#[derive(Debug, Clone, Copy)]
pub struct BufferPoolConfig {
    pub small_count: usize,
    pub small_multiplier: usize,
    pub large_count: usize,
    pub large_multiplier: usize,
    /// Only meaningful on the non-write ring.
    pub small_kernel_allocated_count: usize,
    pub large_kernel_allocated_count: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            small_count: 64,
            small_multiplier: 1,
            large_count: 0,
            large_multiplier: 1,
            small_kernel_allocated_count: 0,
            large_kernel_allocated_count: 0,
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

pub struct BufferPool {
    pub small: Bucket,
    pub large: Bucket,
    small_size: usize,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> SchedResult<Self> {
        let small_size = page_size() * config.small_multiplier.max(1);
        let large_size = HUGE_PAGE_SIZE * config.large_multiplier.max(1);
        let small = Bucket::new(small_size, config.small_count.max(1), false)?;
        let large = Bucket::new(large_size, config.large_count, true)?;
        Ok(BufferPool { small, large, small_size })
    }

    /// Picks large iff `requested > small_size`, else small (spec.md
    /// §4.5 "Pick size class").
    #[inline]
    pub fn size_class_for(&self, requested: usize) -> SizeClass {
        if requested > self.small_size {
            SizeClass::Large
        } else {
            SizeClass::Small
        }
    }

    pub fn bucket(&mut self, class: SizeClass) -> &mut Bucket {
        match class {
            SizeClass::Small => &mut self.small,
            SizeClass::Large => &mut self.large,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Small,
    Large,
}

/// Buffer descriptor handed back to user code (spec.md §6): `index` is
/// signed so the non-write and write rings' buffers are distinguishable by
/// sign/magnitude without a separate "which ring" field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub index: i32,
    pub large_page: bool,
}

impl BufferDescriptor {
    pub fn for_non_write_ring(slot: u32, large_page: bool) -> Self {
        BufferDescriptor {
            index: slot as i32,
            large_page,
        }
    }

    pub fn for_write_ring(slot: u32, large_page: bool) -> Self {
        BufferDescriptor {
            index: -(slot as i32) - 1,
            large_page,
        }
    }

    pub fn slot(self) -> u32 {
        if self.index >= 0 {
            self.index as u32
        } else {
            (-self.index - 1) as u32
        }
    }

    pub fn is_write_ring(self) -> bool {
        self.index < 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_then_release_is_identity_on_free_set() {
        let mut pool = BufferPool::new(BufferPoolConfig {
            small_count: 2,
            ..Default::default()
        })
        .expect("pool");
        let before = pool.small.free_count();
        let slot = match pool.small.claim(TaskId::new(1), true) {
            ClaimOutcome::Granted(s) => s,
            _ => panic!("expected a granted slot"),
        };
        assert_eq!(pool.small.free_count(), before - 1);
        assert!(pool.small.release(slot).is_none());
        assert_eq!(pool.small.free_count(), before);
    }

    #[test]
    fn exhausted_bucket_queues_waiter_unless_fail_dont_suspend() {
        let mut pool = BufferPool::new(BufferPoolConfig {
            small_count: 1,
            ..Default::default()
        })
        .expect("pool");
        let _slot = match pool.small.claim(TaskId::new(1), false) {
            ClaimOutcome::Granted(s) => s,
            _ => panic!(),
        };
        assert!(matches!(
            pool.small.claim(TaskId::new(2), true),
            ClaimOutcome::WouldBlock
        ));
        assert!(matches!(
            pool.small.claim(TaskId::new(2), false),
            ClaimOutcome::Queued
        ));
        assert_eq!(pool.small.waiter_count(), 1);
    }

    #[test]
    fn release_hands_off_to_waiter_without_touching_free_list() {
        let mut pool = BufferPool::new(BufferPoolConfig {
            small_count: 1,
            ..Default::default()
        })
        .expect("pool");
        let slot = match pool.small.claim(TaskId::new(1), false) {
            ClaimOutcome::Granted(s) => s,
            _ => panic!(),
        };
        let _ = pool.small.claim(TaskId::new(2), false);
        let waiter = pool.small.release(slot);
        assert_eq!(waiter, Some(TaskId::new(2)));
        assert_eq!(pool.small.free_count(), 0);
    }

    #[test]
    fn size_class_selection() {
        let pool = BufferPool::new(BufferPoolConfig::default()).expect("pool");
        let small_size = pool.small_size;
        assert_eq!(pool.size_class_for(small_size), SizeClass::Small);
        assert_eq!(pool.size_class_for(small_size + 1), SizeClass::Large);
    }

    #[test]
    fn descriptor_sign_encodes_ring() {
        let nw = BufferDescriptor::for_non_write_ring(5, false);
        assert!(!nw.is_write_ring());
        assert_eq!(nw.slot(), 5);

        let wr = BufferDescriptor::for_write_ring(5, false);
        assert!(wr.is_write_ring());
        assert_eq!(wr.slot(), 5);
    }
}
