//! Unix stack allocation via `mmap`/`mprotect`/`madvise`.

use super::construction_error;
use rex_core::error::SchedResult;
use std::ptr::NonNull;

const GUARD_SIZE: usize = 4096;

/// A single context's stack: a guard page followed by a read/write body.
///
/// `mmap`'d `MAP_PRIVATE | MAP_ANONYMOUS`. The guard page stays
/// `PROT_NONE` for the stack's entire lifetime; overflowing into it raises
/// `SIGSEGV` rather than corrupting an adjacent context's memory.
pub struct Stack {
    base: NonNull<u8>,
    total_size: usize,
    body_size: usize,
}

unsafe impl Send for Stack {}

impl Stack {
    /// Allocate a new stack with the given body size (rounded up to a page).
    pub fn new(body_size: usize) -> SchedResult<Self> {
        let page = page_size();
        let body_size = round_up(body_size.max(page), page);
        let total_size = body_size + GUARD_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(construction_error("stack mmap failed"));
        }
        let base = base as *mut u8;

        // Guard page occupies the low end; the body is the remainder.
        let body = unsafe { base.add(GUARD_SIZE) };
        let ret = unsafe {
            libc::mprotect(
                body as *mut libc::c_void,
                body_size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            unsafe {
                libc::munmap(base as *mut libc::c_void, total_size);
            }
            return Err(construction_error("stack mprotect failed"));
        }

        Ok(Stack {
            base: NonNull::new(base).expect("mmap returned non-null on success"),
            total_size,
            body_size,
        })
    }

    /// Top of the stack (stacks grow down on every architecture rex targets).
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.total_size) }
    }

    /// Bottom of the usable body (just above the guard page).
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(GUARD_SIZE) }
    }

    #[inline]
    pub fn body_size(&self) -> usize {
        self.body_size
    }

    /// Advise the kernel the stack body's physical pages may be dropped.
    /// Called by the base runner protocol (spec.md §4.1) each time a
    /// context returns to its "primed, ready for reuse" point, so a stack
    /// that ran a large call depth doesn't pin physical memory indefinitely.
    pub fn advise_reclaimable(&self) {
        unsafe {
            libc::madvise(
                self.bottom() as *mut libc::c_void,
                self.body_size,
                libc::MADV_DONTNEED,
            );
        }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.total_size);
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}
