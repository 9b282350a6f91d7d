//! Eventfd wake channel (spec.md §3 Executor "An eventfd, multishot-polled
//! on the non-write ring, used by foreign threads to wake the executor",
//! §4.3 "Wake").

use rex_core::error::{RexError, SchedResult};
use std::os::unix::io::RawFd;

/// An owned, non-blocking eventfd used as the executor's cross-thread wake
/// channel. `wake()` is safe from any thread; the run loop drains it from
/// the owning thread only, via the multishot-poll CQE path.
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn new() -> SchedResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(RexError::Construction("eventfd() failed"));
        }
        Ok(EventFd { fd })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Write 1 to the counter, waking anyone polling the fd. Coalesces:
    /// multiple wakes before a drain collapse into one counter bump.
    pub fn signal(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(self.fd, &val as *const u64 as *const libc::c_void, 8)
        };
        if ret < 0 {
            let errno = unsafe { *libc::__errno_location() };
            debug_assert_eq!(errno, libc::EAGAIN, "eventfd write failed unexpectedly: {errno}");
        }
    }

    /// Drain the counter (spec.md §4.3 "the run loop's eventfd sentinel
    /// drains the fd"). Called once per iteration that observes the
    /// eventfd-ready CQE.
    pub fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(self.fd, &mut val as *mut u64 as *mut libc::c_void, 8);
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

unsafe impl Send for EventFd {}
unsafe impl Sync for EventFd {}
