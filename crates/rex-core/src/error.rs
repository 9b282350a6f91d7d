//! Error taxonomy for the scheduler.
//!
//! Every fallible scheduler operation returns either a non-negative integer
//! or an error drawn from the POSIX `errno` set plus a small set of
//! synthetic codes (`ETIME`, `ECANCELED`, `EAGAIN`). `RexError` models that
//! result type; construction/protocol failures that spec.md marks fatal are
//! *not* represented here — those abort the process via `kerror!` +
//! `std::process::abort()` rather than returning a `Result`.

use core::fmt;

/// Result type for scheduler and I/O operations.
pub type SchedResult<T> = Result<T, RexError>;

/// The scheduler's error taxonomy: POSIX errno plus the synthetic codes
/// spec.md §3/§6 call out by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RexError {
    /// A raw POSIX errno value surfaced from a kernel operation.
    Errno(i32),
    /// Synthetic: a wait expired without an event (`ETIME`).
    Timeout,
    /// Synthetic: the operation was cancelled (`ECANCELED`).
    Cancelled,
    /// Synthetic: cancellation requested but not yet observed by the
    /// kernel/executor; the caller should keep pumping (`EAGAIN`).
    CancelPending,
    /// Synthetic: no such task/I/O-status identity for a cancel target
    /// (`ENOENT`).
    NotFound,
    /// Synthetic: a non-suspending buffer claim found no free buffer
    /// (`ENOMEM`).
    NoBufferAvailable,
    /// A ring/table/arena construction step failed (out of memory, rlimit
    /// unreachable, or a required io_uring feature is absent).
    Construction(&'static str),
}

impl RexError {
    /// `libc` errno this error maps to, for interop with code that still
    /// wants a raw errno (e.g. when propagating into a `std::io::Error`).
    pub fn errno(self) -> i32 {
        match self {
            RexError::Errno(e) => e,
            RexError::Timeout => libc::ETIME,
            RexError::Cancelled => libc::ECANCELED,
            RexError::CancelPending => libc::EAGAIN,
            RexError::NotFound => libc::ENOENT,
            RexError::NoBufferAvailable => libc::ENOMEM,
            RexError::Construction(_) => libc::EINVAL,
        }
    }

    /// True for `EAGAIN`-shaped retriable errors (spec.md §7 "Retriable").
    pub fn is_retriable(self) -> bool {
        matches!(self, RexError::CancelPending)
    }
}

impl fmt::Display for RexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RexError::Errno(e) => write!(f, "errno {e}"),
            RexError::Timeout => write!(f, "timed out"),
            RexError::Cancelled => write!(f, "cancelled"),
            RexError::CancelPending => write!(f, "cancellation in flight, not yet observed"),
            RexError::NotFound => write!(f, "no such task or I/O status"),
            RexError::NoBufferAvailable => write!(f, "no registered buffer available"),
            RexError::Construction(msg) => write!(f, "construction failed: {msg}"),
        }
    }
}

impl std::error::Error for RexError {}

impl From<i32> for RexError {
    fn from(errno: i32) -> Self {
        match errno {
            libc::ETIME => RexError::Timeout,
            libc::ECANCELED => RexError::Cancelled,
            libc::EAGAIN => RexError::CancelPending,
            libc::ENOENT => RexError::NotFound,
            e => RexError::Errno(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_errno_roundtrip() {
        assert_eq!(RexError::Timeout.errno(), libc::ETIME);
        assert_eq!(RexError::Cancelled.errno(), libc::ECANCELED);
        assert_eq!(RexError::CancelPending.errno(), libc::EAGAIN);
        assert!(format!("{}", RexError::NotFound).contains("no such"));
    }

    #[test]
    fn from_errno_maps_synthetic_codes() {
        assert_eq!(RexError::from(libc::ETIME), RexError::Timeout);
        assert_eq!(RexError::from(libc::ECANCELED), RexError::Cancelled);
        assert_eq!(RexError::from(libc::EAGAIN), RexError::CancelPending);
        assert_eq!(RexError::from(5), RexError::Errno(5));
    }

    #[test]
    fn retriable_is_only_cancel_pending() {
        assert!(RexError::CancelPending.is_retriable());
        assert!(!RexError::Timeout.is_retriable());
    }
}
