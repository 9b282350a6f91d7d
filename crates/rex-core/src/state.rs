//! Task state machine and cancellation state (spec.md §3, §4.2).

use core::fmt;

/// The exclusive state of an attached task. spec.md §3: "exactly one true
/// between attach and detach" — modeled here as a closed enum rather than
/// six independently-settable bools, so the invariant is structural instead
/// of merely asserted.
///
/// `AwaitingDispatch` is deliberately *not* a `TaskState` variant: spec.md
/// notes it "may be true when held by the work dispatcher and no executor",
/// i.e. it is orthogonal to whichever `TaskState` the task last had. It is
/// tracked as a separate `bool` on `Task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Attached to an executor, queued in `pending_launch`, not yet run.
    PendingLaunch,
    /// Currently executing on its context.
    Running,
    /// Suspended inside SQE admission (§4.4) for the non-write ring.
    SuspendedAwaitingSqeNonwrite,
    /// Suspended inside SQE admission (§4.4) for the write ring.
    SuspendedAwaitingSqeWrite,
    /// Submitted I/O or a timer is outstanding; waiting for a CQE.
    SuspendedAwaitingCompletion,
    /// A CQE satisfying this task's suspension has arrived; queued for
    /// Phase G resumption.
    SuspendedCompletionReady,
    /// User code returned (or was cancelled to exit); awaiting Phase E
    /// teardown (detach, `current_executor` cleared).
    Exited,
}

impl TaskState {
    #[inline]
    pub const fn is_suspended(&self) -> bool {
        matches!(
            self,
            TaskState::SuspendedAwaitingSqeNonwrite
                | TaskState::SuspendedAwaitingSqeWrite
                | TaskState::SuspendedAwaitingCompletion
                | TaskState::SuspendedCompletionReady
        )
    }

    #[inline]
    pub const fn is_suspended_awaiting_sqe(&self) -> bool {
        matches!(
            self,
            TaskState::SuspendedAwaitingSqeNonwrite | TaskState::SuspendedAwaitingSqeWrite
        )
    }

    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Exited)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::PendingLaunch => "pending_launch",
            TaskState::Running => "running",
            TaskState::SuspendedAwaitingSqeNonwrite => "suspended_awaiting_sqe_nonwrite",
            TaskState::SuspendedAwaitingSqeWrite => "suspended_awaiting_sqe_write",
            TaskState::SuspendedAwaitingCompletion => "suspended_awaiting_completion",
            TaskState::SuspendedCompletionReady => "suspended_completion_ready",
            TaskState::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// Per-task cancellation state machine (spec.md §3, §4.2 `cancel`, §4.3
/// cancellation protocol).
///
/// ```text
/// not_requested --cancel()--> requested_not_seen
///                                  |
///                       task's pending_cancel_callback fires,
///                       cancel SQE submitted
///                                  v
///                          seen_awaiting_uring
///                                  |
///                       first CQE for this task's I/O arrives
///                                  v
///                               seen  --(expected_remaining reaches 0)--> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationState {
    NotRequested,
    RequestedNotSeen,
    SeenAwaitingUring,
    Seen,
    Cancelled,
}

impl CancellationState {
    #[inline]
    pub const fn is_requested(&self) -> bool {
        !matches!(self, CancellationState::NotRequested)
    }
}

impl Default for CancellationState {
    fn default() -> Self {
        CancellationState::NotRequested
    }
}

impl fmt::Display for CancellationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CancellationState::NotRequested => "not_requested",
            CancellationState::RequestedNotSeen => "requested_not_seen",
            CancellationState::SeenAwaitingUring => "seen_awaiting_uring",
            CancellationState::Seen => "seen",
            CancellationState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspended_classification() {
        assert!(TaskState::SuspendedAwaitingSqeNonwrite.is_suspended());
        assert!(TaskState::SuspendedAwaitingSqeNonwrite.is_suspended_awaiting_sqe());
        assert!(!TaskState::SuspendedAwaitingSqeWrite.is_terminal());
        assert!(TaskState::Running.is_suspended() == false);
        assert!(TaskState::Exited.is_terminal());
    }

    #[test]
    fn cancellation_default_and_requested() {
        assert_eq!(CancellationState::default(), CancellationState::NotRequested);
        assert!(!CancellationState::NotRequested.is_requested());
        assert!(CancellationState::RequestedNotSeen.is_requested());
        assert!(CancellationState::Cancelled.is_requested());
    }
}
