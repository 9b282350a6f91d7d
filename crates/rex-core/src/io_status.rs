//! The I/O status record (spec.md §3 "I/O status record", §9 "non-movable
//! identity").
//!
//! `IoStatus` is the caller-owned, non-moving identity of one in-flight
//! operation. The caller (typically a suspended task's stack frame) owns
//! the storage; the executor only ever borrows it via a `NonNull` handle
//! threaded through [`crate::list::List`] — see [`crate::list::PointerArena`].
//!
//! spec.md's C ancestor aliases the `result` field with the owning task
//! pointer during submission so a completion can be demultiplexed without a
//! second lookup table. §9's REDESIGN FLAGS explicitly invite a tagged enum
//! in place of that aliasing trick in a memory-safe target language, so
//! [`IoStatusPayload`] models the two states directly instead of reusing one
//! word for two meanings.

use crate::id::TaskId;
use crate::list::{Linked, Links};
use core::ptr::NonNull;

/// What an [`IoStatus`]'s `payload` currently means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatusPayload {
    /// Submitted, not yet completed. Carries the task that should be
    /// recovered when the CQE for this operation arrives (spec.md: "the
    /// result field ... aliases the owning task pointer").
    InFlight { owner: TaskId },
    /// The CQE arrived; `result` is the raw io_uring result (negative
    /// errno or non-negative byte count / fd).
    Completed { result: i32 },
}

/// Which registered-buffer-pool identity (spec.md §4.5) this record's
/// operation used, if the CQE indicated a kernel-selected buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChosenBuffer {
    pub large_page: bool,
    pub slot: u16,
}

/// Identity of a single in-flight operation (spec.md §3).
///
/// Must not move between [`IoStatus::new`] and the moment its completion is
/// reaped — the kernel holds `user_data` pointing at this record's address
/// the whole time it is in flight. Callers stack-allocate it on a suspended
/// frame (or box it, for longer-lived operations) and never relocate it.
pub struct IoStatus {
    links: Links<NonNull<IoStatus>>,
    payload: IoStatusPayload,
    /// Set when a per-operation cancel is possible; cleared once consumed.
    /// `true` once `Task::io_cancel` has been invoked for this record, so a
    /// second cancel attempt can be rejected rather than double-submitting
    /// a cancel SQE for the same identity.
    cancel_requested: bool,
    chosen_buffer: Option<ChosenBuffer>,
    initiated: u64,
    completed: u64,
    reaped: u64,
}

impl IoStatus {
    /// Construct a record for an operation about to be submitted on behalf
    /// of `owner`. Call this immediately before obtaining the SQE so
    /// `initiated` tracks submission order.
    pub fn new(owner: TaskId, initiated_tick: u64) -> Self {
        IoStatus {
            links: Links::new(),
            payload: IoStatusPayload::InFlight { owner },
            cancel_requested: false,
            chosen_buffer: None,
            initiated: initiated_tick,
            completed: 0,
            reaped: 0,
        }
    }

    #[inline]
    pub fn payload(&self) -> IoStatusPayload {
        self.payload
    }

    /// True while the operation is still in flight (spec.md: "a reserved
    /// sentinel in a flags field" marks in-flight; here that's just the
    /// enum discriminant).
    #[inline]
    pub fn is_in_flight(&self) -> bool {
        matches!(self.payload, IoStatusPayload::InFlight { .. })
    }

    #[inline]
    pub fn owner(&self) -> Option<TaskId> {
        match self.payload {
            IoStatusPayload::InFlight { owner } => Some(owner),
            IoStatusPayload::Completed { .. } => None,
        }
    }

    #[inline]
    pub fn result(&self) -> Option<i32> {
        match self.payload {
            IoStatusPayload::Completed { result } => Some(result),
            IoStatusPayload::InFlight { .. } => None,
        }
    }

    /// Transition to completed, stamping the tick. Called from the CQE
    /// demultiplex path (spec.md §4.3 Phase D, "I/O-status payload" case).
    pub fn complete(&mut self, result: i32, completed_tick: u64) {
        self.payload = IoStatusPayload::Completed { result };
        self.completed = completed_tick;
    }

    pub fn set_chosen_buffer(&mut self, buf: ChosenBuffer) {
        self.chosen_buffer = Some(buf);
    }

    pub fn chosen_buffer(&self) -> Option<ChosenBuffer> {
        self.chosen_buffer
    }

    pub fn mark_cancel_requested(&mut self) -> bool {
        let already = self.cancel_requested;
        self.cancel_requested = true;
        !already
    }

    pub fn stamp_reaped(&mut self, tick: u64) {
        self.reaped = tick;
    }

    pub fn initiated_tick(&self) -> u64 {
        self.initiated
    }
    pub fn completed_tick(&self) -> u64 {
        self.completed
    }
    pub fn reaped_tick(&self) -> u64 {
        self.reaped
    }

    /// A stable, non-null handle to this record for use as a `List` node
    /// id and as the CQE `user_data` payload (see `rex-uring`'s
    /// `UserData` tagging). Requires `self` already be pinned in its final
    /// storage location.
    #[inline]
    pub fn handle(&mut self) -> NonNull<IoStatus> {
        NonNull::from(&mut *self)
    }
}

impl Linked for IoStatus {
    type Id = NonNull<IoStatus>;

    fn links(&self) -> &Links<Self::Id> {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links<Self::Id> {
        &mut self.links
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_flight_owned_by_creator() {
        let io = IoStatus::new(TaskId::new(3), 1);
        assert!(io.is_in_flight());
        assert_eq!(io.owner(), Some(TaskId::new(3)));
        assert_eq!(io.result(), None);
    }

    #[test]
    fn complete_switches_payload_to_result() {
        let mut io = IoStatus::new(TaskId::new(3), 1);
        io.complete(4096, 42);
        assert!(!io.is_in_flight());
        assert_eq!(io.owner(), None);
        assert_eq!(io.result(), Some(4096));
        assert_eq!(io.completed_tick(), 42);
    }

    #[test]
    fn cancel_requested_is_latched_once() {
        let mut io = IoStatus::new(TaskId::new(1), 0);
        assert!(io.mark_cancel_requested());
        assert!(!io.mark_cancel_requested());
    }
}
