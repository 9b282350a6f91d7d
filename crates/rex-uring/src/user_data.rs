//! CQE `user_data` tagging (spec.md §4.3 Phase D, §6 "Magic markers").
//!
//! spec.md's C ancestor steals the low three bits of a pointer-sized
//! `user_data` value to distinguish "this CQE completes a task's
//! suspension", "this CQE completes one `IoStatus`-tracked operation", and
//! two fixed sentinel values (eventfd-ready, cancelled-SQE noop). §9
//! REDESIGN FLAGS invites a tagged enum in place of that scheme "in place
//! of tag-bits-in-pointer (or retain the tag bits as an optimisation behind
//! a safe accessor)" — [`UserData`] keeps the tag-bit encoding (so the wire
//! representation still matches what a reader of the original would
//! recognize) but every call site decodes through [`UserData::decode`]
//! rather than inspecting bits directly.

use core::ptr::NonNull;
use rex_core::id::TaskId;
use rex_core::io_status::IoStatus;

const TAG_MASK: u64 = 0b111;
const TAG_TASK: u64 = 0b001;
const TAG_IO: u64 = 0b010;

/// Both magic markers set all three low bits, distinguishing them from
/// the `Task`/`IoStatus` tags (`0b001`/`0b010`) at a glance; the full
/// 64-bit value (not just the tag) identifies which magic it is.
const MAGIC_EVENTFD_READY: u64 = 0xFFFF_FFFF_FFFF_FFF7;
const MAGIC_CANCELLED_SQE_NOOP: u64 = 0xFFFF_FFFF_FFFF_FFEF | 0b111;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserData {
    /// Completes a task's suspension directly (a sleep/nop timer, or an
    /// SQE-admission-exhaustion wakeup keyed by task identity).
    Task(TaskId),
    /// Completes one caller-owned [`IoStatus`]-tracked operation.
    Io(NonNull<IoStatus>),
    /// The eventfd multishot poll fired; a foreign thread's `wake()` is
    /// pending.
    EventFdReady,
    /// Either a harmless `nop` filled in because the task was already
    /// cancelled at admission time (spec.md §4.4 step 4), or an
    /// `AsyncCancel` SQE's own completion (spec.md §4.3 "a cancel SQE
    /// produces *a separate* CQE"). Neither carries a useful payload —
    /// the cancel target gets its own CQE tracked through
    /// `expected_remaining_cqes` — so both are simply discarded.
    CancelledSqeNoop,
}

impl UserData {
    #[inline]
    pub fn encode_task(id: TaskId) -> u64 {
        ((id.as_u32() as u64) << 3) | TAG_TASK
    }

    #[inline]
    pub fn encode_io(io: NonNull<IoStatus>) -> u64 {
        let addr = io.as_ptr() as u64;
        debug_assert_eq!(addr & TAG_MASK, 0, "IoStatus must be at least 8-byte aligned");
        addr | TAG_IO
    }

    #[inline]
    pub fn eventfd_ready() -> u64 {
        MAGIC_EVENTFD_READY
    }

    #[inline]
    pub fn cancelled_sqe_noop() -> u64 {
        MAGIC_CANCELLED_SQE_NOOP
    }

    /// Decode a raw CQE `user_data` field. Panics on the reserved-zero
    /// trap value (spec.md §4.3: "value 0 is reserved as an impossibility
    /// trap") — a zero `user_data` on a completed SQE means some code path
    /// forgot to tag its SQE, a protocol bug rather than a runtime error.
    pub fn decode(raw: u64) -> UserData {
        if raw == 0 {
            panic!("rex-uring: CQE with untagged (zero) user_data — impossibility trap hit");
        }
        if raw == MAGIC_EVENTFD_READY {
            return UserData::EventFdReady;
        }
        if raw == MAGIC_CANCELLED_SQE_NOOP {
            return UserData::CancelledSqeNoop;
        }
        match raw & TAG_MASK {
            TAG_TASK => UserData::Task(TaskId::new((raw >> 3) as u32)),
            TAG_IO => {
                let ptr = (raw & !TAG_MASK) as *mut IoStatus;
                UserData::Io(NonNull::new(ptr).expect("tagged IoStatus user_data was null"))
            }
            other => panic!("rex-uring: unrecognized user_data tag {other:#x} (raw={raw:#x})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_roundtrip() {
        let id = TaskId::new(1234);
        let raw = UserData::encode_task(id);
        assert_eq!(UserData::decode(raw), UserData::Task(id));
    }

    #[test]
    fn magics_are_distinct_and_decode() {
        assert_eq!(UserData::decode(MAGIC_EVENTFD_READY), UserData::EventFdReady);
        assert_eq!(
            UserData::decode(MAGIC_CANCELLED_SQE_NOOP),
            UserData::CancelledSqeNoop
        );
        assert_ne!(MAGIC_EVENTFD_READY, MAGIC_CANCELLED_SQE_NOOP);
    }

    #[test]
    #[should_panic]
    fn zero_is_a_trap() {
        UserData::decode(0);
    }
}
