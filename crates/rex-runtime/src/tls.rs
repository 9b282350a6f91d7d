//! Thread-local context: which executor owns this OS thread, and which
//! task is currently running on it.
//!
//! The run loop (spec.md §4.3) sets `current_task` around each resumption
//! so code running inside a task body — SQE admission, the buffer pool,
//! `kprint!` call sites — can find "my executor" / "my task" without
//! threading a reference through every call.

use rex_core::id::TaskId;
use std::cell::Cell;

thread_local! {
    static EXECUTOR_ID: Cell<usize> = const { Cell::new(usize::MAX) };
    static CURRENT_TASK: Cell<u32> = const { Cell::new(u32::MAX) };
}

#[inline]
pub fn set_executor_id(id: usize) {
    EXECUTOR_ID.with(|cell| cell.set(id));
    rex_core::kprint::set_executor_id(id as u32);
}

#[inline]
pub fn executor_id() -> Option<usize> {
    EXECUTOR_ID.with(|cell| {
        let v = cell.get();
        if v == usize::MAX {
            None
        } else {
            Some(v)
        }
    })
}

#[inline]
pub fn set_current_task(id: TaskId) {
    CURRENT_TASK.with(|cell| cell.set(id.as_u32()));
    rex_core::kprint::set_task_id(id.as_u32());
}

#[inline]
pub fn clear_current_task() {
    CURRENT_TASK.with(|cell| cell.set(TaskId::NONE.as_u32()));
    rex_core::kprint::clear_task_id();
}

#[inline]
pub fn current_task() -> TaskId {
    TaskId::new(CURRENT_TASK.with(|cell| cell.get()))
}

#[inline]
pub fn is_in_task() -> bool {
    current_task().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_task() {
        set_current_task(TaskId::new(7));
        assert_eq!(current_task(), TaskId::new(7));
        assert!(is_in_task());
        clear_current_task();
        assert!(!is_in_task());
    }
}
