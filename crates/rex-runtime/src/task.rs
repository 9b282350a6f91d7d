//! The `Task` record (spec.md §3 "Task", §4.2).
//!
//! A `Task` is pure data plus the bookkeeping the run loop needs to move it
//! between queues; it does not know how to submit an SQE or drive an
//! io_uring ring. The operations spec.md lists under §4.2 (`attach`,
//! `cancel`, `set_priorities`, `suspend_for_duration`, ...) require the
//! executor's rings and arena together and live on `rex_uring::Executor`,
//! which owns a `Vec<Task>` arena addressed by [`TaskId`].

use crate::switcher::Context;
use core::ptr::NonNull;
use rex_core::id::TaskId;
use rex_core::io_status::IoStatus;
use rex_core::list::{Linked, List, Links};
use rex_core::priority::Priority;
use rex_core::state::{CancellationState, TaskState};

/// The task body: runs once, to completion, returning a result code
/// (non-negative on success, a negated errno on failure — spec.md §3
/// "Result type").
pub type TaskBody = Box<dyn FnOnce() -> i32 + Send>;

/// What a suspended task's `pending_cancel_callback` is keyed on (spec.md
/// §3 `pending_cancel_callback`, §4.2 `cancel`). Modeled as a tagged enum
/// rather than a stored function pointer (spec.md §9 REDESIGN FLAGS):
/// the executor already knows how to submit a whole-task cancel or a
/// per-operation cancel, so the task only needs to say which.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelTarget {
    /// No suspension is currently cancellable.
    None,
    /// Cancel keyed by this task's identity (suspend_for_duration,
    /// suspend_until_completed_io, SQE admission wait).
    WholeTask,
    /// Cancel keyed by a specific in-flight operation's identity
    /// (per-operation `io_cancel`).
    Io(NonNull<IoStatus>),
}

/// Monotonic tick counters (spec.md §3 Task: "Monotonic tick counters for
/// submitted, attached, detached, resumed, suspended_awaiting,
/// suspended_completed, total_executed").
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskTicks {
    pub submitted: u64,
    pub attached: u64,
    pub detached: u64,
    pub resumed: u64,
    pub suspended_awaiting: u64,
    pub suspended_completed: u64,
    pub total_executed: u64,
}

/// State used while a task is suspended waiting for a registered buffer
/// (spec.md §3 `io_buffer_wait_*`, §4.5).
#[derive(Debug, Default, Clone, Copy)]
pub struct BufferWaitState {
    pub for_write_ring: bool,
    pub for_large_page: bool,
    /// Effective-CPU-priority boost is active while waiting (priority
    /// inversion avoidance, spec.md §4.5).
    pub boosted: bool,
}

/// A unit of cooperative work (spec.md §3 "Task").
pub struct Task {
    links: Links<TaskId>,
    id: TaskId,
    body: Option<TaskBody>,
    context: Option<Context>,
    /// Task that should receive this task's I/O completions; defaults to
    /// `id` itself. spec.md §9 ambiguity: later mutation of this field
    /// does not retroactively move already-submitted operations — it only
    /// changes routing for operations submitted after the mutation.
    io_recipient: TaskId,
    cpu_priority: Priority,
    io_priority: Priority,
    state: TaskState,
    /// Set only while held by the work dispatcher, orthogonal to `state`
    /// (spec.md §3: "Additionally `awaiting_dispatch` may be true...").
    awaiting_dispatch: bool,
    current_executor: Option<usize>,
    io_submitted: List<IoStatus>,
    io_completed_not_reaped: List<IoStatus>,
    cancellation_state: CancellationState,
    pending_cancel: CancelTarget,
    /// Out-parameter the suspending call uses to learn which `IoStatus`
    /// satisfied its suspension (spec.md §3 `completed_slot`).
    completed_slot: Option<NonNull<IoStatus>>,
    buffer_wait: BufferWaitState,
    /// Hand-off slot for a claimed buffer descriptor, written by the
    /// release protocol before resuming a waiter (spec.md §4.5: "the task
    /// receives its buffer descriptor through its result field").
    pending_buffer: Option<i32>,
    ticks: TaskTicks,
    result: i32,
    /// Cancellation protocol counter (spec.md §4.3 "Cancellation
    /// protocol"): forced to 1 when the first CQE arrives in cancelled
    /// state, then counted down per subsequent CQE until 0, at which point
    /// the task may be resumed with `ECANCELED`.
    expected_remaining_cqes: u32,
}

impl Task {
    pub fn new(
        id: TaskId,
        body: TaskBody,
        context: Context,
        cpu_priority: Priority,
        io_priority: Priority,
    ) -> Self {
        Task {
            links: Links::new(),
            id,
            body: Some(body),
            context: Some(context),
            io_recipient: id,
            cpu_priority,
            io_priority,
            state: TaskState::PendingLaunch,
            awaiting_dispatch: false,
            current_executor: None,
            io_submitted: List::new(),
            io_completed_not_reaped: List::new(),
            cancellation_state: CancellationState::NotRequested,
            pending_cancel: CancelTarget::None,
            completed_slot: None,
            buffer_wait: BufferWaitState::default(),
            pending_buffer: None,
            ticks: TaskTicks::default(),
            result: 0,
            expected_remaining_cqes: 0,
        }
    }

    #[inline]
    pub fn expected_remaining_cqes(&self) -> u32 {
        self.expected_remaining_cqes
    }

    #[inline]
    pub fn set_expected_remaining_cqes(&mut self, n: u32) {
        self.expected_remaining_cqes = n;
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.state
    }

    #[inline]
    pub fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    #[inline]
    pub fn awaiting_dispatch(&self) -> bool {
        self.awaiting_dispatch
    }

    #[inline]
    pub fn set_awaiting_dispatch(&mut self, v: bool) {
        self.awaiting_dispatch = v;
    }

    #[inline]
    pub fn current_executor(&self) -> Option<usize> {
        self.current_executor
    }

    #[inline]
    pub fn set_current_executor(&mut self, ex: Option<usize>) {
        self.current_executor = ex;
    }

    #[inline]
    pub fn io_recipient(&self) -> TaskId {
        self.io_recipient
    }

    #[inline]
    pub fn set_io_recipient(&mut self, recipient: TaskId) {
        self.io_recipient = recipient;
    }

    #[inline]
    pub fn cpu_priority(&self) -> Priority {
        self.cpu_priority
    }

    #[inline]
    pub fn set_cpu_priority(&mut self, p: Priority) {
        self.cpu_priority = p;
    }

    #[inline]
    pub fn io_priority(&self) -> Priority {
        self.io_priority
    }

    #[inline]
    pub fn set_io_priority(&mut self, p: Priority) {
        self.io_priority = p;
    }

    /// `high` while boosted by an outstanding buffer wait hand-off,
    /// otherwise the configured CPU priority (spec.md GLOSSARY "Effective
    /// CPU priority").
    #[inline]
    pub fn effective_cpu_priority(&self) -> Priority {
        if self.buffer_wait.boosted {
            Priority::High
        } else {
            self.cpu_priority
        }
    }

    #[inline]
    pub fn cancellation_state(&self) -> CancellationState {
        self.cancellation_state
    }

    #[inline]
    pub fn set_cancellation_state(&mut self, s: CancellationState) {
        self.cancellation_state = s;
    }

    #[inline]
    pub fn is_cancel_requested(&self) -> bool {
        self.cancellation_state.is_requested()
    }

    #[inline]
    pub fn pending_cancel(&self) -> CancelTarget {
        self.pending_cancel
    }

    #[inline]
    pub fn set_pending_cancel(&mut self, target: CancelTarget) {
        self.pending_cancel = target;
    }

    #[inline]
    pub fn completed_slot(&self) -> Option<NonNull<IoStatus>> {
        self.completed_slot
    }

    #[inline]
    pub fn set_completed_slot(&mut self, slot: Option<NonNull<IoStatus>>) {
        self.completed_slot = slot;
    }

    #[inline]
    pub fn buffer_wait(&self) -> BufferWaitState {
        self.buffer_wait
    }

    #[inline]
    pub fn buffer_wait_mut(&mut self) -> &mut BufferWaitState {
        &mut self.buffer_wait
    }

    #[inline]
    pub fn take_pending_buffer(&mut self) -> Option<i32> {
        self.pending_buffer.take()
    }

    #[inline]
    pub fn set_pending_buffer(&mut self, desc: i32) {
        self.pending_buffer = Some(desc);
    }

    #[inline]
    pub fn io_submitted(&self) -> &List<IoStatus> {
        &self.io_submitted
    }

    #[inline]
    pub fn io_submitted_mut(&mut self) -> &mut List<IoStatus> {
        &mut self.io_submitted
    }

    #[inline]
    pub fn io_completed_not_reaped_mut(&mut self) -> &mut List<IoStatus> {
        &mut self.io_completed_not_reaped
    }

    #[inline]
    pub fn ticks(&self) -> &TaskTicks {
        &self.ticks
    }

    #[inline]
    pub fn ticks_mut(&mut self) -> &mut TaskTicks {
        &mut self.ticks
    }

    #[inline]
    pub fn result(&self) -> i32 {
        self.result
    }

    #[inline]
    pub fn set_result(&mut self, result: i32) {
        self.result = result;
    }

    #[inline]
    pub fn context(&self) -> &Context {
        self.context.as_ref().expect("task context taken before destroy")
    }

    #[inline]
    pub fn context_mut(&mut self) -> &mut Context {
        self.context.as_mut().expect("task context taken before destroy")
    }

    /// Takes the context out for reparenting to a different switcher
    /// instance of the same kind (spec.md §3 Context "Lifetime"). Leaves
    /// the task without a context until `restore_context` is called; a
    /// task must not be resumed in that window.
    pub fn take_context(&mut self) -> Context {
        self.context.take().expect("task context already taken")
    }

    pub fn restore_context(&mut self, ctx: Context) {
        self.context = Some(ctx);
    }

    /// Takes the body so the executor can hand it to the base runner on
    /// first resume; a task's body runs exactly once.
    pub fn take_body(&mut self) -> TaskBody {
        self.body.take().expect("task body already taken")
    }
}

impl Linked for Task {
    type Id = TaskId;

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
    use crate::switcher::{ContextSwitcher, NoSwitchSwitcher};

    fn make_task(id: u32) -> Task {
        let switcher = NoSwitchSwitcher::new();
        let ctx = switcher.new_context(0, Box::new(|| {})).unwrap();
        Task::new(
            TaskId::new(id),
            Box::new(|| 0),
            ctx,
            Priority::Normal,
            Priority::Normal,
        )
    }

    #[test]
    fn new_task_defaults_io_recipient_to_self() {
        let t = make_task(5);
        assert_eq!(t.io_recipient(), TaskId::new(5));
        assert_eq!(t.state(), TaskState::PendingLaunch);
        assert_eq!(t.cancellation_state(), CancellationState::NotRequested);
    }

    #[test]
    fn effective_priority_boosts_while_buffer_waiting() {
        let mut t = make_task(1);
        t.set_cpu_priority(Priority::Low);
        assert_eq!(t.effective_cpu_priority(), Priority::Low);
        t.buffer_wait_mut().boosted = true;
        assert_eq!(t.effective_cpu_priority(), Priority::High);
    }

    #[test]
    fn io_recipient_mutation_does_not_affect_already_submitted_routing() {
        // spec.md §9 ambiguity: mutating io_recipient mid-flight only
        // changes where *future* operations route; already-submitted
        // IoStatus records keep whatever owner they were tagged with.
        let mut t = make_task(2);
        let io = IoStatus::new(t.io_recipient(), 0);
        t.set_io_recipient(TaskId::new(99));
        assert_eq!(io.owner(), Some(TaskId::new(2)));
    }
}
