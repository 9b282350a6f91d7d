//! The facade `Executor` (spec.md §3 "Executor"): a thin, ergonomic skin
//! over [`rex_uring::Executor`] that accepts plain closures instead of
//! pre-boxed `TaskBody`s and builds its ring pair from [`crate::Config`]
//! instead of `rex-uring`'s lower-level `Config`.

use crate::Config;
use rex_core::error::SchedResult;
use rex_core::id::TaskId;
use rex_core::priority::{Priority, PriorityOverride};
use rex_uring::{ExecutorHandle, ExecutorStats};
use std::time::Duration;

pub use rex_uring::TaskHandle;

/// Owns one kernel thread's worth of tasks: a ring pair, registered buffer
/// pools, an fd table, and the per-priority scheduling lists, and drives
/// the run loop (spec.md §4.3 Phases A–G) via [`Executor::run`].
pub struct Executor {
    inner: rex_uring::Executor,
}

impl Executor {
    /// Builds and wires a new executor. `id` only needs to be unique within
    /// a process; [`crate::Dispatcher`] assigns these itself for pooled use.
    pub fn new(id: usize, config: &Config) -> SchedResult<Self> {
        let inner = rex_uring::Executor::new(id, &config.to_executor_config())?;
        Ok(Executor { inner })
    }

    pub fn id(&self) -> usize {
        self.inner.id()
    }

    /// A cheap, `Send + Sync` handle usable from any thread to attach tasks
    /// or wake this executor's run loop (spec.md §4.2 `attach` cross-thread
    /// case, §4.3 `wake`).
    pub fn handle(&self) -> ExecutorHandle {
        self.inner.handle()
    }

    pub fn stats(&self) -> ExecutorStats {
        self.inner.stats()
    }

    /// Sum of `pending_launch + suspended` across all priorities.
    pub fn backlog_len(&self) -> usize {
        self.inner.backlog_len()
    }

    /// spec.md §4.2 `attach`, same-thread case: builds a task from a plain
    /// closure and joins `pending_launch`.
    pub fn spawn(
        &mut self,
        body: impl FnOnce() -> i32 + Send + 'static,
        cpu_priority: Priority,
        io_priority: Priority,
    ) -> SchedResult<TaskId> {
        self.inner.spawn(Box::new(body), cpu_priority, io_priority)
    }

    /// spec.md §4.2 `cancel`.
    pub fn cancel(&mut self, id: TaskId) -> SchedResult<()> {
        self.inner.cancel(id)
    }

    /// spec.md §4.2 `set_priorities`.
    pub fn set_priorities(&mut self, id: TaskId, cpu: PriorityOverride, io: PriorityOverride) {
        self.inner.set_priorities(id, cpu, io)
    }

    /// spec.md §4.3 `run(max_items, timeout)`. `timeout = None` waits
    /// indefinitely; `Some(Duration::ZERO)` polls without syscall sleep
    /// when possible.
    pub fn run(&mut self, max_items: usize, timeout: Option<Duration>) -> SchedResult<usize> {
        self.inner.run(max_items, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_mode_spawn_runs_task_body_to_completion() {
        let config = Config::new().switcher_kind(rex_uring::SwitcherKind::NoSwitch).ring_entries(32).wr_ring_entries(0);
        let mut executor = Executor::new(0, &config).expect("executor");
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        executor
            .spawn(
                move || {
                    ran2.store(true, std::sync::atomic::Ordering::SeqCst);
                    0
                },
                Priority::Normal,
                Priority::Normal,
            )
            .expect("spawn");
        let processed = executor.run(16, Some(Duration::ZERO)).expect("run");
        assert!(processed >= 1);
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
