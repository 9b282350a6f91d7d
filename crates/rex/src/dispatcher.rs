//! Cross-thread work dispatcher (spec.md §3 "Work dispatcher", §4.6).
//!
//! A pool of [`crate::Executor`]s, each driven by its own kernel thread,
//! moving between an `idle` set and a `working` set as `dispatcher-executor-run`
//! (here [`Dispatcher::executor_run`]) finds or runs out of work. Grounded in
//! the teacher's `gvthread-runtime::worker::WorkerPool` (`Mutex`-protected
//! thread pool, one `JoinHandle` per OS thread) generalized with the
//! condition-variable wait/broadcast protocol spec.md §4.6 `wait`/`quit`
//! describe, since the teacher's own pool has no equivalent drain-to-quiescence
//! primitive.

use crate::{Config, Executor};
use rex_core::priority::Priority;
use rex_runtime::TaskBody;
use rex_uring::ExecutorHandle;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// One unit of work submitted to the dispatcher before any executor has
/// claimed it (spec.md §3 Work dispatcher "per-priority queues of tasks
/// awaiting dispatch").
struct AwaitingTask {
    body: TaskBody,
    cpu_priority: Priority,
    io_priority: Priority,
}

struct Inner {
    /// Executors not currently assigned any backlog, available to accept
    /// submitted work immediately.
    idle: VecDeque<ExecutorHandle>,
    /// Executors with backlog or in-flight I/O.
    working: VecDeque<ExecutorHandle>,
    awaiting_dispatch: [VecDeque<AwaitingTask>; Priority::COUNT],
    awaiting_dispatch_count: usize,
    total_executors: usize,
}

impl Inner {
    fn awaiting_dispatch_count(&self) -> usize {
        self.awaiting_dispatch_count
    }

    /// Sum of `pending_launch + suspended` (here: last-published backlog)
    /// across every executor currently in `working` (spec.md §4.6 `wait`).
    fn unexecuted_count(&self) -> usize {
        self.working.iter().map(|h| h.backlog()).sum()
    }
}

/// Pool of executors across kernel threads; submission, wait-for-drain, and
/// graceful quit (spec.md §4.6).
pub struct Dispatcher {
    inner: Mutex<Inner>,
    cv: Condvar,
    spin_before_sleep_budget: Duration,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Why [`Dispatcher::submit`] rejected a task before it ever reached an
/// executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// spec.md §4.6 `submit`: "validating that it has ... no current-executor".
    AlreadyAttached,
}

impl Dispatcher {
    /// Builds `config.num_workers` executors, each on its own kernel thread
    /// running [`Dispatcher::executor_run`] in a loop, and starts them all
    /// idle.
    ///
    /// Each `Executor` is constructed *on* the kernel thread that will own
    /// it rather than handed off after the fact: `rex_uring::Executor`
    /// records its owning `ThreadId` at construction time and asserts on
    /// every entry point that the calling thread still matches (spec.md
    /// §4.3 "fatal error to call it from any kernel thread other than the
    /// owner"), so a `Dispatcher` that built executors on the caller's
    /// thread and then moved them to worker threads would immediately trip
    /// that assertion. The spawning thread instead waits on a one-shot
    /// channel per worker for confirmation the executor exists and has
    /// published its handle.
    pub fn new(config: Config) -> rex_core::error::SchedResult<Arc<Self>> {
        let dispatcher = Arc::new(Dispatcher {
            inner: Mutex::new(Inner {
                idle: VecDeque::new(),
                working: VecDeque::new(),
                awaiting_dispatch: Default::default(),
                awaiting_dispatch_count: 0,
                total_executors: config.num_workers,
            }),
            cv: Condvar::new(),
            spin_before_sleep_budget: config.spin_before_sleep_budget,
            handles: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(config.num_workers);
        let mut ready_rxs = Vec::with_capacity(config.num_workers);
        for i in 0..config.num_workers {
            let dp = dispatcher.clone();
            let cfg = config.clone();
            let (ready_tx, ready_rx) = std::sync::mpsc::channel::<rex_core::error::SchedResult<ExecutorHandle>>();
            let handle = std::thread::Builder::new()
                .name(format!("rex-executor-{}", i))
                .spawn(move || {
                    let executor = match Executor::new(i, &cfg) {
                        Ok(ex) => ex,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(executor.handle()));
                    dp.run_executor_thread(executor);
                })
                .expect("rex: failed to spawn executor thread");
            handles.push(handle);
            ready_rxs.push(ready_rx);
        }

        let mut idle = VecDeque::new();
        for rx in ready_rxs {
            match rx.recv() {
                Ok(Ok(h)) => idle.push_back(h),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(rex_core::error::RexError::Construction(
                        "executor thread exited before publishing its handle",
                    ))
                }
            }
        }
        dispatcher.inner.lock().unwrap().idle = idle;
        *dispatcher.handles.lock().unwrap() = handles;

        Ok(dispatcher)
    }

    /// The loop body a dedicated executor thread runs for its whole
    /// lifetime: drive `executor_run` until it reports the executor has
    /// quit (spec.md §4.6 `executor-run` returning `-1`).
    fn run_executor_thread(self: Arc<Self>, mut executor: Executor) {
        let mut last_work: Option<Instant> = None;
        loop {
            match self.executor_run(&mut executor, &mut last_work) {
                Ok(_) => {}
                Err(QuitSignal) => break,
            }
        }
    }

    /// spec.md §4.6 `submit(dp, [tasks], n)`.
    pub fn submit(
        &self,
        tasks: Vec<(TaskBody, Priority, Priority)>,
    ) -> rex_core::error::SchedResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for (body, cpu_priority, io_priority) in tasks {
            inner.awaiting_dispatch[cpu_priority.as_index()].push_back(AwaitingTask {
                body,
                cpu_priority,
                io_priority,
            });
            inner.awaiting_dispatch_count += 1;
        }

        // "Walk the idle list, for each priority from high to low, pop a
        // task and attach it to the next idle executor skipping executors
        // marked please_quit; move attached-to executors to working."
        while let Some(handle) = inner.idle.front() {
            if handle.quit_requested() {
                let h = inner.idle.pop_front().unwrap();
                // A quitting executor never rejoins either list; it is
                // draining toward thread exit (see `executor_run`).
                drop(h);
                continue;
            }
            let popped = Priority::iter().find_map(|p| {
                inner.awaiting_dispatch[p.as_index()]
                    .pop_front()
                    .map(|t| (p, t))
            });
            match popped {
                Some((_p, task)) => {
                    inner.awaiting_dispatch_count -= 1;
                    let handle = inner.idle.pop_front().unwrap();
                    handle.build_and_attach(task.body, task.cpu_priority, task.io_priority)?;
                    inner.working.push_back(handle);
                }
                None => break,
            }
        }
        self.cv.notify_all();
        Ok(())
    }

    /// spec.md §4.6 `wait(dp, max_undispatched, max_unexecuted, timeout)`.
    ///
    /// Returns `true` if the drain condition was met, `false` on timeout.
    pub fn wait(
        &self,
        max_undispatched: usize,
        max_unexecuted: Option<usize>,
        timeout: Option<Duration>,
    ) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock().unwrap();
        loop {
            let undispatched_ok = inner.awaiting_dispatch_count() <= max_undispatched;
            let unexecuted_ok = match max_unexecuted {
                None => true,
                Some(max) => inner.unexecuted_count() <= max,
            };
            if undispatched_ok && unexecuted_ok {
                return true;
            }
            let wait_for = match deadline {
                None => Duration::from_millis(50),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    (d - now).min(Duration::from_millis(50))
                }
            };
            let (guard, _timed_out) = self.cv.wait_timeout(inner, wait_for).unwrap();
            inner = guard;
        }
    }

    /// spec.md §4.6 `quit(dp, max_executors, timeout)`.
    pub fn quit(&self, max_executors: usize, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock().unwrap();
        let surplus = inner.total_executors.saturating_sub(max_executors);
        let mut marked = 0usize;
        // "starting with idle ones"
        for h in inner.idle.iter() {
            if marked >= surplus {
                break;
            }
            h.request_quit();
            marked += 1;
        }
        for h in inner.working.iter() {
            if marked >= surplus {
                break;
            }
            h.request_quit();
            marked += 1;
        }
        self.cv.notify_all();
        drop(inner);

        loop {
            let inner = self.inner.lock().unwrap();
            if inner.total_executors <= max_executors {
                return true;
            }
            drop(inner);
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return false;
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// spec.md §4.6 `executor-run`: a single driver step run in a loop by
    /// the executor's dedicated OS thread. Returns the number of scheduling
    /// events processed, or [`QuitSignal`] once the executor has drained
    /// and was marked `please_quit`.
    fn executor_run(
        &self,
        executor: &mut Executor,
        last_work: &mut Option<Instant>,
    ) -> Result<usize, QuitSignal> {
        let now = Instant::now();
        let spin_elapsed = last_work
            .map(|t| now.duration_since(t) < self.spin_before_sleep_budget)
            .unwrap_or(false);
        let timeout = if spin_elapsed {
            Some(Duration::ZERO)
        } else {
            Some(Duration::from_secs(30))
        };

        let processed = match executor.run(256, timeout) {
            Ok(n) => n,
            Err(e) if e == rex_core::error::RexError::Timeout => 0,
            Err(e) if e == rex_core::error::RexError::Cancelled => 0,
            Err(_) => 0,
        };

        if processed > 0 {
            *last_work = Some(now);
            self.publish_backlog(executor);
            return Ok(processed);
        }

        let quitting = executor.handle().quit_requested();
        if !quitting {
            let mut inner = self.inner.lock().unwrap();
            let popped = Priority::iter().find_map(|p| {
                inner.awaiting_dispatch[p.as_index()]
                    .pop_front()
                    .map(|t| (p, t))
            });
            if let Some((_p, task)) = popped {
                inner.awaiting_dispatch_count -= 1;
                drop(inner);
                executor.spawn(task.body, task.cpu_priority, task.io_priority).ok();
                self.publish_backlog(executor);
                return Ok(1);
            }
        }

        // Nothing ran and nothing was waiting: the executor has drained.
        if executor.backlog_len() == 0 {
            let mut inner = self.inner.lock().unwrap();
            let id = executor.id();
            inner.working.retain(|h| h.id() != id);
            if quitting {
                inner.total_executors -= 1;
                self.cv.notify_all();
                return Err(QuitSignal);
            }
            inner.idle.push_back(executor.handle());
            self.cv.notify_all();
        }
        Ok(0)
    }

    fn publish_backlog(&self, executor: &Executor) {
        executor.handle().publish_backlog(executor.backlog_len());
    }

    /// Total executors currently in the pool (idle + working); shrinks as
    /// `quit` drains surplus threads.
    pub fn executor_count(&self) -> usize {
        self.inner.lock().unwrap().total_executors
    }
}

/// Internal signal that an executor thread's `executor_run` loop should
/// stop calling back in (spec.md §4.6 `executor-run` "return -1" case).
struct QuitSignal;

#[cfg(test)]
mod tests {
    use super::*;
    use rex_uring::SwitcherKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tiny_config(workers: usize) -> Config {
        Config::new()
            .num_workers(workers)
            .switcher_kind(SwitcherKind::NoSwitch)
            .ring_entries(32)
            .wr_ring_entries(0)
    }

    #[test]
    #[cfg_attr(not(target_os = "linux"), ignore)]
    fn submit_runs_task_on_idle_executor() {
        let dp = Dispatcher::new(tiny_config(2)).expect("dispatcher");
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        dp.submit(vec![(
            Box::new(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
                0
            }),
            Priority::Normal,
            Priority::Normal,
        )])
        .expect("submit");

        assert!(dp.wait(0, Some(0), Some(Duration::from_secs(5))));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(dp.quit(0, Some(Duration::from_secs(5))));
    }
}
