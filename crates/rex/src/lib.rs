//! # rex
//!
//! Userspace cooperative task scheduler over Linux `io_uring` (spec.md §1).
//!
//! `rex` is the public facade over three lower layers:
//!
//! - [`rex_core`] — platform-agnostic vocabulary: task ids, the three-level
//!   priority enum, the task state machine, intrusive lists, the error
//!   taxonomy, and the ambient logging/env-config stack.
//! - [`rex_runtime`] — context switching (the three interchangeable
//!   switcher strategies) and the `Task` record itself.
//! - [`rex_uring`] — the dual io_uring backend: SQE admission control,
//!   CQE demultiplexing and the cancellation protocol, registered buffer
//!   pools, and the fd-index table.
//!
//! This crate adds the two things that only make sense once those layers
//! exist together: an ergonomic [`Executor`] that takes plain closures
//! instead of pre-boxed bodies, and the cross-thread [`Dispatcher`] (spec.md
//! §3 "Work dispatcher", §4.6) that pools several executors across kernel
//! threads.
//!
//! ## Quick start
//!
//! ```ignore
//! use rex::{Config, Dispatcher, Priority};
//!
//! let dispatcher = Dispatcher::new(Config::from_env()).expect("dispatcher");
//! dispatcher.submit(vec![(
//!     Box::new(|| { println!("hello from a rex task"); 0 }),
//!     Priority::Normal,
//!     Priority::Normal,
//! )]).expect("submit");
//! dispatcher.wait(0, Some(0), None);
//! dispatcher.quit(0, None);
//! ```
//!
//! A single-executor program that does not need cross-thread pooling can
//! skip the dispatcher entirely and drive an [`Executor`] directly with its
//! own `run` loop — this is the shape every end-to-end test in this
//! workspace uses.

pub mod config;
pub mod dispatcher;
pub mod executor;

pub use config::{Config, ConfigError};
pub use dispatcher::{Dispatcher, SubmitError};
pub use executor::{Executor, TaskHandle};

// Re-export the vocabulary callers need to spawn and manage tasks without
// reaching into the lower crates directly.
pub use rex_core::error::{RexError, SchedResult};
pub use rex_core::id::TaskId;
pub use rex_core::priority::{Priority, PriorityOverride};

// Re-export kprint macros and logging controls (spec.md §7 "The executor
// never prints to standard output/error in the release build except in the
// fatal-abort paths" — these macros are how every layer below honors that).
pub use rex_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, set_time_enabled, LogLevel};
pub use rex_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};

// Re-export env utilities used by `Config::from_env`.
pub use rex_core::env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// I/O-facing vocabulary (buffer pools, ring selection, switcher choice) a
// caller needs to configure an executor or interpret a claimed buffer, even
// though the opcode wrappers that fill SQEs are out of this crate's scope
// (spec.md §1 "Deliberately out of scope").
pub use rex_uring::{BufferDescriptor, BufferPoolConfig, RingSelector, SizeClass, SwitcherKind, SUSPEND_FOREVER};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    #[cfg_attr(not(target_os = "linux"), ignore)]
    fn single_executor_smoke() {
        let config = Config::new()
            .switcher_kind(SwitcherKind::NoSwitch)
            .ring_entries(32)
            .wr_ring_entries(0);
        let mut executor = Executor::new(0, &config).expect("executor");
        let ran = std::sync::Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        executor
            .spawn(
                move || {
                    ran2.store(true, Ordering::SeqCst);
                    0
                },
                Priority::Normal,
                Priority::Normal,
            )
            .expect("spawn");
        executor.run(16, Some(Duration::ZERO)).expect("run");
        assert!(ran.load(Ordering::SeqCst));
    }
}
