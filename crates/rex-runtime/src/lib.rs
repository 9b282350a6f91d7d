//! # rex-runtime
//!
//! Context switching and the task record for the `rex` userspace task
//! scheduler over `io_uring` (spec.md §4.1 "Context Switcher", §4.2
//! "Task").
//!
//! This crate has no io_uring awareness: it is the layer between
//! `rex-core`'s vocabulary and `rex-uring`'s dual-ring executor. It owns:
//!
//! - `memory` — per-context stack allocation (guard page + body).
//! - `arch` — architecture-specific register save/restore for the fast
//!   switcher.
//! - `switcher` — the three interchangeable [`switcher::ContextSwitcher`]
//!   implementations (no-switch, setjmp, fast register-save).
//! - `task` — the [`task::Task`] record: user code, context, priorities,
//!   state machine, and per-task I/O/cancellation bookkeeping.
//! - `tls` — thread-local "which executor / which task is this OS thread
//!   currently running" lookup, used by code running inside a task body
//!   that needs to find its way back to the executor without an explicit
//!   parameter.

#![allow(dead_code)]
#![cfg_attr(feature = "nightly", feature(naked_functions))]

pub mod arch;
pub mod memory;
pub mod switcher;
pub mod task;
pub mod tls;

pub use switcher::{Context, ContextBody, ContextSwitcher, FastSwitcher, NoSwitchSwitcher, SetjmpSwitcher};
pub use task::{BufferWaitState, CancelTarget, Task, TaskBody, TaskTicks};
