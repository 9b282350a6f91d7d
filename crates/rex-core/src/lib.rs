//! # rex-core
//!
//! Platform-agnostic core types for the `rex` userspace task scheduler over
//! `io_uring`.
//!
//! This crate contains no OS-specific code and no io_uring awareness: it is
//! the vocabulary shared by `rex-runtime` (context switching, task lifecycle)
//! and `rex-uring` (the dual-ring I/O backend) — identifiers, priorities,
//! the task state machine, the error taxonomy, intrusive list primitives,
//! and the ambient logging/config-helper stack.
//!
//! ## Modules
//!
//! - `id` - task identifier type
//! - `priority` - the three-level CPU/IO priority enum
//! - `state` - task state machine and cancellation state
//! - `list` - intrusive doubly-linked list primitive
//! - `error` - `RexError` / `SchedResult`
//! - `spinlock` - internal spinlock primitive
//! - `kprint` - kernel-style debug printing macros
//! - `env` - environment variable utilities

#![allow(dead_code)]

pub mod env;
pub mod error;
pub mod id;
pub mod io_status;
pub mod kprint;
pub mod list;
pub mod priority;
pub mod spinlock;
pub mod state;

pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};
pub use error::{RexError, SchedResult};
pub use id::TaskId;
pub use io_status::{ChosenBuffer, IoStatus, IoStatusPayload};
pub use list::{Linked, List, Links};
pub use priority::{Priority, PriorityOverride};
pub use spinlock::SpinLock;
pub use state::{CancellationState, TaskState};

/// Constants shared across the scheduler and io_uring layers.
pub mod constants {
    /// Default per-task stack size (one page guard + 16 pages body).
    /// Overridable at runtime via `rex::Config::stack_size`.
    pub const DEFAULT_STACK_SIZE: usize = 16 * 4096;

    /// Guard page size.
    pub const GUARD_SIZE: usize = 4096;

    /// Maximum worker (executor) kernel threads in a dispatcher pool.
    pub const MAX_EXECUTORS: usize = 64;

    /// Default maximum concurrent tasks per executor arena.
    pub const DEFAULT_MAX_TASKS: usize = 65536;

    /// Sentinel task-id value meaning "no task".
    pub const TASK_ID_NONE: u32 = u32::MAX;

    /// Cache line size for alignment of hot scheduler structures.
    pub const CACHE_LINE_SIZE: usize = 64;
}
