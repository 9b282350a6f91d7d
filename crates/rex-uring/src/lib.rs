//! # rex-uring
//!
//! The dual io_uring backend for the `rex` task scheduler (spec.md §3
//! "Executor", §4.3–§4.5).
//!
//! This crate owns everything that actually talks to the kernel: the pair
//! of `io_uring` instances (`ring` for reads/sockets/cancellations,
//! `wr_ring` enforcing total write order via `IOSQE_IO_DRAIN`), SQE
//! admission control (§4.4), CQE demultiplexing and the cancellation
//! protocol (§4.3), the registered buffer pools (§4.5), the fd-index
//! table (§6), and the eventfd foreign threads use to wake a sleeping
//! executor. `rex_core` supplies the vocabulary (ids, priorities, the task
//! state machine, intrusive lists); `rex_runtime` supplies context
//! switching and the `Task` record; this crate is where they meet
//! `io_uring` itself. The `rex` facade crate wraps [`executor::Executor`]
//! with the public task-attach API and the cross-thread work dispatcher.

#![allow(dead_code)]

pub mod buffer_pool;
pub mod eventfd;
pub mod executor;
pub mod fd_table;
pub mod user_data;

pub use buffer_pool::{BufferDescriptor, BufferPool, BufferPoolConfig, SizeClass};
pub use executor::{Config, Executor, ExecutorHandle, ExecutorStats, RingSelector, SwitcherKind, TaskHandle, SUSPEND_FOREVER};
pub use fd_table::{FdIndex, FdTable};
