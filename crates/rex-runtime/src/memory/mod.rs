//! Per-context stack allocation.
//!
//! spec.md §3 "Context": "Owns a stack region (one guard page plus a stack
//! body)... Lifetime: created per task; destroyed with the task." Unlike a
//! scheduler that preallocates one giant address-space slab up front, each
//! [`Stack`] here is its own `mmap` region: a leading guard page
//! (`PROT_NONE`, catches stack overflow with `SIGSEGV`) followed by a
//! read/write body the context's stack pointer lives in.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::Stack;
    }
}

use rex_core::error::{RexError, SchedResult};

/// Default per-context stack body size (excludes the guard page).
pub const DEFAULT_STACK_BODY_SIZE: usize = 256 * 1024;

pub(crate) fn construction_error(what: &'static str) -> RexError {
    RexError::Construction(what)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_allocates_and_reports_top() {
        let stack = Stack::new(DEFAULT_STACK_BODY_SIZE).expect("stack alloc");
        assert!(!stack.top().is_null());
        assert_eq!(stack.body_size(), DEFAULT_STACK_BODY_SIZE);
    }

    #[test]
    fn stack_top_is_page_aligned() {
        let stack = Stack::new(DEFAULT_STACK_BODY_SIZE).expect("stack alloc");
        assert_eq!(stack.top() as usize % 4096, 0);
    }
}
