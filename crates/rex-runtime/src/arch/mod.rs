//! Architecture-specific register save/restore for the fast switcher
//! (spec.md §4.1's "Fast register-save" variant).
//!
//! Each arch module exports a `SavedRegs` struct holding the callee-saved
//! registers that must survive a voluntary context switch, plus
//! `init_context` (prime a fresh stack to start at an entry point) and
//! `switch` (save the caller's registers, load the callee's, jump).

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::{init_context, switch, SavedRegs};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use self::aarch64::{init_context, switch, SavedRegs};
    }
}
