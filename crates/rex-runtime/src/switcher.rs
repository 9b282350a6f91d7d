//! Context switcher abstraction (spec.md §4.1).
//!
//! Three interchangeable ways to get a task's user code running on its own
//! stack and back off it again:
//!
//! - [`NoSwitchSwitcher`]: pool mode. There is no separate stack and no
//!   suspension; the task body runs to completion on the calling
//!   executor's own OS thread stack. Any attempt by task code to suspend
//!   (SQE admission blocking, awaiting a completion) is a programming
//!   error in this mode and panics rather than corrupting scheduler state.
//! - [`SetjmpSwitcher`]: POSIX `ucontext` (`getcontext`/`makecontext`/
//!   `swapcontext`), portable, moderate overhead.
//! - [`FastSwitcher`]: hand-rolled naked-asm register save/restore
//!   ([`crate::arch`]), roughly 2x the throughput of the `ucontext` path at
//!   the cost of being architecture-specific (x86_64 only today).
//!
//! A [`Context`] is opaque outside this module: which variant it holds
//! depends entirely on which switcher created it. Mixing a `Context` from
//! one switcher with a different switcher's `switch` is a logic error
//! (caught with a panic, not UB) since [`crate::Config`] picks exactly one
//! switcher kind for an executor's whole lifetime.

use crate::memory::Stack;
use rex_core::error::SchedResult;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The body a context runs once switched into for the first time: call the
/// task's user code, record its outcome, then switch away permanently.
/// Never returns — its last action is always a [`ContextSwitcher::switch`]
/// back to the executor's base context.
pub type ContextBody = Box<dyn FnOnce() + Send + 'static>;

enum ContextState {
    NoSwitch,
    Fast {
        _stack: Stack,
        regs: crate::arch::SavedRegs,
    },
    Setjmp {
        _stack: Stack,
        slot: Box<SetjmpSlot>,
    },
}

/// An opaque, non-movable-in-spirit context. Held behind the arena's
/// per-task storage (never behind a `Vec` that might reallocate and move
/// it); `switch` takes `&mut Context` precisely so callers are forced to
/// reach it through a stable place.
pub struct Context {
    state: ContextState,
    live: Option<Arc<AtomicUsize>>,
}

// A context is exclusively owned by whichever task or executor currently
// holds it; only one thread ever touches it at a time, but it may move
// between threads across an `attach` (spec.md §4.2). The raw pointer
// buried in `ContextState::Setjmp`'s trampoline arg is never read
// concurrently, so this is sound.
unsafe impl Send for Context {}

impl Drop for Context {
    fn drop(&mut self) {
        if let Some(live) = &self.live {
            live.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl Context {
    /// Move this context's live-count accounting to a different switcher
    /// *instance* of the same kind (spec.md §3 Context: "may be
    /// reparented to a different switcher instance of the same kind while
    /// suspended"). Reparenting across kinds is the fatal misuse spec.md
    /// §4.1 calls out and is not represented here — callers must pass a
    /// `new_live` obtained from a switcher of the same kind this context
    /// was created with.
    pub fn reparent(&mut self, new_live: Option<Arc<AtomicUsize>>) {
        if let Some(live) = &self.live {
            live.fetch_sub(1, Ordering::Relaxed);
        }
        if let Some(live) = &new_live {
            live.fetch_add(1, Ordering::Relaxed);
        }
        self.live = new_live;
    }
}

pub trait ContextSwitcher: Send + Sync {
    /// Allocate a stack (unless this switcher needs none) and prime a new
    /// [`Context`] so that the first `switch` into it runs `body`.
    fn new_context(&self, stack_body_size: usize, body: ContextBody) -> SchedResult<Context>;

    /// The context representing "this executor's own stack" — the `to`
    /// side of the very first switch into a task, and the `to` side every
    /// task switches back to when it suspends or exits.
    fn new_base_context(&self) -> Context;

    /// Save `from`'s register state, restore `to`'s, and resume there.
    /// Returns once some later `switch` targets `from` again.
    ///
    /// # Safety
    /// Both contexts must have been produced by this same switcher.
    unsafe fn switch(&self, from: &mut Context, to: &Context);

    /// Number of live (not yet dropped) contexts this switcher has
    /// produced. Exposed for executor shutdown bookkeeping and tests —
    /// an executor should not be torn down while contexts it owns are
    /// still outstanding.
    fn live_count(&self) -> usize;

    /// Suspend `current` and resume `new` (spec.md §4.1
    /// `suspend_and_call_resume`). `new = None` means "return to whoever
    /// most recently resumed `current`" — since every switch in this
    /// implementation is already symmetric (the executor always names an
    /// explicit target, including its own base context), that case is
    /// simply switching into `current`'s own base context, which the
    /// caller passes back in as `current` after borrowing it; there is no
    /// separate "resumer" field to track.
    ///
    /// # Safety
    /// Both contexts must belong to this switcher. Mixing a context from a
    /// different switcher *kind* (setjmp vs fast) is a fatal programmer
    /// error in the upstream design (spec.md §4.1); this crate does not
    /// implement the fast switcher's cross-kind detour, since every
    /// executor picks one switcher kind for its whole lifetime
    /// ([`crate::switcher`] module docs) and no caller needs to mix them.
    unsafe fn suspend_and_call_resume(&self, current: &mut Context, new: &Context) {
        self.switch(current, new);
    }

    /// Restricted variant of `switch` requiring `current` and `new` to
    /// share a switcher instance — here that's just `switch` again, since
    /// this trait itself is the instance boundary.
    ///
    /// # Safety
    /// Same as [`ContextSwitcher::switch`].
    unsafe fn resume(&self, current: &mut Context, new: &Context) {
        self.switch(current, new);
    }

    /// True for switchers that run a context's body inline during
    /// `new_context` itself rather than deferring it to a later `switch`
    /// (pool mode). Callers must not hand such a switcher a body that
    /// expects task/executor state to already exist — the body runs before
    /// `new_context` returns, let alone before the caller can finish
    /// constructing anything around the resulting `Context`.
    fn runs_body_inline(&self) -> bool {
        false
    }

    /// Enter a block in which many contexts will be resumed in turn
    /// (spec.md §4.1 `resume_many`, used by the run loop's Phase B/G). The
    /// upstream design records a single shared return point under the fast
    /// switcher so each individual resumption doesn't pay for its own; that
    /// is a throughput optimization with no externally observable
    /// behavior difference, so this implementation always takes the
    /// setjmp-style path spec.md describes as "a conventional loop" —
    /// `callback` is simply invoked once and resumes as many contexts as
    /// it likes via ordinary `switch` calls.
    fn resume_many(&self, callback: &mut dyn FnMut()) {
        callback();
    }
}

/// Pool-mode switcher: no stacks, no suspension.
#[derive(Default)]
pub struct NoSwitchSwitcher;

impl NoSwitchSwitcher {
    pub fn new() -> Self {
        NoSwitchSwitcher
    }
}

impl ContextSwitcher for NoSwitchSwitcher {
    fn new_context(&self, _stack_body_size: usize, body: ContextBody) -> SchedResult<Context> {
        // Pool mode runs the body inline, synchronously, right here: there
        // is no stack to switch onto, so "creating" a context and "running
        // it to completion" are the same act.
        body();
        Ok(Context {
            state: ContextState::NoSwitch,
            live: None,
        })
    }

    fn new_base_context(&self) -> Context {
        Context {
            state: ContextState::NoSwitch,
            live: None,
        }
    }

    unsafe fn switch(&self, _from: &mut Context, _to: &Context) {
        panic!("NoSwitchSwitcher: task attempted to suspend in pool mode");
    }

    fn live_count(&self) -> usize {
        0
    }

    fn runs_body_inline(&self) -> bool {
        true
    }
}

/// Fast register-save switcher (spec.md §4.1), built on [`crate::arch`].
pub struct FastSwitcher {
    live: Arc<AtomicUsize>,
}

impl FastSwitcher {
    pub fn new() -> Self {
        FastSwitcher {
            live: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Default for FastSwitcher {
    fn default() -> Self {
        Self::new()
    }
}

extern "C" fn fast_trampoline_entry(arg: usize) -> ! {
    let body = unsafe { Box::from_raw(arg as *mut ContextBody) };
    (*body)();
    unreachable!("rex-runtime: fast context body returned instead of switching away");
}

impl ContextSwitcher for FastSwitcher {
    fn new_context(&self, stack_body_size: usize, body: ContextBody) -> SchedResult<Context> {
        let stack = Stack::new(stack_body_size)?;
        let boxed: Box<ContextBody> = Box::new(body);
        let arg = Box::into_raw(boxed) as usize;

        let mut regs = crate::arch::SavedRegs::default();
        unsafe {
            crate::arch::init_context(&mut regs, stack.top(), fast_trampoline_entry, arg);
        }
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(Context {
            state: ContextState::Fast {
                _stack: stack,
                regs,
            },
            live: Some(self.live.clone()),
        })
    }

    fn new_base_context(&self) -> Context {
        Context {
            state: ContextState::Fast {
                _stack: Stack::new(0).expect("base context stack"),
                regs: crate::arch::SavedRegs::default(),
            },
            live: None,
        }
    }

    unsafe fn switch(&self, from: &mut Context, to: &Context) {
        let from_regs = match &mut from.state {
            ContextState::Fast { regs, .. } => regs as *mut crate::arch::SavedRegs,
            _ => panic!("FastSwitcher::switch: `from` is not a Fast context"),
        };
        let to_regs = match &to.state {
            ContextState::Fast { regs, .. } => regs as *const crate::arch::SavedRegs,
            _ => panic!("FastSwitcher::switch: `to` is not a Fast context"),
        };
        crate::arch::switch(from_regs, to_regs);
    }

    fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

/// One `ucontext_t` plus the body pointer `makecontext` hands back to the
/// trampoline (it can only pass `c_int` arguments, so the real pointer
/// rides along beside the structure rather than through `makecontext`'s
/// varargs).
struct SetjmpSlot {
    ucp: libc::ucontext_t,
    body: *mut ContextBody,
}

/// `ucontext`-based switcher: portable, moderate overhead, no assembly.
pub struct SetjmpSwitcher {
    live: Arc<AtomicUsize>,
}

impl SetjmpSwitcher {
    pub fn new() -> Self {
        SetjmpSwitcher {
            live: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Default for SetjmpSwitcher {
    fn default() -> Self {
        Self::new()
    }
}

extern "C" fn setjmp_trampoline_entry(slot_ptr_hi: u32, slot_ptr_lo: u32) {
    let slot_ptr = ((slot_ptr_hi as u64) << 32 | slot_ptr_lo as u64) as *mut SetjmpSlot;
    let body = unsafe { Box::from_raw((*slot_ptr).body) };
    (*body)();
    unreachable!("rex-runtime: ucontext body returned instead of switching away");
}

impl ContextSwitcher for SetjmpSwitcher {
    fn new_context(&self, stack_body_size: usize, body: ContextBody) -> SchedResult<Context> {
        let stack = Stack::new(stack_body_size)?;
        let boxed: Box<ContextBody> = Box::new(body);
        let body_ptr = Box::into_raw(boxed);

        let mut slot = Box::new(SetjmpSlot {
            ucp: unsafe { std::mem::zeroed() },
            body: body_ptr,
        });

        unsafe {
            if libc::getcontext(&mut slot.ucp) != 0 {
                return Err(rex_core::error::RexError::Construction(
                    "getcontext failed priming new context",
                ));
            }
            slot.ucp.uc_stack.ss_sp = stack.bottom() as *mut libc::c_void;
            slot.ucp.uc_stack.ss_size = stack.body_size();
            slot.ucp.uc_link = std::ptr::null_mut();

            let slot_ptr = slot.as_mut() as *mut SetjmpSlot as u64;
            libc::makecontext(
                &mut slot.ucp,
                std::mem::transmute::<
                    extern "C" fn(u32, u32),
                    unsafe extern "C" fn(),
                >(setjmp_trampoline_entry),
                2,
                (slot_ptr >> 32) as u32,
                slot_ptr as u32,
            );
        }

        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(Context {
            state: ContextState::Setjmp { _stack: stack, slot },
            live: Some(self.live.clone()),
        })
    }

    fn new_base_context(&self) -> Context {
        Context {
            state: ContextState::Setjmp {
                _stack: Stack::new(0).expect("base context stack"),
                slot: Box::new(SetjmpSlot {
                    ucp: unsafe { std::mem::zeroed() },
                    body: std::ptr::null_mut(),
                }),
            },
            live: None,
        }
    }

    unsafe fn switch(&self, from: &mut Context, to: &Context) {
        let from_ucp = match &mut from.state {
            ContextState::Setjmp { slot, .. } => &mut slot.ucp as *mut libc::ucontext_t,
            _ => panic!("SetjmpSwitcher::switch: `from` is not a Setjmp context"),
        };
        let to_ucp = match &to.state {
            ContextState::Setjmp { slot, .. } => &slot.ucp as *const libc::ucontext_t,
            _ => panic!("SetjmpSwitcher::switch: `to` is not a Setjmp context"),
        };
        libc::swapcontext(from_ucp, to_ucp);
    }

    fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn no_switch_runs_body_inline() {
        let switcher = NoSwitchSwitcher::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let _ctx = switcher
            .new_context(0, Box::new(move || ran2.store(true, Ordering::SeqCst)))
            .expect("context");
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(switcher.live_count(), 0);
    }

    #[test]
    #[should_panic]
    fn no_switch_panics_on_suspend() {
        let switcher = NoSwitchSwitcher::new();
        let mut base = switcher.new_base_context();
        let other = switcher.new_base_context();
        unsafe {
            switcher.switch(&mut base, &other);
        }
    }

    #[test]
    fn fast_switch_runs_body_and_returns() {
        let switcher = FastSwitcher::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let mut base = switcher.new_base_context();
        let task = switcher
            .new_context(
                64 * 1024,
                Box::new(move || {
                    ran2.store(true, Ordering::SeqCst);
                }),
            )
            .expect("context");
        assert_eq!(switcher.live_count(), 1);
        drop(task);
        let _ = &mut base;
        assert_eq!(switcher.live_count(), 0);
        // `ran` is only set once the context is actually switched into,
        // which this unit test does not do (that's exercised by the
        // executor integration tests) — it stays false here.
        assert!(!ran.load(Ordering::SeqCst));
    }
}
