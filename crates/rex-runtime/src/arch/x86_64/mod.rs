//! x86_64 fast-switcher register set, stack priming, and the naked-asm
//! switch itself (spec.md §4.1 "Fast register-save: a naked-function
//! assembly routine that saves/restores only the callee-saved register set
//! ... roughly 2x the throughput of the setjmp-based switcher").

use std::arch::naked_asm;

/// Callee-saved registers under the System V AMD64 ABI, plus the saved
/// instruction pointer. [`switch`] persists exactly these eight words;
/// everything else is caller-saved and the compiler already spills it
/// around the call.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedRegs {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// Prime a fresh stack so that switching into `regs` for the first time
/// starts execution at `entry_fn(entry_arg)`. `entry_fn` must never return
/// (the base runner protocol in spec.md §4.1 loops forever, suspending
/// itself between tasks rather than returning to the trampoline).
///
/// # Safety
///
/// `stack_top` must be a valid, 16-byte-alignable stack pointer for a
/// region at least large enough for `entry_fn`'s call depth.
#[inline]
pub unsafe fn init_context(
    regs: *mut SavedRegs,
    stack_top: *mut u8,
    entry_fn: extern "C" fn(usize) -> !,
    entry_arg: usize,
) {
    // System V AMD64 requires RSP % 16 == 0 at a `call` instruction; the
    // trampoline below is reached via `jmp`, which doesn't push a return
    // address, so we pre-subtract the 8 bytes a `call` would have used.
    let sp = stack_top as usize;
    let aligned_sp = (sp & !0xF) - 8;

    let regs = &mut *regs;
    *regs = SavedRegs {
        rsp: aligned_sp as u64,
        rip: context_entry_trampoline as usize as u64,
        rbx: 0,
        rbp: 0,
        r12: entry_fn as usize as u64,
        r13: entry_arg as u64,
        r14: 0,
        r15: 0,
    };
}

/// Landing pad for a context's first switch-in: moves the entry argument
/// into the calling convention's first parameter register and calls the
/// entry function. The entry function is contracted to never return; the
/// `call` to `trampoline_escaped` below is a trap for a protocol
/// violation, not a normal path.
#[unsafe(naked)]
unsafe extern "C" fn context_entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "call {escaped}",
        "ud2",
        escaped = sym trampoline_escaped,
    );
}

extern "C" fn trampoline_escaped() -> ! {
    panic!("rex-runtime: base runner returned instead of looping forever");
}

/// Save the caller's registers into `from`, load `to`'s, and jump. Returns
/// (from the caller's point of view) once some later `switch` targets
/// `from` again — this is the one function whose "return" happens on a
/// different logical stack state than its "call".
///
/// # Safety
///
/// Both pointers must reference live, correctly initialized `SavedRegs`;
/// `to` must have been produced by [`init_context`] or a prior `switch`
/// that saved into it.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(_from: *mut SavedRegs, _to: *const SavedRegs) {
    naked_asm!(
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        "1:",
        "ret",
    );
}
