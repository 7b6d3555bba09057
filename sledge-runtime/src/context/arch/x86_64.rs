//! x86_64 register save/restore primitives. This is the only module in
//! the crate permitted to touch raw registers (design note "Two-mode
//! context switch" / "confine all architecture-specific inline assembly
//! to one module"). Grounded on
//! `original_source/runtime/include/arch/x86_64/context.h`; `aarch64`
//! (also named in the original) is out of scope for this rewrite —
//! see SPEC_FULL.md §9 decision 4 / Non-goals.
//!
//! Two distinct resume paths exist, matching spec.md §4.3:
//!
//! - **Cooperative ("fast")**: `switch_cooperative` pushes the six
//!   callee-saved registers, records `rsp`, loads the target `rsp`, and
//!   pops whatever callee-saved registers are waiting there before
//!   `ret`-ing — continuing wherever that stack last cooperatively
//!   yielded. A freshly constructed sandbox stack (`prepare_stack`) is
//!   seeded to look exactly like a parked cooperative frame, so
//!   "jump to a brand new entrypoint" and "resume a previously-yielded
//!   sandbox" are the same instruction sequence.
//! - **Signal-driven ("slow")**: a full register file, captured from a
//!   signal handler's `ucontext_t`. There is no instruction sequence
//!   that can load an arbitrary register file from ordinary code
//!   (short of one register at a time), so restoring a slow context
//!   always goes back through the kernel's `sigreturn` path — either
//!   because we're already inside a handler (the preemption handler can
//!   simply overwrite its own outgoing `ucontext_t` before returning)
//!   or by raising a restore signal at ourselves (`rt::signal`) when
//!   we're not.

use std::arch::global_asm;
use std::mem::size_of;

/// Registers `fast_switch` pushes before parking a stack. Exists here
/// purely to document the asm's frame shape and to size the
/// placeholder frame `prepare_stack` writes for a brand-new sandbox.
#[repr(C)]
struct CalleeSaved {
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

extern "C" {
    fn sledge_fast_switch(save_sp: *mut usize, new_sp: usize);
    fn sledge_fast_resume_trampoline();
}

global_asm!(
    ".text",
    ".global sledge_fast_switch",
    "sledge_fast_switch:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

global_asm!(
    ".text",
    ".global sledge_fast_resume_trampoline",
    "sledge_fast_resume_trampoline:",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

/// Address of the trampoline a signal-restored "fast" resume must jump
/// to, since the target `rsp` only makes sense when followed by this
/// pop sequence (see `restore_fast_via_ucontext` in `context/mod.rs`).
pub fn fast_resume_trampoline_addr() -> usize {
    sledge_fast_resume_trampoline as usize
}

/// Cooperative switch out of the current stack and into `new_sp`.
/// `*save_sp` receives the outgoing stack's parked `rsp`. Never called
/// directly by anything outside `context/mod.rs`.
pub unsafe fn switch_cooperative(save_sp: &mut usize, new_sp: usize) {
    sledge_fast_switch(save_sp as *mut usize, new_sp);
}

/// Builds the initial frame for a freshly allocated sandbox stack so
/// that the first cooperative resume lands at `entry`, matching
/// spec.md's "freshly created Runnable sandboxes carry ... a
/// constructed stack pointing at the entrypoint." Returns the `sp`
/// value to record in the sandbox's `Context`.
///
/// # Safety
/// `stack_top` must point one-past-the-end of a valid, writable stack
/// region at least `size_of::<CalleeSaved>() + 16` bytes in size.
pub unsafe fn prepare_stack(stack_top: *mut u8, entry: extern "C" fn() -> !) -> usize {
    let mut sp = (stack_top as usize) & !0xf;
    sp -= size_of::<usize>();
    (sp as *mut usize).write(entry as usize);
    sp -= size_of::<CalleeSaved>();
    std::ptr::write_bytes(sp as *mut u8, 0, size_of::<CalleeSaved>());
    sp
}
