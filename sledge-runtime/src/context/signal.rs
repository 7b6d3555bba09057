//! Installs the preemption timer (`SIGVTALRM`) and restore (`SIGUSR1`)
//! signal handlers a worker thread needs, and the thread-local state
//! they coordinate through. Grounded on
//! `original_source/runtime/src/worker_thread.c`'s `sigaction`/
//! `setitimer` setup.
//!
//! `SIGVTALRM` fires on the pinned worker thread's *virtual* CPU time
//! (user-mode execution only), which is why it is the preemption timer
//! rather than `SIGALRM` — a sandbox that blocks on a host call doesn't
//! burn its own slice. `SIGUSR1` exists solely so plain (non-handler)
//! code can ask the kernel to rehydrate a full `Slow` register set: you
//! cannot `mov` an arbitrary `ucontext_t` into the live register file
//! from ordinary instructions, so the worker raises `SIGUSR1` at itself
//! and the handler below splices the pending `Slow` context into its
//! own `ucontext_t` before returning, letting `sigreturn` do it.

use std::cell::{Cell, RefCell};
use std::mem::MaybeUninit;

use crate::context::{self, Context};

thread_local! {
    /// Set by the worker loop immediately before raising `SIGUSR1` at
    /// itself to resume a `Slow` context; taken by the handler.
    static PENDING_SLOW_RESUME: RefCell<Option<*mut Context>> = RefCell::new(None);

    /// Interrupts-masked flag (spec.md §4.6 "interrupts masked"
    /// critical sections). `SIGVTALRM` delivery during a masked region
    /// is deferred by the handler re-raising itself after unmasking,
    /// rather than acting immediately, so runqueue/slab mutations are
    /// never observed half-done by the handler.
    static INTERRUPTS_MASKED: Cell<bool> = Cell::new(false);
}

/// Runs `f` with `SIGVTALRM` delivery deferred. Nested calls are not
/// supported; the worker loop never nests these regions.
pub fn with_interrupts_masked<R>(f: impl FnOnce() -> R) -> R {
    INTERRUPTS_MASKED.set(true);
    let result = f();
    INTERRUPTS_MASKED.set(false);
    result
}

pub fn interrupts_masked() -> bool {
    INTERRUPTS_MASKED.get()
}

thread_local! {
    /// Scratch stack `resume_slow_via_self_signal` jumps onto just
    /// long enough to call `raise(SIGUSR1)`. It is never resumed back
    /// into meaningfully (the handler always redirects away from it),
    /// so one small buffer is reused across every slow-resume on this
    /// thread rather than allocating per call.
    static RAISE_LANDING_STACK: RefCell<Box<[u8]>> = RefCell::new(vec![0u8; 8 * 1024].into_boxed_slice());
}

extern "C" fn raise_sigusr1_trampoline() -> ! {
    unsafe { libc::raise(libc::SIGUSR1) };
    // Reached only if SIGUSR1 delivery didn't redirect us away, which
    // means `PENDING_SLOW_RESUME` was empty — a scheduler bug, not a
    // recoverable condition.
    std::process::abort();
}

/// Resumes a `Slow`-variant context by raising `SIGUSR1` at this
/// thread: the only way to rehydrate an arbitrary full register file
/// from ordinary (non-handler) code is to have the kernel's
/// `sigreturn` do it. Behaves like `context::switch_onto` otherwise —
/// blocks until the sandbox yields or is preempted again, then returns
/// its parked stack pointer.
///
/// # Safety
/// `context` must currently hold a `Slow`-variant saved register set,
/// and must outlive the call.
pub unsafe fn resume_slow_via_self_signal(context: &mut Context) -> usize {
    PENDING_SLOW_RESUME.with(|slot| *slot.borrow_mut() = Some(context as *mut Context));
    RAISE_LANDING_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let top = stack.as_mut_ptr().wrapping_add(stack.len());
        let mut throwaway = Context::new_unused(top, raise_sigusr1_trampoline);
        context::switch_onto(&mut throwaway)
    })
}

extern "C" fn handle_restore_signal(
    _signo: libc::c_int,
    _info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let pending = PENDING_SLOW_RESUME.with(|slot| slot.borrow_mut().take());
    let Some(context) = pending else {
        std::process::abort();
    };
    unsafe {
        (*context).splice_into_outgoing_signal(ucontext as *mut libc::ucontext_t);
    }
}

/// The `SIGVTALRM` handler is installed separately by
/// `worker::install_preemption_timer`, which also owns the per-worker
/// "what to switch to" decision; this module only provides the
/// `SIGUSR1` half, since it has no scheduling policy to apply.
pub fn install_restore_signal_handler() {
    unsafe {
        let mut action: libc::sigaction = MaybeUninit::zeroed().assume_init();
        action.sa_sigaction = handle_restore_signal as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()) != 0 {
            panic!(
                "sigaction(SIGUSR1) failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}
