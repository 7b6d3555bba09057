//! Two-mode execution context (spec.md §4.3): a sandbox's saved machine
//! state, either a cooperative "fast" save (stack pointer only) or a
//! signal-captured "slow" save (full register file). All raw register
//! access is confined to `context::arch::x86_64`; this module only
//! decides *which* resume path to use and owns the `ucontext_t` copy
//! for the slow path.

pub mod arch;
pub mod signal;

use arch::x86_64 as arch_impl;

/// How a `Context`'s saved state was produced, and therefore how it
/// must be resumed. Observing `Running` in a runqueue is a fatal
/// invariant violation (spec.md §7) — a sandbox's context is only
/// `Running` while it is the one actually executing on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextVariant {
    /// Constructed but never yet entered; `sp`/`ip` point at a freshly
    /// built stack and its entrypoint.
    Unused,
    /// Cooperatively yielded; resumable via `arch::switch_cooperative`.
    Fast,
    /// Captured out of a signal handler; resumable only by re-entering
    /// the signal machinery.
    Slow,
    /// Currently the executing context of some worker.
    Running,
}

/// A sandbox's saved execution state. `sp`/`ip` are always meaningful;
/// `slow_regs` is populated only when `variant == Slow`.
pub struct Context {
    sp: usize,
    ip: usize,
    slow_regs: Option<Box<libc::ucontext_t>>,
    variant: ContextVariant,
}

impl Context {
    /// Builds the `Unused` context for a freshly allocated sandbox:
    /// `stack_top` is one-past-the-end of the sandbox's fiber stack,
    /// `entry` is the trampoline the sandbox's code actually starts
    /// running at (see `sandbox::sandbox_entry_trampoline`).
    pub fn new_unused(stack_top: *mut u8, entry: extern "C" fn() -> !) -> Self {
        let sp = unsafe { arch_impl::prepare_stack(stack_top, entry) };
        Self {
            sp,
            ip: entry as usize,
            slow_regs: None,
            variant: ContextVariant::Unused,
        }
    }

    pub fn variant(&self) -> ContextVariant {
        self.variant
    }

    /// Marks this context as the one currently executing. Called by
    /// the worker loop immediately before switching onto it.
    pub fn mark_running(&mut self) {
        self.variant = ContextVariant::Running;
    }

    /// Records a cooperative yield: `sp` is the parked stack pointer
    /// returned by `arch::switch_cooperative`.
    pub fn save_fast(&mut self, sp: usize) {
        self.sp = sp;
        self.slow_regs = None;
        self.variant = ContextVariant::Fast;
    }

    /// Records a signal-captured save: clones the handler's
    /// `ucontext_t` so it outlives the handler invocation.
    ///
    /// # Safety
    /// Must only be called from within a signal handler with a valid
    /// `ucontext_t` pointer delivered by the kernel.
    pub unsafe fn save_slow(&mut self, ucontext: *const libc::ucontext_t) {
        let cloned = Box::new(std::ptr::read(ucontext));
        self.sp = cloned.uc_mcontext.gregs[libc::REG_RSP as usize] as usize;
        self.ip = cloned.uc_mcontext.gregs[libc::REG_RIP as usize] as usize;
        self.slow_regs = Some(cloned);
        self.variant = ContextVariant::Slow;
    }

    /// Rewrites an *outgoing* signal handler's `ucontext_t` so that,
    /// once the handler returns, the kernel's `sigreturn` installs this
    /// context's saved registers — the only way to restore an arbitrary
    /// full register file from ordinary code (spec.md §4.3 "Slow-path
    /// save/restore"). Used both for resuming a `Slow` context and,
    /// uniformly, for resuming `Unused`/`Fast` contexts from within the
    /// preemption handler (no separate cooperative switch is needed
    /// there, since `sigreturn` can set `rsp`/`rip` directly).
    ///
    /// # Safety
    /// Must be called with the same `ucontext_t` the calling signal
    /// handler was invoked with, and only while still inside that
    /// handler (before it returns).
    pub unsafe fn splice_into_outgoing_signal(&mut self, ucontext: *mut libc::ucontext_t) {
        match self.variant {
            ContextVariant::Slow => {
                let saved = self
                    .slow_regs
                    .as_ref()
                    .expect("Slow context missing captured registers");
                std::ptr::write(ucontext, std::ptr::read(saved.as_ref()));
            }
            ContextVariant::Unused | ContextVariant::Fast => {
                let gregs = &mut (*ucontext).uc_mcontext.gregs;
                gregs[libc::REG_RSP as usize] = self.sp as i64;
                gregs[libc::REG_RIP as usize] = arch_impl::fast_resume_trampoline_addr() as i64;
            }
            ContextVariant::Running => {
                std::process::abort();
            }
        }
        self.variant = ContextVariant::Running;
    }
}

thread_local! {
    /// The worker loop's own parked stack pointer while some sandbox's
    /// context is running. Shared, symmetric handoff point: whichever
    /// side isn't currently running finds its resume point here.
    static SCHEDULER_RETURN_SP: std::cell::Cell<usize> = std::cell::Cell::new(0);
}

/// Switches the calling worker thread onto `context` cooperatively.
/// Returns once `context` has yielded or completed, with that parked
/// stack pointer — the caller must hand it to `context.save_fast(..)`
/// (or leave the context `Complete`/`Error` and drop it instead).
///
/// Only valid when `context.variant()` is `Unused` or `Fast`; resuming
/// a `Slow` context must go through `signal::resume_slow_via_self_signal`
/// instead.
///
/// # Safety
/// Must be called from the worker loop itself, never from within
/// sandbox-side code, and never while another switch on this thread is
/// already in flight.
pub unsafe fn switch_onto(context: &mut Context) -> usize {
    debug_assert!(matches!(context.variant, ContextVariant::Unused | ContextVariant::Fast));
    let slot = SCHEDULER_RETURN_SP.with(|c| c.as_ptr());
    let target_sp = context.sp;
    context.mark_running();
    arch_impl::switch_cooperative(&mut *slot, target_sp);
    *slot
}

/// Redirects an *outgoing* signal handler's `ucontext_t` so that, once
/// the handler returns, execution resumes inside whichever
/// `switch_onto` call is currently parked on this thread — used by the
/// preemption handler once it has finished capturing the interrupted
/// sandbox's own registers via `Context::save_slow`. Unlike
/// `Context::splice_into_outgoing_signal`, this doesn't target a
/// specific sandbox's saved state; it targets the scheduler's own
/// resume point, the same one `yield_to_scheduler` would jump to.
///
/// # Safety
/// Must be called from within the signal handler whose `ucontext_t` is
/// passed, before it returns, and only when some `switch_onto` call
/// (directly, or via `signal::resume_slow_via_self_signal`'s throwaway
/// landing stack) is genuinely parked on this thread.
pub unsafe fn splice_outgoing_signal_to_scheduler(ucontext: *mut libc::ucontext_t) {
    let slot = SCHEDULER_RETURN_SP.with(|c| c.as_ptr());
    let gregs = &mut (*ucontext).uc_mcontext.gregs;
    gregs[libc::REG_RSP as usize] = *slot as i64;
    gregs[libc::REG_RIP as usize] = arch_impl::fast_resume_trampoline_addr() as i64;
}

/// Cooperatively yields control back to whichever worker most recently
/// called `switch_onto` for the stack this runs on. Only ever called
/// from sandbox-side code (the entry trampoline, or a host call that
/// wants to hand control back before the sandbox is done).
///
/// # Safety
/// Must be called only from a stack that was entered via `switch_onto`.
pub unsafe fn yield_to_scheduler() {
    let slot = SCHEDULER_RETURN_SP.with(|c| c.as_ptr());
    let scheduler_sp = *slot;
    arch_impl::switch_cooperative(&mut *slot, scheduler_sp);
}
