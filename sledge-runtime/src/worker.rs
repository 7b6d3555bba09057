//! Worker Loop & Preemption Handler (spec.md §4.6): one OS thread per
//! core, pinned via `sched_setaffinity`, cooperatively running
//! sandboxes popped off its own `Runqueue` and preemptible at any
//! instant by `SIGVTALRM`.
//!
//! Grounded on `original_source/runtime/src/worker_thread.c`'s
//! dispatch loop and `runtime.c`'s thread-pinning setup; the teacher
//! has no equivalent (none of its services run real-time pinned
//! threads), so the ambient pieces here (tracing spans around each
//! dispatch) still follow the teacher's instrumentation style even
//! though the loop itself is new.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::context;
use crate::context::signal::{self, with_interrupts_masked};
use crate::runqueue::Runqueue;
use crate::sandbox::{Sandbox, SandboxState};
use crate::SandboxError;

/// Reads the TSC, falling back to a monotonic clock's nanoseconds on
/// platforms (or in tests) where `rdtsc` isn't appropriate to rely on
/// for cross-core comparisons. Used wherever spec.md speaks of "cycles"
/// as a deadline unit.
pub fn now_cycles() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
    }
}

/// Pins the calling thread to `core_id`, matching the original's
/// per-worker `pthread_setaffinity_np` call. Best-effort: a failure is
/// logged, not fatal, since running un-pinned only degrades scheduling
/// fairness rather than correctness.
fn pin_to_core(core_id: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = MaybeUninit::zeroed().assume_init();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core_id, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            warn!(core_id, error = %std::io::Error::last_os_error(), "failed to pin worker thread");
        }
    }
}

/// Installs the `SIGVTALRM` preemption timer for the calling thread and
/// arms it to fire every `slice`. The handler itself is a free function
/// below; it reaches the owning `Worker` through a thread-local set by
/// `Worker::run`.
fn install_preemption_timer(slice: Duration) {
    unsafe {
        let mut action: libc::sigaction = MaybeUninit::zeroed().assume_init();
        action.sa_sigaction = handle_preemption_signal as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGVTALRM, &action, std::ptr::null_mut()) != 0 {
            panic!("sigaction(SIGVTALRM) failed: {}", std::io::Error::last_os_error());
        }

        let interval = libc::timeval {
            tv_sec: slice.as_secs() as libc::time_t,
            tv_usec: slice.subsec_micros() as libc::suseconds_t,
        };
        let timer = libc::itimerval {
            it_interval: interval,
            it_value: interval,
        };
        if libc::setitimer(libc::ITIMER_VIRTUAL, &timer, std::ptr::null_mut()) != 0 {
            panic!("setitimer failed: {}", std::io::Error::last_os_error());
        }
    }
    signal::install_restore_signal_handler();
}

thread_local! {
    /// The sandbox currently `Running{User,Sys}` on this thread, if
    /// any. Read by the `SIGVTALRM` handler to decide what to preempt;
    /// written only by `Worker::run` inside
    /// `with_interrupts_masked`-adjacent bookkeeping, never inside the
    /// handler itself.
    static CURRENT_SANDBOX: std::cell::Cell<Option<*mut Sandbox>> = std::cell::Cell::new(None);

    /// Count of `SIGVTALRM` deliveries this worker deferred because
    /// they landed inside an interrupts-masked critical section.
    static DEFERRED_PREEMPTIONS: AtomicU64 = AtomicU64::new(0);
}

extern "C" fn handle_preemption_signal(
    _signo: libc::c_int,
    _info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    if signal::interrupts_masked() {
        DEFERRED_PREEMPTIONS.with(|c| c.fetch_add(1, Ordering::Relaxed));
        return;
    }
    let Some(sandbox_ptr) = CURRENT_SANDBOX.with(|c| c.get()) else {
        // Timer fired with no sandbox running (idle worker); nothing to do.
        return;
    };
    unsafe {
        let sandbox = &mut *sandbox_ptr;
        if matches!(sandbox.state(), SandboxState::RunningSys) {
            // spec.md §4.6: preemption during a host call is not safe
            // without a cooperative safe-point (SPEC_FULL.md §9
            // decision 3); defer until the sandbox returns to user code.
            return;
        }
        sandbox
            .context_mut()
            .save_slow(ucontext as *const libc::ucontext_t);
        sandbox.transition(SandboxState::Preempted, now_cycles());
        context::splice_outgoing_signal_to_scheduler(ucontext as *mut libc::ucontext_t);
    }
}

/// One pinned worker thread's cooperative/preemptive dispatch loop.
pub struct Worker {
    pub runqueue: Arc<Runqueue>,
    core_id: usize,
    time_slice: Duration,
    /// Invoked once for every sandbox that reaches a terminal state,
    /// just before it is dropped. Lets an embedder (the sandbox-perf CSV
    /// log, in `sledge-worker`) observe final per-state durations
    /// without this crate depending on anything outside itself.
    on_terminal: Option<Arc<dyn Fn(&Sandbox) + Send + Sync>>,
}

impl Worker {
    pub fn new(runqueue: Arc<Runqueue>, core_id: usize, time_slice: Duration) -> Self {
        Self {
            runqueue,
            core_id,
            time_slice,
            on_terminal: None,
        }
    }

    pub fn with_terminal_hook(mut self, hook: Arc<dyn Fn(&Sandbox) + Send + Sync>) -> Self {
        self.on_terminal = Some(hook);
        self
    }

    /// Blocks forever, dispatching sandboxes until the process exits.
    /// Intended to be the body of a dedicated `std::thread::Builder`
    /// thread.
    pub fn run(&self) -> ! {
        pin_to_core(self.core_id);
        install_preemption_timer(self.time_slice);
        info!(core_id = self.core_id, "worker loop started");

        loop {
            let Some(mut sandbox) = self.runqueue.pop_min() else {
                std::thread::yield_now();
                continue;
            };

            let now = now_cycles();
            if now > sandbox.absolute_deadline {
                warn!(
                    sandbox_id = sandbox.id,
                    lateness_cycles = now - sandbox.absolute_deadline,
                    "dropping sandbox: deadline missed before dispatch"
                );
                sandbox.transition(SandboxState::Error, now);
                if let Some(hook) = &self.on_terminal {
                    hook(&sandbox);
                }
                continue;
            }

            with_interrupts_masked(|| {
                sandbox.transition(SandboxState::RunningUser, now_cycles());
                CURRENT_SANDBOX.with(|c| c.set(Some(&mut sandbox as *mut Sandbox)));
            });

            // SAFETY: this thread owns `sandbox` exclusively; it was
            // just popped off the runqueue and nothing else holds a
            // reference to it.
            unsafe { sandbox.dispatch_once() };

            CURRENT_SANDBOX.with(|c| c.set(None));

            match sandbox.state() {
                SandboxState::Preempted => {
                    debug!(sandbox_id = sandbox.id, "sandbox preempted, requeueing");
                    let elapsed = now_cycles().saturating_sub(now);
                    sandbox.estimated_remaining_cost =
                        sandbox.estimated_remaining_cost.saturating_sub(elapsed);
                    if let Err(err) = self.runqueue.push(sandbox) {
                        error!(%err, "failed to requeue preempted sandbox");
                    }
                }
                SandboxState::Returned => {
                    sandbox.transition(SandboxState::Complete, now_cycles());
                    debug!(sandbox_id = sandbox.id, "sandbox completed");
                    if let Some(hook) = &self.on_terminal {
                        hook(&sandbox);
                    }
                }
                SandboxState::Error => {
                    let message = sandbox
                        .result
                        .as_ref()
                        .and_then(|r| r.as_ref().err())
                        .map(SandboxError::to_string)
                        .unwrap_or_else(|| "unknown error".to_string());
                    warn!(sandbox_id = sandbox.id, %message, "sandbox terminated in error");
                    if let Some(hook) = &self.on_terminal {
                        hook(&sandbox);
                    }
                }
                other => {
                    error!(sandbox_id = sandbox.id, ?other, "unexpected post-dispatch state");
                    std::process::abort();
                }
            }
        }
    }
}
