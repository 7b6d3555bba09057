//! Sandbox lifecycle (spec.md §4.4): the state machine a single
//! scheduled unit of work moves through, the fiber stack its compiled
//! code runs on, and the per-state duration accounting used for the
//! sandbox-perf log.
//!
//! The linear memory a sandbox's WASM module actually executes in is
//! owned by `sledge-worker` (via `wasmtime::Memory`); this crate only
//! owns the *scheduler's* side of a sandbox — its deadline, its
//! cooperative fiber stack, and its `Context`. `program` is an opaque
//! closure supplied by the embedder so this crate never depends on
//! wasmtime directly, mirroring the Dispatcher boundary in
//! `dispatcher.rs`.

use std::sync::Arc;

use sledge_common::Route;

use crate::context::{self, Context};
use crate::SandboxError;

/// A sandbox's position in its lifecycle. Spec.md's parameterized
/// `Running{User,Sys}` is flattened into two plain variants; Rust enums
/// don't need a mode field to express that split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SandboxState {
    Uninitialized = 0,
    Allocated,
    Initialized,
    Runnable,
    RunningUser,
    RunningSys,
    Preempted,
    Asleep,
    Returned,
    Complete,
    Error,
}

impl SandboxState {
    pub const COUNT: usize = 11;

    pub fn is_terminal(self) -> bool {
        matches!(self, SandboxState::Complete | SandboxState::Error)
    }
}

/// A fixed-size, guard-free fiber stack backing one sandbox's cooperative
/// execution. Allocated with `mmap` rather than a `Vec<u8>` so its
/// address is stable regardless of the owning `Sandbox` moving (the
/// `Context`'s `sp` points into it, but the backing allocation itself
/// never moves even though the `FiberStack` handle does).
struct FiberStack {
    base: *mut u8,
    len: usize,
}

impl FiberStack {
    fn new(len: usize) -> Result<Self, SandboxError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(SandboxError::MemoryLimitExceeded { limit_bytes: len });
        }
        Ok(Self {
            base: ptr as *mut u8,
            len,
        })
    }

    fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.len) }
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

// Safety: the stack is only ever touched by the worker thread that owns
// the sandbox at any given time; ownership transfer happens by moving
// the whole `Sandbox`, never by sharing.
unsafe impl Send for FiberStack {}

type ProgramFn = dyn FnMut() -> Result<Vec<u8>, SandboxError> + Send;

thread_local! {
    /// Set by the worker loop immediately before `context::switch_onto`,
    /// read exactly once by `sandbox_entry_trampoline`. There is no
    /// other way to pass the sandbox being entered into an
    /// `extern "C" fn() -> !` with no arguments.
    static ENTERING: std::cell::Cell<Option<*mut Sandbox>> = std::cell::Cell::new(None);
}

/// The single entrypoint every sandbox's fiber stack is constructed to
/// jump to on its first resume (`Context::new_unused`).
pub extern "C" fn sandbox_entry_trampoline() -> ! {
    let sandbox_ptr = ENTERING
        .with(|c| c.take())
        .expect("sandbox entry trampoline invoked without a pending sandbox");
    let sandbox = unsafe { &mut *sandbox_ptr };
    sandbox.run_to_completion();
    // `run_to_completion` always leaves the sandbox in a terminal
    // state and yields back to the scheduler; nothing should resume
    // this stack again, but if it somehow is, yield right back rather
    // than run off the end of the function.
    loop {
        unsafe { context::yield_to_scheduler() };
    }
}

/// A scheduled unit of work: one WASM invocation against a `Route`,
/// tracked from admission through completion.
pub struct Sandbox {
    pub id: u64,
    pub route: Arc<Route>,
    pub arrival_cycles: u64,
    pub absolute_deadline: u64,
    /// Remaining estimated cost, in cycles. Decremented on preemption
    /// by elapsed time since dispatch (SPEC_FULL.md §9 decision 2).
    pub estimated_remaining_cost: u64,
    state: SandboxState,
    last_transition_cycles: u64,
    duration_of_state: [u64; SandboxState::COUNT],
    context: Context,
    stack: FiberStack,
    program: Option<Box<ProgramFn>>,
    pub result: Option<Result<Vec<u8>, SandboxError>>,
}

impl Sandbox {
    /// Allocates a sandbox's fiber stack and constructs its initial
    /// `Context`. `program` runs the first time this sandbox is
    /// dispatched; it must not block indefinitely — cooperative yields
    /// happen only at points it chooses to call back into the host.
    pub fn allocate(
        id: u64,
        route: Arc<Route>,
        arrival_cycles: u64,
        stack_size: usize,
        program: Box<ProgramFn>,
    ) -> Result<Self, SandboxError> {
        let stack = FiberStack::new(stack_size)?;
        let context = Context::new_unused(stack.top(), sandbox_entry_trampoline);
        let absolute_deadline = route.absolute_deadline(arrival_cycles);
        Ok(Self {
            id,
            estimated_remaining_cost: route.expected_execution_us,
            route,
            arrival_cycles,
            absolute_deadline,
            state: SandboxState::Allocated,
            last_transition_cycles: arrival_cycles,
            duration_of_state: [0; SandboxState::COUNT],
            context,
            stack,
            program: Some(program),
            result: None,
        })
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Exposes the sandbox's `Context` to the preemption handler, which
    /// needs to save into and splice out of it directly. Not public
    /// outside the crate: nothing but `worker`'s signal handler should
    /// touch a `Context` mid-flight.
    pub(crate) fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub fn duration_of_state(&self, state: SandboxState) -> u64 {
        self.duration_of_state[state as usize]
    }

    /// Records a state transition, folding the time spent in the
    /// outgoing state into `duration_of_state`. Called by the worker
    /// loop and the preemption handler; the latter must keep this
    /// allocation-free, which it is — a flat array write, matching the
    /// original's `sandbox_state_totals` (SPEC_FULL.md §3).
    pub fn transition(&mut self, new_state: SandboxState, now_cycles: u64) {
        let elapsed = now_cycles.saturating_sub(self.last_transition_cycles);
        self.duration_of_state[self.state as usize] += elapsed;
        self.state = new_state;
        self.last_transition_cycles = now_cycles;
    }

    /// Runs this sandbox cooperatively on the calling worker thread
    /// until it yields (still `Runnable`-bound-for-`Preempted`) or
    /// completes. The caller is responsible for `transition`ing into
    /// `RunningUser` beforehand and interpreting the resulting state
    /// afterward.
    ///
    /// # Safety
    /// Must only be called by the worker thread that currently owns
    /// this sandbox (i.e. after popping it off a `Runqueue`).
    pub unsafe fn dispatch_once(&mut self) {
        ENTERING.with(|c| c.set(Some(self as *mut Sandbox)));
        let parked_sp = if self.context.variant() == context::ContextVariant::Slow {
            context::signal::resume_slow_via_self_signal(&mut self.context)
        } else {
            context::switch_onto(&mut self.context)
        };
        // If a preemption handler fired during that call, it already
        // recorded a fresh `Slow` save and redirected us here via
        // `splice_outgoing_signal_to_scheduler`; only an ordinary
        // cooperative yield or completion leaves the context `Running`
        // at this point, and only those need a fast-path save.
        if self.context.variant() == context::ContextVariant::Running {
            self.context.save_fast(parked_sp);
        }
    }

    fn run_to_completion(&mut self) {
        let mut program = self.program.take().expect("program already consumed");
        let outcome = program();
        let terminal = match &outcome {
            Ok(_) => SandboxState::Returned,
            Err(_) => SandboxState::Error,
        };
        self.transition(terminal, crate::worker::now_cycles());
        self.result = Some(outcome);
    }
}

impl crate::TreeEntry for Sandbox {
    fn entry_id(&self) -> u64 {
        self.id
    }

    fn cost(&self) -> u64 {
        self.estimated_remaining_cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sledge_common::{RouteCounters, RouteId, TenantId};
    use uuid::Uuid;

    fn test_route() -> Arc<Route> {
        Arc::new(Route {
            id: RouteId(Uuid::new_v4()),
            tenant: TenantId(Uuid::new_v4()),
            url_prefix: "/fn".to_string(),
            module_path: "unused.wasm".to_string(),
            relative_deadline_cycles: 10_000,
            response_size_limit_bytes: 4096,
            content_type: "application/json".to_string(),
            admissions_percentile: 50,
            expected_execution_us: 100,
            counters: RouteCounters::default(),
        })
    }

    #[test]
    fn allocate_starts_in_allocated_state_with_computed_deadline() {
        let route = test_route();
        let sandbox = Sandbox::allocate(1, route.clone(), 1_000, 64 * 1024, Box::new(|| Ok(Vec::new())))
            .unwrap();
        assert_eq!(sandbox.state(), SandboxState::Allocated);
        assert_eq!(sandbox.absolute_deadline, 11_000);
    }

    #[test]
    fn transition_accumulates_duration_of_outgoing_state() {
        let route = test_route();
        let mut sandbox =
            Sandbox::allocate(1, route, 0, 64 * 1024, Box::new(|| Ok(Vec::new()))).unwrap();
        sandbox.transition(SandboxState::Initialized, 50);
        sandbox.transition(SandboxState::Runnable, 120);
        assert_eq!(sandbox.duration_of_state(SandboxState::Allocated), 50);
        assert_eq!(sandbox.duration_of_state(SandboxState::Initialized), 70);
    }

    #[test]
    fn dispatch_once_runs_program_to_completion() {
        let route = test_route();
        let mut sandbox = Sandbox::allocate(
            7,
            route,
            0,
            64 * 1024,
            Box::new(|| Ok(b"hello".to_vec())),
        )
        .unwrap();
        sandbox.transition(SandboxState::RunningUser, 0);
        unsafe { sandbox.dispatch_once() };
        assert_eq!(sandbox.state(), SandboxState::Returned);
        assert_eq!(sandbox.result.unwrap().unwrap(), b"hello".to_vec());
    }
}
