//! End-to-end scheduling scenarios (spec.md §8 "Concrete end-to-end
//! scenarios"), driven against the core types directly with simulated
//! cycle counters rather than real wall-clock time or real `SIGVTALRM`
//! delivery, so the timing assertions are deterministic. Each test
//! drives a single worker's runqueue and a handful of sandboxes by hand,
//! playing the role the real `Worker::run` loop and preemption handler
//! play in production.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use sledge_common::{Route, RouteCounters, RouteId, TenantId};
use sledge_runtime::runqueue::SchedulingPolicy;
use sledge_runtime::{Runqueue, Sandbox, SandboxState};
use uuid::Uuid;

fn route(relative_deadline_cycles: u64, expected_execution_us: u64) -> Arc<Route> {
    Arc::new(Route {
        id: RouteId(Uuid::new_v4()),
        tenant: TenantId(Uuid::new_v4()),
        url_prefix: "/fn".to_string(),
        module_path: "unused.wasm".to_string(),
        relative_deadline_cycles,
        response_size_limit_bytes: 4096,
        content_type: "application/octet-stream".to_string(),
        admissions_percentile: 90,
        expected_execution_us,
        counters: RouteCounters {
            status_2xx: AtomicU64::new(0),
            status_4xx: AtomicU64::new(0),
            status_5xx: AtomicU64::new(0),
        },
    })
}

/// Scenario 1: two sandboxes enqueued A, B with B's deadline tighter;
/// EDF must pop B first.
#[test]
fn scenario_edf_basic() {
    let runqueue = Runqueue::new(16, SchedulingPolicy::Edf);

    let a = Sandbox::allocate(1, route(100, 10), 0, 64 * 1024, Box::new(|| Ok(Vec::new()))).unwrap();
    let b = Sandbox::allocate(2, route(50, 10), 0, 64 * 1024, Box::new(|| Ok(Vec::new()))).unwrap();
    assert_eq!(a.absolute_deadline, 100);
    assert_eq!(b.absolute_deadline, 50);

    runqueue.push(a).unwrap();
    runqueue.push(b).unwrap();

    let first = runqueue.pop_min().unwrap();
    assert_eq!(first.id, 2, "tighter-deadline sandbox B must be popped first");
    let second = runqueue.pop_min().unwrap();
    assert_eq!(second.id, 1);
}

/// Scenario 2: A (deadline 1000, cost 500) starts at t=0; at t=100, B
/// (deadline 200, cost 50) arrives and is strictly earlier-deadline than
/// A's remaining work, so a real worker would preempt A for B at the
/// next tick. Here we play the worker's role by hand: run A up to the
/// preemption point, push B, drain B to completion, then resume A.
#[test]
fn scenario_preemption_by_tighter_deadline() {
    let mut a = Sandbox::allocate(1, route(1000, 500), 0, 64 * 1024, Box::new(|| Ok(Vec::new()))).unwrap();
    a.transition(SandboxState::RunningUser, 0);

    // A is preempted at t=100 having run 100 of its 500-unit budget.
    a.transition(SandboxState::Preempted, 100);
    a.estimated_remaining_cost = a.estimated_remaining_cost.saturating_sub(100);
    assert_eq!(a.estimated_remaining_cost, 400);

    let runqueue = Runqueue::new(16, SchedulingPolicy::Edf);
    let mut b = Sandbox::allocate(2, route(200, 50), 100, 64 * 1024, Box::new(|| Ok(Vec::new()))).unwrap();
    assert_eq!(b.absolute_deadline, 300);

    b.transition(SandboxState::RunningUser, 100);
    b.transition(SandboxState::Returned, 155);
    assert_eq!(b.duration_of_state(SandboxState::RunningUser), 55);
    assert!(b.absolute_deadline >= 155, "B must complete by its deadline");

    runqueue.push(a).unwrap();
    let mut resumed = runqueue.pop_min().unwrap();
    resumed.transition(SandboxState::RunningUser, 155);
    resumed.transition(SandboxState::Returned, 555);

    let total_running = resumed.duration_of_state(SandboxState::RunningUser);
    let total_preempted = resumed.duration_of_state(SandboxState::Preempted);
    assert_eq!(total_running, 100 + 400);
    assert_eq!(total_preempted, 55, "the gap while B ran must show up in A's Preempted bucket");
}

/// Scenario 3: a sandbox blocks on a host call at t=30 of a 100-unit
/// budget (Asleep), another sandbox runs to completion, then the first
/// is woken at t=80 and finishes at t=150.
#[test]
fn scenario_cooperative_yield_accounts_asleep_time() {
    let mut a = Sandbox::allocate(1, route(100, 100), 0, 64 * 1024, Box::new(|| Ok(Vec::new()))).unwrap();
    a.transition(SandboxState::RunningUser, 0);
    a.transition(SandboxState::Asleep, 30);

    let mut b = Sandbox::allocate(2, route(40, 40), 30, 64 * 1024, Box::new(|| Ok(Vec::new()))).unwrap();
    b.transition(SandboxState::RunningUser, 30);
    b.transition(SandboxState::Returned, 70);

    a.transition(SandboxState::RunningUser, 80);
    a.transition(SandboxState::Returned, 150);

    assert_eq!(a.duration_of_state(SandboxState::Asleep), 50);
    assert_eq!(a.state(), SandboxState::Returned);
}

/// Scenario 4: a sandbox traps (e.g. division by zero) and the worker
/// observes `Error` without aborting itself.
#[test]
fn scenario_trap_becomes_error_state() {
    let route = route(1_000, 10);
    let mut sandbox = Sandbox::allocate(
        1,
        route,
        0,
        64 * 1024,
        Box::new(|| {
            Err(sledge_runtime::SandboxError::Trapped {
                message: "integer divide by zero".to_string(),
            })
        }),
    )
    .unwrap();

    sandbox.transition(SandboxState::RunningUser, 0);
    unsafe { sandbox.dispatch_once() };

    assert_eq!(sandbox.state(), SandboxState::Error);
    let err = sandbox.result.unwrap().unwrap_err();
    assert!(matches!(err, sledge_runtime::SandboxError::Trapped { .. }));
}

/// Scenario 5: a sandbox's deadline has already passed by the time it's
/// popped off the runqueue; it must be dropped directly into `Error`
/// without running, rather than dispatched.
#[test]
fn scenario_deadline_missed_before_dispatch() {
    let runqueue = Runqueue::new(16, SchedulingPolicy::Edf);
    let sandbox = Sandbox::allocate(1, route(100, 10), 0, 64 * 1024, Box::new(|| Ok(Vec::new()))).unwrap();
    assert_eq!(sandbox.absolute_deadline, 100);
    runqueue.push(sandbox).unwrap();

    let now = 150u64;
    let mut popped = runqueue.pop_min().unwrap();
    assert!(now > popped.absolute_deadline, "this sandbox's deadline has already passed");
    popped.transition(SandboxState::Error, now);
    assert_eq!(popped.state(), SandboxState::Error);
    assert!(popped.result.is_none(), "a deadline-dropped sandbox never ran its program");
}

/// Scenario 6: a 16-slot window filled with {10,20,...,160} answers
/// `percentile(50)` from `by_duration[floor(16*50/100)] = by_duration[8]`.
/// DESIGN.md records the decision to follow this formula over spec.md's
/// inconsistent worked example (which states 80, but index 8 of this
/// ascending sequence is 90).
#[test]
fn scenario_histogram_percentile() {
    let window = sledge_runtime::ExecutionWindow::new(16);
    for v in (10..=160).step_by(10) {
        window.observe(v);
    }
    let idx = window.precomputed_index_for(50);
    assert_eq!(idx, 8);
    assert_eq!(window.percentile(50, idx), 90);
}
