//! Dispatcher interface (spec.md §4.7): the boundary between ingress
//! (which knows about routes and arrivals but nothing about workers)
//! and the per-worker runqueues. `sledge-worker::ingress` is the only
//! consumer of this trait.

use std::sync::Arc;

use crate::runqueue::Runqueue;
use crate::sandbox::Sandbox;
use crate::SchedulerError;

/// A strategy for picking which worker a newly arrived sandbox should
/// be admitted onto. Spec.md names "several placement strategies" as
/// the dispatcher's responsibility; these three are provided.
pub trait PlacementPolicy: Send + Sync {
    fn select<'a>(&self, workers: &'a [Arc<Runqueue>], sandbox: &Sandbox) -> Option<&'a Arc<Runqueue>>;
}

/// Picks the worker with the least total estimated cost queued
/// (`Runqueue::total_cost`), spec.md §4.5/§4.7's "load" for this
/// strategy — distinct from `JoinShortestQueue`, which counts sandboxes
/// rather than cycles.
pub struct LeastLoaded;

impl PlacementPolicy for LeastLoaded {
    fn select<'a>(&self, workers: &'a [Arc<Runqueue>], _sandbox: &Sandbox) -> Option<&'a Arc<Runqueue>> {
        workers.iter().min_by_key(|w| w.total_cost())
    }
}

/// Picks the worker with the fewest pending sandboxes, ignoring their
/// cost — spec.md §4.7 lists this as a separate named strategy from
/// `LeastLoaded`.
pub struct JoinShortestQueue;

impl PlacementPolicy for JoinShortestQueue {
    fn select<'a>(&self, workers: &'a [Arc<Runqueue>], _sandbox: &Sandbox) -> Option<&'a Arc<Runqueue>> {
        workers.iter().min_by_key(|w| w.len())
    }
}

/// Picks the worker whose runqueue has the least total estimated cost
/// strictly ahead of the new sandbox's deadline — i.e. the worker where
/// this sandbox would wait the least before it became the minimum.
pub struct EdfGlobal;

impl PlacementPolicy for EdfGlobal {
    fn select<'a>(&self, workers: &'a [Arc<Runqueue>], sandbox: &Sandbox) -> Option<&'a Arc<Runqueue>> {
        workers
            .iter()
            .min_by_key(|w| w.cost_ahead_of(sandbox.absolute_deadline))
    }
}

/// Fans newly admitted sandboxes out to worker runqueues using a
/// configured `PlacementPolicy`.
pub struct Dispatcher {
    workers: Vec<Arc<Runqueue>>,
    policy: Box<dyn PlacementPolicy>,
}

impl Dispatcher {
    pub fn new(workers: Vec<Arc<Runqueue>>, policy: Box<dyn PlacementPolicy>) -> Self {
        Self { workers, policy }
    }

    /// Admits `sandbox` onto whichever worker the policy selects.
    /// `SchedulerError::NoCapacity` if every worker's runqueue is full.
    pub fn admit(&self, sandbox: Sandbox) -> Result<(), SchedulerError> {
        let Some(target) = self.policy.select(&self.workers, &sandbox) else {
            return Err(SchedulerError::NoCapacity);
        };
        target.push(sandbox)
    }

    pub fn workers(&self) -> &[Arc<Runqueue>] {
        &self.workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runqueue::SchedulingPolicy;
    use sledge_common::{Route, RouteCounters, RouteId, TenantId};
    use uuid::Uuid;

    fn route() -> Arc<Route> {
        Arc::new(Route {
            id: RouteId(Uuid::new_v4()),
            tenant: TenantId(Uuid::new_v4()),
            url_prefix: "/fn".to_string(),
            module_path: "unused.wasm".to_string(),
            relative_deadline_cycles: 1_000,
            response_size_limit_bytes: 4096,
            content_type: "application/json".to_string(),
            admissions_percentile: 50,
            expected_execution_us: 10,
            counters: RouteCounters::default(),
        })
    }

    fn sandbox(id: u64) -> Sandbox {
        Sandbox::allocate(id, route(), 0, 64 * 1024, Box::new(|| Ok(Vec::new()))).unwrap()
    }

    #[test]
    fn least_loaded_prefers_empty_worker() {
        let workers = vec![
            Arc::new(Runqueue::new(16, SchedulingPolicy::Edf)),
            Arc::new(Runqueue::new(16, SchedulingPolicy::Edf)),
        ];
        workers[0].push(sandbox(1)).unwrap();
        let dispatcher = Dispatcher::new(workers.clone(), Box::new(LeastLoaded));
        dispatcher.admit(sandbox(2)).unwrap();
        assert_eq!(workers[0].len(), 1);
        assert_eq!(workers[1].len(), 1);
    }

    #[test]
    fn full_runqueue_propagates_slab_exhaustion_through_admit() {
        let workers = vec![Arc::new(Runqueue::new(1, SchedulingPolicy::Edf))];
        workers[0].push(sandbox(1)).unwrap();
        let dispatcher = Dispatcher::new(workers, Box::new(LeastLoaded));
        // LeastLoaded always finds *a* worker; the capacity failure
        // surfaces from the underlying `push` instead of from `select`.
        assert!(matches!(dispatcher.admit(sandbox(2)), Err(SchedulerError::SlabExhausted)));
    }
}
