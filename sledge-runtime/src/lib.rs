//! Preemptive scheduler and sandbox lifecycle engine: the Selection
//! Tree, Execution Window, Context, Sandbox, Runqueue, Worker Loop, and
//! Dispatcher components. This crate carries no HTTP, wasmtime, or CLI
//! concerns — those live in `sledge-worker`, which treats this crate's
//! `Dispatcher` trait and `Sandbox` type as the boundary.

pub mod context;
pub mod dispatcher;
pub mod execution_window;
pub mod runqueue;
pub mod sandbox;
pub mod selection_tree;
pub mod worker;

pub use dispatcher::{Dispatcher, PlacementPolicy};
pub use execution_window::ExecutionWindow;
pub use runqueue::{Runqueue, SchedulingPolicy};
pub use sandbox::{Sandbox, SandboxState};
pub use selection_tree::{SelectionTree, TreeEntry};

/// Errors from the scheduler's core data structures. These carry
/// single-request or fatal-assertion blast radius, distinct from
/// `sledge_common::SledgeError`'s startup-time failures.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The Selection Tree's node slab is at capacity. A hard error per
    /// spec: the runqueue has a fixed node budget and does not grow.
    #[error("selection tree slab exhausted (capacity reached)")]
    SlabExhausted,

    /// A dispatcher asked for a worker to place a sandbox on but every
    /// candidate worker's runqueue is already at its node budget.
    #[error("no worker has runqueue capacity for admission")]
    NoCapacity,
}

/// Errors that terminate a single sandbox's lifecycle without taking
/// down the worker. Mapped to `SandboxState::Error` by whichever
/// component observes them.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox missed its deadline before dispatch (lateness {lateness_cycles} cycles)")]
    DeadlineMissedAtDequeue { lateness_cycles: u64 },

    #[error("sandbox trapped during execution: {message}")]
    Trapped { message: String },

    #[error("sandbox exceeded its memory limit ({limit_bytes} bytes)")]
    MemoryLimitExceeded { limit_bytes: usize },

    #[error("sandbox produced a response larger than its route's limit ({limit_bytes} bytes)")]
    ResponseTooLarge { limit_bytes: usize },
}
