//! Shared model types, configuration loading, and tracing setup used by
//! both the scheduler core (`sledge-runtime`) and the worker binary
//! (`sledge-worker`).

pub mod config;
pub mod error;
pub mod model;
pub mod tracing_init;

pub use error::SledgeError;
pub use model::{Route, RouteCounters, RouteId, Tenant, TenantId};
