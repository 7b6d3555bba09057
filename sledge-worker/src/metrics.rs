//! Prometheus metrics endpoint (SPEC_FULL.md "Supplemented features":
//! per-route status counters, grounded on the teacher's
//! `base_metrics::register_all()` pattern used from
//! `cloud-debugging-service/src/server.rs`, and `golem-worker-executor`'s
//! `prometheus` dependency).

use lazy_static::lazy_static;
use prometheus::{HistogramVec, IntCounterVec, Registry};

lazy_static! {
    pub static ref SANDBOX_RESPONSES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "sledge_sandbox_responses_total",
            "Sandbox invocations completed, by route and status class"
        ),
        &["tenant", "route", "status_class"]
    )
    .unwrap();
    pub static ref SANDBOX_EXECUTION_SECONDS: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "sledge_sandbox_execution_seconds",
            "Wall-clock time spent running a sandbox's program, by route"
        ),
        &["tenant", "route"]
    )
    .unwrap();
    pub static ref DEADLINE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "sledge_deadline_misses_total",
            "Sandboxes dropped for missing their deadline before dispatch, by route"
        ),
        &["route"]
    )
    .unwrap();
}

/// Registers every metric above into a fresh `Registry`, matching the
/// teacher's `register_all()` convention of building one registry at
/// startup and handing it to the metrics HTTP handler.
pub fn register_all() -> Registry {
    let registry = Registry::new();
    registry
        .register(Box::new(SANDBOX_RESPONSES_TOTAL.clone()))
        .expect("metric registration is infallible for a fresh registry");
    registry
        .register(Box::new(SANDBOX_EXECUTION_SECONDS.clone()))
        .expect("metric registration is infallible for a fresh registry");
    registry
        .register(Box::new(DEADLINE_MISSES_TOTAL.clone()))
        .expect("metric registration is infallible for a fresh registry");
    registry
}

pub fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}
