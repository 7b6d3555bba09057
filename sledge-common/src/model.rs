//! Tenant and route model. Built once at startup from the configuration
//! file (`config.rs`) and read-only thereafter, except for the
//! monotonically increasing per-status counters on `Route`.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Opaque identifier for a tenant, assigned at config-load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantId(pub Uuid);

/// Opaque identifier for a route, assigned at config-load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(pub Uuid);

/// A URL prefix mapped to a compiled module, a relative deadline, and
/// admissions parameters. Owned by exactly one `Tenant`.
#[derive(Debug)]
pub struct Route {
    pub id: RouteId,
    pub tenant: TenantId,
    pub url_prefix: String,
    pub module_path: String,
    /// Relative deadline, in TSC cycles, added to arrival time to
    /// compute a sandbox's absolute deadline.
    pub relative_deadline_cycles: u64,
    pub response_size_limit_bytes: usize,
    pub content_type: String,
    pub admissions_percentile: u8,
    pub expected_execution_us: u64,
    pub counters: RouteCounters,
}

/// Per-status-class response counters. Monotonically increasing for the
/// lifetime of the process; read by the metrics endpoint.
#[derive(Debug, Default)]
pub struct RouteCounters {
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
}

impl RouteCounters {
    pub fn record(&self, status: u16) {
        let counter = match status {
            200..=299 => &self.status_2xx,
            400..=499 => &self.status_4xx,
            _ => &self.status_5xx,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Route {
    /// Absolute deadline for a sandbox arriving at `arrival_cycles`.
    pub fn absolute_deadline(&self, arrival_cycles: u64) -> u64 {
        arrival_cycles.saturating_add(self.relative_deadline_cycles)
    }
}

/// A named collection of routes sharing an ingress port. Routes are
/// matched by longest URL-prefix among the tenant's routes.
#[derive(Debug)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub ingress_port: u16,
    pub routes: Vec<Route>,
}

impl Tenant {
    /// Finds the route whose `url_prefix` is the longest prefix of
    /// `path` among this tenant's routes. Returns `None` if no route's
    /// prefix matches.
    pub fn match_route(&self, path: &str) -> Option<&Route> {
        self.routes
            .iter()
            .filter(|route| path.starts_with(route.url_prefix.as_str()))
            .max_by_key(|route| route.url_prefix.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(prefix: &str) -> Route {
        Route {
            id: RouteId(Uuid::new_v4()),
            tenant: TenantId(Uuid::new_v4()),
            url_prefix: prefix.to_string(),
            module_path: "unused.wasm".to_string(),
            relative_deadline_cycles: 1_000,
            response_size_limit_bytes: 4096,
            content_type: "application/json".to_string(),
            admissions_percentile: 50,
            expected_execution_us: 100,
            counters: RouteCounters::default(),
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let tenant = Tenant {
            id: TenantId(Uuid::new_v4()),
            name: "acme".to_string(),
            ingress_port: 8080,
            routes: vec![route("/api"), route("/api/v2")],
        };
        let matched = tenant.match_route("/api/v2/widgets").unwrap();
        assert_eq!(matched.url_prefix, "/api/v2");
    }

    #[test]
    fn no_match_returns_none() {
        let tenant = Tenant {
            id: TenantId(Uuid::new_v4()),
            name: "acme".to_string(),
            ingress_port: 8080,
            routes: vec![route("/api")],
        };
        assert!(tenant.match_route("/other").is_none());
    }
}
