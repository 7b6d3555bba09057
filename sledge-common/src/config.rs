//! Configuration file loading (spec.md §6): a JSON array of tenants,
//! each with a name, an ingress port, and a routes array. Unknown keys
//! are rejected outright via `#[serde(deny_unknown_fields)]` rather than
//! silently ignored, and every listed key is required (no `Option`
//! fields with defaults) — both are explicit requirements, not
//! permissive-by-default serde behavior.

use std::path::Path;
use std::sync::atomic::AtomicU64;

use serde::Deserialize;
use uuid::Uuid;

use crate::error::SledgeError;
use crate::model::{Route, RouteCounters, RouteId, Tenant, TenantId};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TenantConfig {
    name: String,
    #[serde(rename = "ingress-port")]
    ingress_port: u16,
    routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteConfig {
    #[serde(rename = "url-prefix")]
    url_prefix: String,
    #[serde(rename = "module-path")]
    module_path: String,
    #[serde(rename = "admissions-percentile")]
    admissions_percentile: u8,
    #[serde(rename = "expected-execution-us")]
    expected_execution_us: u64,
    #[serde(rename = "relative-deadline-us")]
    relative_deadline_us: u64,
    #[serde(rename = "response-size-limit-bytes")]
    response_size_limit_bytes: usize,
    #[serde(rename = "response-content-type")]
    response_content_type: String,
}

/// TSC-equivalent cycles-per-microsecond used to convert the
/// configuration file's microsecond deadlines into the cycle units the
/// scheduler core works in. On real hardware this is calibrated at
/// startup from `/proc/cpuinfo`; tests and this loader use a fixed
/// nominal value so configuration validation is deterministic.
pub const NOMINAL_CYCLES_PER_US: u64 = 1_000;

/// Loads and validates the tenant/route configuration file at `path`.
pub fn load_config(path: &Path) -> Result<Vec<Tenant>, SledgeError> {
    let raw = std::fs::read_to_string(path).map_err(|source| SledgeError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    let tenants: Vec<TenantConfig> =
        serde_json::from_str(&raw).map_err(|source| SledgeError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
    tenants.into_iter().map(build_tenant).collect()
}

fn build_tenant(config: TenantConfig) -> Result<Tenant, SledgeError> {
    let tenant_id = TenantId(Uuid::new_v4());
    let routes = config
        .routes
        .into_iter()
        .map(|route| build_route(tenant_id, &config.name, route))
        .collect::<Result<Vec<_>, _>>()?;
    if routes.is_empty() {
        return Err(SledgeError::ConfigValidation {
            tenant: Some(config.name.clone()),
            route: None,
            message: "tenant must declare at least one route".to_string(),
        });
    }
    Ok(Tenant {
        id: tenant_id,
        name: config.name,
        ingress_port: config.ingress_port,
        routes,
    })
}

fn build_route(
    tenant_id: TenantId,
    tenant_name: &str,
    config: RouteConfig,
) -> Result<Route, SledgeError> {
    let invalid = |message: String| SledgeError::ConfigValidation {
        tenant: Some(tenant_name.to_string()),
        route: Some(config.url_prefix.clone()),
        message,
    };

    if !(50..=99).contains(&config.admissions_percentile) {
        return Err(invalid(format!(
            "admissions-percentile {} out of range [50, 99]",
            config.admissions_percentile
        )));
    }
    if config.expected_execution_us > 1_000_000_000 {
        return Err(invalid("expected-execution-us exceeds 1e9".to_string()));
    }
    if config.relative_deadline_us > 1_000_000_000 {
        return Err(invalid("relative-deadline-us exceeds 1e9".to_string()));
    }

    Ok(Route {
        id: RouteId(Uuid::new_v4()),
        tenant: tenant_id,
        url_prefix: config.url_prefix,
        module_path: config.module_path,
        relative_deadline_cycles: config
            .relative_deadline_us
            .saturating_mul(NOMINAL_CYCLES_PER_US),
        response_size_limit_bytes: config.response_size_limit_bytes,
        content_type: config.response_content_type,
        admissions_percentile: config.admissions_percentile,
        expected_execution_us: config.expected_execution_us,
        counters: RouteCounters {
            status_2xx: AtomicU64::new(0),
            status_4xx: AtomicU64::new(0),
            status_5xx: AtomicU64::new(0),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const VALID: &str = r#"
    [
        {
            "name": "acme",
            "ingress-port": 8080,
            "routes": [
                {
                    "url-prefix": "/hello",
                    "module-path": "hello.wasm",
                    "admissions-percentile": 90,
                    "expected-execution-us": 500,
                    "relative-deadline-us": 2000,
                    "response-size-limit-bytes": 4096,
                    "response-content-type": "text/plain"
                }
            ]
        }
    ]
    "#;

    #[test]
    fn loads_valid_config() {
        let file = write_temp(VALID);
        let tenants = load_config(file.path()).unwrap();
        assert_eq!(tenants.len(), 1);
        assert_eq!(tenants[0].routes.len(), 1);
        assert_eq!(tenants[0].routes[0].relative_deadline_cycles, 2_000_000);
    }

    #[test]
    fn rejects_unknown_key() {
        let file = write_temp(
            r#"[{"name":"acme","ingress-port":8080,"extra-key":true,"routes":[]}]"#,
        );
        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, SledgeError::ConfigParse { .. }));
    }

    #[test]
    fn rejects_out_of_range_percentile() {
        let file = write_temp(
            r#"[{"name":"acme","ingress-port":8080,"routes":[
                {"url-prefix":"/x","module-path":"x.wasm","admissions-percentile":10,
                 "expected-execution-us":1,"relative-deadline-us":1,
                 "response-size-limit-bytes":1,"response-content-type":"text/plain"}
            ]}]"#,
        );
        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, SledgeError::ConfigValidation { .. }));
    }
}
