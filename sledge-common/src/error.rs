use std::path::PathBuf;

/// Top-level error type for configuration loading and other fatal,
/// startup-time failures. Per-request failures (sandbox traps, deadline
/// misses, resource exhaustion) are modeled in `sledge-runtime` instead,
/// since they carry single-sandbox blast radius and are recoverable at
/// the worker loop.
#[derive(Debug, thiserror::Error)]
pub enum SledgeError {
    #[error("failed to read configuration file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration JSON in {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("configuration error in tenant {tenant:?}, route {route:?}: {message}")]
    ConfigValidation {
        tenant: Option<String>,
        route: Option<String>,
        message: String,
    },
}
