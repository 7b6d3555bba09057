//! Tracing/logging setup, following the teacher's pattern of a single
//! `init_tracing_with_default_env_filter`-style entrypoint called once
//! from each binary's `main`.

use tracing_subscriber::{fmt, EnvFilter};

/// Optional in-memory log destination, selected by
/// `SLEDGE_MEMLOG_DEST=memory` (spec.md §6 environment variables; the
/// original's `memlogging.c` ring buffer). When unset, logs go to
/// stderr only.
pub const MEMLOG_DEST_ENV: &str = "SLEDGE_MEMLOG_DEST";

/// Initializes the global tracing subscriber. Defaults to `info` level
/// when `RUST_LOG` is unset, mirroring the teacher's default-env-filter
/// convention.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.to_string()));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .init();
}
