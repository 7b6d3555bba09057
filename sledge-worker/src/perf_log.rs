//! Sandbox-perf CSV log and in-memory ring log (SPEC_FULL.md "Supplemented
//! features", grounded on `original_source/runtime`'s `memlogging.c` and
//! its sandbox-perf logging convention). Both are optional, gated by
//! environment variables (spec.md §6 "Environment variables select
//! optional features").

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::sync::Mutex;

use sledge_runtime::{ExecutionWindow, Sandbox, SandboxState};
use tracing::warn;

pub const SANDBOX_PERF_LOG_ENV: &str = "SLEDGE_SANDBOX_PERF_LOG";
pub const HISTOGRAM_DUMP_PATH_ENV: &str = "SLEDGE_HISTOGRAM_DUMP_PATH";

const PERF_LOG_HEADER: &str = "sandbox_id,route,outcome,allocated_us,initialized_us,runnable_us,running_user_us,running_sys_us,preempted_us,asleep_us";

/// Opens the CSV perf log named by `SLEDGE_SANDBOX_PERF_LOG`, if set, and
/// writes the header row. Returns `None` when the variable is unset,
/// meaning perf logging is disabled for this run.
pub struct PerfLog {
    file: Mutex<File>,
}

impl PerfLog {
    pub fn from_env() -> Option<Self> {
        let path = std::env::var_os(SANDBOX_PERF_LOG_ENV)?;
        let mut file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => file,
            Err(err) => {
                warn!(?path, %err, "failed to open sandbox perf log, disabling it");
                return None;
            }
        };
        if file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
            let _ = writeln!(file, "{PERF_LOG_HEADER}");
        }
        Some(Self {
            file: Mutex::new(file),
        })
    }

    /// Appends one row describing a just-terminated sandbox's per-state
    /// time accounting, in microseconds (converted from cycles by the
    /// caller's nominal cycles-per-microsecond constant).
    pub fn record(&self, sandbox: &Sandbox, cycles_per_us: u64, outcome: &str) {
        let us = |state: SandboxState| sandbox.duration_of_state(state) / cycles_per_us.max(1);
        let row = format!(
            "{},{},{},{},{},{},{},{},{},{}",
            sandbox.id,
            sandbox.route.url_prefix,
            outcome,
            us(SandboxState::Allocated),
            us(SandboxState::Initialized),
            us(SandboxState::Runnable),
            us(SandboxState::RunningUser),
            us(SandboxState::RunningSys),
            us(SandboxState::Preempted),
            us(SandboxState::Asleep),
        );
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{row}");
        }
    }
}

/// A bounded in-memory ring log, selected by `SLEDGE_MEMLOG_DEST=memory`
/// (the original's `memlogging.c`). Lines older than `capacity` are
/// dropped as new ones arrive; the metrics endpoint can dump the current
/// contents.
pub struct MemLog {
    lines: Mutex<std::collections::VecDeque<String>>,
    capacity: usize,
}

impl MemLog {
    pub const DEST_ENV: &'static str = "SLEDGE_MEMLOG_DEST";

    /// Returns `Some` only when `SLEDGE_MEMLOG_DEST=memory`; any other
    /// value (or unset) disables the in-memory ring, matching the
    /// original's single recognized destination value.
    pub fn from_env(capacity: usize) -> Option<Self> {
        if std::env::var(Self::DEST_ENV).ok().as_deref() == Some("memory") {
            Some(Self {
                lines: Mutex::new(std::collections::VecDeque::with_capacity(capacity)),
                capacity,
            })
        } else {
            None
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn dump(&self) -> Vec<String> {
        self.lines.lock().unwrap().iter().cloned().collect()
    }
}

/// Writes each route's p50/p90/p99 execution-time estimate to the path
/// named by `SLEDGE_HISTOGRAM_DUMP_PATH`, if set. Intended to be called
/// periodically (or on shutdown) from `main`, not on every request.
pub fn dump_histograms_if_configured(windows: &[(String, &ExecutionWindow)]) {
    let Some(path) = std::env::var_os(HISTOGRAM_DUMP_PATH_ENV) else {
        return;
    };
    let mut out = String::from("route,p50,p90,p99\n");
    for (route, window) in windows {
        let p50 = window.percentile(50, window.precomputed_index_for(50));
        let p90 = window.percentile(90, window.precomputed_index_for(90));
        let p99 = window.percentile(99, window.precomputed_index_for(99));
        out.push_str(&format!("{route},{p50},{p90},{p99}\n"));
    }
    if let Err(err) = std::fs::write(&path, out) {
        warn!(?path, %err, "failed to write histogram dump");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sledge_common::{Route, RouteCounters, RouteId, TenantId};
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use uuid::Uuid;

    fn route() -> Arc<Route> {
        Arc::new(Route {
            id: RouteId(Uuid::new_v4()),
            tenant: TenantId(Uuid::new_v4()),
            url_prefix: "/fn".to_string(),
            module_path: "unused.wasm".to_string(),
            relative_deadline_cycles: 1_000,
            response_size_limit_bytes: 4096,
            content_type: "application/octet-stream".to_string(),
            admissions_percentile: 90,
            expected_execution_us: 10,
            counters: RouteCounters {
                status_2xx: AtomicU64::new(0),
                status_4xx: AtomicU64::new(0),
                status_5xx: AtomicU64::new(0),
            },
        })
    }

    #[test]
    fn perf_log_writes_header_once_and_appends_rows() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::env::set_var(SANDBOX_PERF_LOG_ENV, file.path());

        let log = PerfLog::from_env().expect("env var set, log must open");
        let mut sandbox = Sandbox::allocate(1, route(), 0, 64 * 1024, Box::new(|| Ok(Vec::new()))).unwrap();
        sandbox.transition(SandboxState::RunningUser, 0);
        sandbox.transition(SandboxState::Returned, 10);
        log.record(&sandbox, 1, "ok");
        drop(log);

        let contents = std::fs::read_to_string(file.path()).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some(PERF_LOG_HEADER));
        let row = lines.next().expect("one data row");
        assert!(row.starts_with("1,/fn,ok,"));

        std::env::remove_var(SANDBOX_PERF_LOG_ENV);
    }

    #[test]
    fn perf_log_disabled_when_env_unset() {
        std::env::remove_var(SANDBOX_PERF_LOG_ENV);
        assert!(PerfLog::from_env().is_none());
    }

    #[test]
    fn memlog_respects_destination_env_var() {
        std::env::remove_var(MemLog::DEST_ENV);
        assert!(MemLog::from_env(4).is_none(), "no destination configured, ring must stay disabled");

        std::env::set_var(MemLog::DEST_ENV, "memory");
        let log = MemLog::from_env(2).expect("memory destination must enable the ring");
        log.push("a".to_string());
        log.push("b".to_string());
        log.push("c".to_string());
        assert_eq!(log.dump(), vec!["b".to_string(), "c".to_string()]);
        std::env::remove_var(MemLog::DEST_ENV);
    }
}
