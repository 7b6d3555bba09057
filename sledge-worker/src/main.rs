//! `sledge-worker` binary entrypoint. Loads the tenant/route
//! configuration, starts one pinned scheduler `Worker` per core, and
//! serves one HTTP ingress per tenant on top of them.
//!
//! Mirrors the teacher's `main` shape
//! (`cloud-debugging-service/src/server.rs`): parse config, init
//! tracing, register metrics, build a multi-thread tokio runtime, then
//! `block_on` the async portion of the program.

mod host;
mod ingress;
mod metrics;
mod perf_log;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sledge_common::config::load_config;
use sledge_common::tracing_init::init_tracing;
use sledge_runtime::dispatcher::EdfGlobal;
use sledge_runtime::runqueue::SchedulingPolicy;
use sledge_runtime::worker::Worker;
use sledge_runtime::{Dispatcher, Runqueue};
use tracing::info;

use crate::perf_log::{dump_histograms_if_configured, MemLog, PerfLog};

/// A single positional argument naming the tenant/route configuration
/// file (SPEC_FULL.md §6 "CLI").
#[derive(Debug, Parser)]
#[command(name = "sledge-worker", about = "Preemptive EDF scheduler for WebAssembly request handlers")]
struct Cli {
    config_path: PathBuf,

    /// Runqueue capacity per worker (fixed-size slab, spec.md §3).
    #[arg(long, default_value_t = 4096)]
    queue_capacity: usize,

    /// Preemption time slice, in microseconds.
    #[arg(long, default_value_t = 5_000)]
    time_slice_us: u64,

    /// Number of pinned worker threads. Defaults to the number of
    /// available cores.
    #[arg(long)]
    workers: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing("info");

    let tenants = load_config(&cli.config_path)?;
    info!(tenants = tenants.len(), "configuration loaded");

    let prometheus_registry = metrics::register_all();
    let mem_log = MemLog::from_env(4096).map(Arc::new);
    let perf_log = PerfLog::from_env().map(Arc::new);

    let worker_count = cli
        .workers
        .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));
    let time_slice = Duration::from_micros(cli.time_slice_us);

    let runqueues: Vec<_> = (0..worker_count)
        .map(|_| Arc::new(Runqueue::new(cli.queue_capacity, SchedulingPolicy::Edf)))
        .collect();

    for (core_id, runqueue) in runqueues.iter().cloned().enumerate() {
        let perf_log = perf_log.clone();
        std::thread::Builder::new()
            .name(format!("sledge-worker-{core_id}"))
            .spawn(move || {
                let worker = Worker::new(runqueue, core_id, time_slice).with_terminal_hook(Arc::new(move |sandbox| {
                    let outcome = match &sandbox.result {
                        None => "deadline_missed",
                        Some(Ok(_)) => "ok",
                        Some(Err(_)) => "error",
                    };
                    if outcome == "deadline_missed" {
                        crate::metrics::DEADLINE_MISSES_TOTAL
                            .with_label_values(&[&sandbox.route.url_prefix])
                            .inc();
                    }
                    if let Some(perf_log) = &perf_log {
                        perf_log.record(sandbox, sledge_common::config::NOMINAL_CYCLES_PER_US, outcome);
                    }
                }));
                worker.run();
            })?;
    }

    let dispatcher = Arc::new(Dispatcher::new(runqueues, Box::new(EdfGlobal)));

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(tenants, dispatcher, mem_log, prometheus_registry))
}

async fn run(
    tenants: Vec<sledge_common::Tenant>,
    dispatcher: Arc<Dispatcher>,
    mem_log: Option<Arc<MemLog>>,
    prometheus_registry: prometheus::Registry,
) -> anyhow::Result<()> {
    let ingress_state = Arc::new(ingress::IngressState::new(dispatcher)?);

    let metrics_addr = std::net::SocketAddr::from(([0, 0, 0, 0], 9090));
    tokio::spawn(serve_metrics(metrics_addr, prometheus_registry, mem_log));

    let tenants: Vec<_> = tenants.into_iter().map(Arc::new).collect();

    if std::env::var_os(perf_log::HISTOGRAM_DUMP_PATH_ENV).is_some() {
        let state = ingress_state.clone();
        let tenants = tenants.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                for tenant in &tenants {
                    periodic_histogram_dump(&state, tenant);
                }
            }
        });
    }

    let mut handles = Vec::new();
    for tenant in tenants {
        let state = ingress_state.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = ingress::serve_tenant(state, tenant).await {
                tracing::error!(%err, "tenant ingress server exited");
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

/// Minimal text-exposition metrics endpoint: `GET /metrics` renders the
/// Prometheus registry, `GET /memlog` dumps the in-memory ring log if
/// one is configured. Kept deliberately small rather than pulling in a
/// routing framework for two static handlers.
async fn serve_metrics(
    addr: std::net::SocketAddr,
    registry: prometheus::Registry,
    mem_log: Option<Arc<MemLog>>,
) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use hyper_util::server::conn::auto::Builder as ConnBuilder;
    use prometheus::Encoder;
    use tokio::net::TcpListener;

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "metrics endpoint listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let registry = registry.clone();
        let mem_log = mem_log.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let registry = registry.clone();
                let mem_log = mem_log.clone();
                async move {
                    let body = if req.uri().path() == "/memlog" {
                        mem_log
                            .as_ref()
                            .map(|log| log.dump().join("\n"))
                            .unwrap_or_else(|| "memlog not enabled".to_string())
                    } else {
                        let metric_families = registry.gather();
                        let encoder = prometheus::TextEncoder::new();
                        let mut buf = Vec::new();
                        encoder.encode(&metric_families, &mut buf).unwrap_or_default();
                        String::from_utf8_lossy(&buf).into_owned()
                    };
                    Ok::<_, std::convert::Infallible>(Response::new(Full::new(Bytes::from(body))))
                }
            });
            let _ = ConnBuilder::new(TokioExecutor::new()).serve_connection(io, service).await;
        });
    }
}

fn periodic_histogram_dump(state: &ingress::IngressState, tenant: &sledge_common::Tenant) {
    let snapshot = state.histogram_snapshot(tenant);
    let windows: Vec<_> = snapshot.iter().map(|(name, window)| (name.clone(), window.as_ref())).collect();
    dump_histograms_if_configured(&windows);
}
