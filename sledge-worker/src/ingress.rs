//! HTTP ingress (SPEC_FULL.md §6 "Wire protocol"): one `hyper` server per
//! tenant, bound to that tenant's configured ingress port, routing each
//! request to the longest-matching `Route` and admitting a `Sandbox` for
//! it onto the scheduler core.
//!
//! Per-tenant request admission (spec.md's "already-admitted requests"
//! boundary) is handled here, at the ingress boundary the core spec
//! treats as an external collaborator: a request whose dispatcher
//! admission fails (no worker capacity, or the target runqueue's slab is
//! exhausted) gets a 503 rather than being queued unboundedly.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use sledge_common::config::NOMINAL_CYCLES_PER_US;
use sledge_common::{Route, RouteId, Tenant};
use sledge_runtime::{Dispatcher, ExecutionWindow, Sandbox, SandboxError};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use wasmtime::{Engine, Linker, Module};

use crate::host::{self, SandboxHostState, ScratchStore};
use crate::metrics::{self, status_class};

/// Fiber stack size for every sandbox's cooperative execution, matching
/// the original's fixed per-sandbox stack allocation rather than growing
/// stacks on demand.
const SANDBOX_STACK_BYTES: usize = 256 * 1024;

/// Shared state behind every tenant's ingress server: the wasmtime
/// engine/linker (one compiled-module cache across all tenants), the
/// dispatcher workers read from, and the per-route telemetry that feeds
/// admission-cost estimates.
pub struct IngressState {
    engine: Engine,
    linker: Linker<SandboxHostState>,
    modules: DashMap<String, Arc<Module>>,
    dispatcher: Arc<Dispatcher>,
    windows: DashMap<RouteId, Arc<ExecutionWindow>>,
    scratch: Arc<ScratchStore>,
    next_sandbox_id: AtomicU64,
}

impl IngressState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> anyhow::Result<Self> {
        let engine = Engine::default();
        let linker = host::build_linker(&engine)?;
        Ok(Self {
            engine,
            linker,
            modules: DashMap::new(),
            dispatcher,
            windows: DashMap::new(),
            scratch: Arc::new(ScratchStore::new()),
            next_sandbox_id: AtomicU64::new(1),
        })
    }

    fn module_for(&self, route: &Route) -> anyhow::Result<Arc<Module>> {
        if let Some(existing) = self.modules.get(&route.module_path) {
            return Ok(existing.clone());
        }
        let module = Arc::new(Module::from_file(&self.engine, &route.module_path)?);
        self.modules.insert(route.module_path.clone(), module.clone());
        Ok(module)
    }

    fn window_for(&self, route_id: RouteId) -> Arc<ExecutionWindow> {
        self.windows
            .entry(route_id)
            .or_insert_with(|| Arc::new(ExecutionWindow::new(256)))
            .clone()
    }

    /// Per-route p50/p90/p99 snapshots, used by `perf_log::dump_histograms_if_configured`.
    pub fn histogram_snapshot(&self, tenant: &Tenant) -> Vec<(String, Arc<ExecutionWindow>)> {
        tenant
            .routes
            .iter()
            .map(|route| (route.url_prefix.clone(), self.window_for(route.id)))
            .collect()
    }

    fn estimated_cost_cycles(&self, route: &Route, window: &ExecutionWindow) -> u64 {
        let estimate_us = if window.is_full() {
            let idx = window.precomputed_index_for(route.admissions_percentile);
            window.percentile(route.admissions_percentile, idx)
        } else {
            route.expected_execution_us
        };
        estimate_us.saturating_mul(NOMINAL_CYCLES_PER_US)
    }
}

async fn handle_request(
    state: Arc<IngressState>,
    tenant: Arc<Tenant>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let Some(route) = tenant.match_route(&path) else {
        return Ok(text_response(StatusCode::NOT_FOUND, "no route matches this path"));
    };

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(err) => {
            return Ok(text_response(StatusCode::BAD_REQUEST, &format!("failed to read body: {err}")));
        }
    };

    let module = match state.module_for(route) {
        Ok(module) => module,
        Err(err) => {
            error!(route = route.url_prefix, %err, "failed to load module");
            route.counters.record(502);
            metrics::SANDBOX_RESPONSES_TOTAL
                .with_label_values(&[&tenant.name, &route.url_prefix, status_class(502)])
                .inc();
            return Ok(text_response(StatusCode::BAD_GATEWAY, "module failed to load"));
        }
    };

    let window = state.window_for(route.id);
    let engine = state.engine.clone();
    let linker_ptr: *const Linker<SandboxHostState> = &state.linker;
    let scratch = state.scratch.clone();
    let limit = route.response_size_limit_bytes;
    let (tx, rx) = tokio::sync::oneshot::channel();

    // SAFETY: the closure below only ever touches `linker_ptr` before it
    // sends its outcome over `tx`; `rx.await` further down cannot resolve
    // until that send happens, and this async fn's frame (which holds
    // `state`, keeping `state.linker` alive) is not dropped until after
    // that await returns. So every dereference happens strictly before
    // `state` could be dropped, even though the reference is spelled as
    // `'static` to satisfy the `Box<dyn FnMut + Send>` bound.
    let linker: &'static Linker<SandboxHostState> = unsafe { &*linker_ptr };

    let mut tx = Some(tx);
    let program = Box::new(move || -> Result<Vec<u8>, SandboxError> {
        let outcome = host::run_module(&engine, linker, &module, scratch.clone(), body.clone(), limit);
        let for_sandbox = match &outcome {
            Ok(body) => Ok(body.clone()),
            Err(err) => Err(err.clone()),
        };
        if let Some(sender) = tx.take() {
            let _ = sender.send(outcome);
        }
        for_sandbox
    });

    let arrival = sledge_runtime::worker::now_cycles();
    let dispatch_started = std::time::Instant::now();
    let route_arc = Arc::new(clone_route_ref(route));
    let sandbox_id = state.next_sandbox_id.fetch_add(1, Ordering::Relaxed);
    let mut sandbox = match Sandbox::allocate(sandbox_id, route_arc, arrival, SANDBOX_STACK_BYTES, program) {
        Ok(sandbox) => sandbox,
        Err(err) => {
            warn!(route = route.url_prefix, %err, "failed to allocate sandbox");
            return Ok(text_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string()));
        }
    };
    sandbox.estimated_remaining_cost = state.estimated_cost_cycles(route, &window);

    if let Err(err) = state.dispatcher.admit(sandbox) {
        warn!(route = route.url_prefix, %err, "admission rejected");
        route.counters.record(503);
        metrics::SANDBOX_RESPONSES_TOTAL
            .with_label_values(&[&tenant.name, &route.url_prefix, status_class(503)])
            .inc();
        return Ok(text_response(StatusCode::SERVICE_UNAVAILABLE, "no scheduling capacity"));
    }

    match rx.await {
        Ok(Ok(body)) => {
            let elapsed = dispatch_started.elapsed();
            window.observe(elapsed.as_micros() as u64);
            metrics::SANDBOX_EXECUTION_SECONDS
                .with_label_values(&[&tenant.name, &route.url_prefix])
                .observe(elapsed.as_secs_f64());
            route.counters.record(200);
            metrics::SANDBOX_RESPONSES_TOTAL
                .with_label_values(&[&tenant.name, &route.url_prefix, status_class(200)])
                .inc();
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", route.content_type.clone())
                .body(Full::new(Bytes::from(body)))
                .unwrap())
        }
        Ok(Err(err)) => {
            warn!(route = route.url_prefix, %err, "sandbox execution failed");
            route.counters.record(500);
            metrics::SANDBOX_RESPONSES_TOTAL
                .with_label_values(&[&tenant.name, &route.url_prefix, status_class(500)])
                .inc();
            Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()))
        }
        Err(_) => {
            error!(route = route.url_prefix, "sandbox dropped without producing a result");
            route.counters.record(500);
            Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, "sandbox vanished"))
        }
    }
}

/// The `Sandbox` the program closure observes carries its own `Arc<Route>`
/// handle distinct from the one owned by the tenant table, so two
/// in-flight sandboxes for the same route never contend over the
/// tenant-owned `Arc`'s refcount on the hot path. Route data itself is
/// cheap and immutable post-startup, so a field-wise copy is sufficient;
/// the per-status counters are intentionally fresh (ingress already
/// records onto the tenant-owned route directly above).
fn clone_route_ref(route: &Route) -> Route {
    Route {
        id: route.id,
        tenant: route.tenant,
        url_prefix: route.url_prefix.clone(),
        module_path: route.module_path.clone(),
        relative_deadline_cycles: route.relative_deadline_cycles,
        response_size_limit_bytes: route.response_size_limit_bytes,
        content_type: route.content_type.clone(),
        admissions_percentile: route.admissions_percentile,
        expected_execution_us: route.expected_execution_us,
        counters: sledge_common::model::RouteCounters::default(),
    }
}

fn text_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap()
}

/// Serves one tenant's ingress port until the process exits. Spawned
/// once per tenant from `main`.
pub async fn serve_tenant(state: Arc<IngressState>, tenant: Arc<Tenant>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], tenant.ingress_port));
    let listener = TcpListener::bind(addr).await?;
    info!(tenant = tenant.name, %addr, "tenant ingress listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "failed to accept ingress connection");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let state = state.clone();
        let tenant = tenant.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(state.clone(), tenant.clone(), req));
            if let Err(err) = ConnBuilder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                warn!(%peer, %err, "ingress connection terminated with an error");
            }
        });
    }
}
