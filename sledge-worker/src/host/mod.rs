//! Sandbox-to-host call surface (spec.md §6 "Sandbox-to-host calls"): a
//! `wasmtime::Linker` exposing a scratch key-value store to guest code,
//! plus the module-loading and invocation path that turns a `Route`
//! into the `Sandbox` program closure `sledge_runtime::Sandbox::allocate`
//! expects.
//!
//! The scratch store is a `dashmap::DashMap`, shared across every
//! sandbox belonging to the same tenant (a cache, not sandbox-private
//! state — matching the original's description of it as a scratch
//! area rather than durable storage).

use std::sync::Arc;

use dashmap::DashMap;
use sledge_runtime::SandboxError;
use wasmtime::{Caller, Engine, Instance, Linker, Memory, Module, Store};

pub type ScratchStore = DashMap<String, Vec<u8>>;

/// Per-invocation host state: the guest's view of the scratch store,
/// plus the request body it was invoked with and the response body it
/// produces. Lives for exactly one `run_module` call.
pub struct SandboxHostState {
    scratch: Arc<ScratchStore>,
    input: Vec<u8>,
    output: Vec<u8>,
    response_size_limit_bytes: usize,
}

fn memory(caller: &mut Caller<'_, SandboxHostState>) -> Memory {
    caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .expect("guest module must export linear memory named \"memory\"")
}

fn read_guest_string(caller: &mut Caller<'_, SandboxHostState>, ptr: u32, len: u32) -> String {
    let memory = memory(caller);
    let mut buf = vec![0u8; len as usize];
    memory
        .read(&caller, ptr as usize, &mut buf)
        .expect("guest passed an out-of-bounds key pointer");
    String::from_utf8_lossy(&buf).into_owned()
}

/// Builds the `Linker` every sandbox's module is instantiated against.
/// One linker is built per process and reused across every invocation;
/// `Store`-local state carries the per-call scratch handle and buffers.
pub fn build_linker(engine: &Engine) -> anyhow::Result<Linker<SandboxHostState>> {
    let mut linker = Linker::new(engine);

    linker.func_wrap(
        "env",
        "scratch_get_size",
        |mut caller: Caller<'_, SandboxHostState>, key_ptr: u32, key_len: u32| -> u32 {
            let key = read_guest_string(&mut caller, key_ptr, key_len);
            caller
                .data()
                .scratch
                .get(&key)
                .map(|v| v.len() as u32)
                .unwrap_or(0)
        },
    )?;

    linker.func_wrap(
        "env",
        "scratch_get",
        |mut caller: Caller<'_, SandboxHostState>, key_ptr: u32, key_len: u32, out_ptr: u32, buf_len: u32| -> u32 {
            let key = read_guest_string(&mut caller, key_ptr, key_len);
            let Some(value) = caller.data().scratch.get(&key).map(|v| v.clone()) else {
                return 1;
            };
            if value.len() as u32 > buf_len {
                return 2;
            }
            let memory = memory(&mut caller);
            match memory.write(&mut caller, out_ptr as usize, &value) {
                Ok(()) => 0,
                Err(_) => 2,
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "scratch_set",
        |mut caller: Caller<'_, SandboxHostState>,
         key_ptr: u32,
         key_len: u32,
         value_ptr: u32,
         value_len: u32|
         -> u32 {
            let key = read_guest_string(&mut caller, key_ptr, key_len);
            if caller.data().scratch.contains_key(&key) {
                return 1;
            }
            let memory = memory(&mut caller);
            let mut value = vec![0u8; value_len as usize];
            memory
                .read(&caller, value_ptr as usize, &mut value)
                .expect("guest passed an out-of-bounds value pointer");
            caller.data().scratch.insert(key, value);
            0
        },
    )?;

    linker.func_wrap(
        "env",
        "scratch_upsert",
        |mut caller: Caller<'_, SandboxHostState>,
         key_ptr: u32,
         key_len: u32,
         delta_ptr: u32,
         delta_len: u32|
         -> u32 {
            let key = read_guest_string(&mut caller, key_ptr, key_len);
            let memory = memory(&mut caller);
            let mut delta = vec![0u8; delta_len as usize];
            memory
                .read(&caller, delta_ptr as usize, &mut delta)
                .expect("guest passed an out-of-bounds delta pointer");
            caller
                .data()
                .scratch
                .entry(key)
                .and_modify(|existing| existing.extend_from_slice(&delta))
                .or_insert(delta);
            0
        },
    )?;

    linker.func_wrap(
        "env",
        "scratch_delete",
        |mut caller: Caller<'_, SandboxHostState>, key_ptr: u32, key_len: u32| -> u32 {
            let key = read_guest_string(&mut caller, key_ptr, key_len);
            match caller.data().scratch.remove(&key) {
                Some(_) => 0,
                None => 1,
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "memory_size",
        |mut caller: Caller<'_, SandboxHostState>| -> u32 {
            memory(&mut caller).size(&caller) as u32
        },
    )?;

    linker.func_wrap(
        "env",
        "memory_grow",
        |mut caller: Caller<'_, SandboxHostState>, additional_pages: u32| -> i32 {
            let memory = memory(&mut caller);
            match memory.grow(&mut caller, additional_pages as u64) {
                Ok(previous_pages) => previous_pages as i32,
                Err(_) => -1,
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "request_read",
        |mut caller: Caller<'_, SandboxHostState>, out_ptr: u32| -> u32 {
            let input = caller.data().input.clone();
            let memory = memory(&mut caller);
            match memory.write(&mut caller, out_ptr as usize, &input) {
                Ok(()) => input.len() as u32,
                Err(_) => 0,
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "response_write",
        |mut caller: Caller<'_, SandboxHostState>, ptr: u32, len: u32| -> u32 {
            let limit = caller.data().response_size_limit_bytes;
            if caller.data().output.len() + len as usize > limit {
                return 1;
            }
            let memory = memory(&mut caller);
            let mut buf = vec![0u8; len as usize];
            if memory.read(&caller, ptr as usize, &mut buf).is_err() {
                return 1;
            }
            caller.data_mut().output.extend_from_slice(&buf);
            0
        },
    )?;

    Ok(linker)
}

/// Runs one invocation of `module` to completion, synchronously.
/// Intended to be wrapped in the closure passed to
/// `sledge_runtime::Sandbox::allocate`, which drives it cooperatively
/// on the sandbox's own fiber stack.
pub fn run_module(
    engine: &Engine,
    linker: &Linker<SandboxHostState>,
    module: &Module,
    scratch: Arc<ScratchStore>,
    input: Vec<u8>,
    response_size_limit_bytes: usize,
) -> Result<Vec<u8>, SandboxError> {
    let state = SandboxHostState {
        scratch,
        input,
        output: Vec::new(),
        response_size_limit_bytes,
    };
    let mut store = Store::new(engine, state);

    let instance: Instance = linker
        .instantiate(&mut store, module)
        .map_err(|e| SandboxError::Trapped {
            message: format!("instantiation failed: {e}"),
        })?;

    let entry = instance
        .get_typed_func::<(), ()>(&mut store, "handle_request")
        .map_err(|e| SandboxError::Trapped {
            message: format!("missing handle_request export: {e}"),
        })?;

    entry.call(&mut store, ()).map_err(|trap| SandboxError::Trapped {
        message: trap.to_string(),
    })?;

    let output = store.into_data().output;
    if output.len() > response_size_limit_bytes {
        return Err(SandboxError::ResponseTooLarge {
            limit_bytes: response_size_limit_bytes,
        });
    }
    Ok(output)
}
