//! The single symbol surface VM-H bindings call into: lifecycle, the
//! two-call error protocol, shared-memory management, object handle
//! pinning, message/slot dispatch, and worker task submission (spec
//! §4.1, §6.1). Every entry point validates its arguments, quarantines
//! worker-runtime access behind `DispatchCore`'s own locking, records
//! failures to the thread-local error store, and returns a
//! `BridgeResult` code from the fixed taxonomy in `bridge-error`. None
//! of it ever unwinds across the boundary.

mod ffi_host;
mod ffi_runtime;
mod state;
mod types;

use bridge_core::task::VectorAction;
use bridge_error::ErrorKind;
use bridge_handles::ObjectHandle;
use std::ffi::{c_char, CStr, CString};
use types::{abi_err, core_err, finish, require, require_mut, require_str, to_rust_handle, AbiResult, BridgeConfig, BridgeObjectHandle, BridgeResult, BridgeSharedMemoryHandle, BridgeStatus};

/// Read the null-terminated JSON payload out of a mapped shared-memory
/// segment (everything up to the first NUL, or the whole segment).
fn read_shm_json(core: &bridge_core::DispatchCore, handle: &BridgeSharedMemoryHandle) -> AbiResult<Vec<u8>> {
    let rust_handle = to_rust_handle(handle)?;
    let ptr = core.shmem.map(&rust_handle).map_err(|e| core_err(e.into()))?;
    let slice = unsafe { std::slice::from_raw_parts(ptr, rust_handle.size) };
    let nul_at = slice.iter().position(|&b| b == 0).unwrap_or(rust_handle.size);
    let bytes = slice[..nul_at].to_vec();
    core.shmem.unmap(&rust_handle).map_err(|e| core_err(e.into()))?;
    Ok(bytes)
}

/// Write a JSON payload plus trailing NUL into a mapped shared-memory
/// segment (spec §4.5 "with trailing null terminator").
fn write_shm_json(core: &bridge_core::DispatchCore, handle: &BridgeSharedMemoryHandle, bytes: &[u8]) -> AbiResult<()> {
    let rust_handle = to_rust_handle(handle)?;
    if bytes.len() + 1 > rust_handle.size {
        return Err(abi_err(
            ErrorKind::SharedMemory,
            format!("result segment '{}' (size {}) is too small for a {}-byte payload", rust_handle.name, rust_handle.size, bytes.len()),
        ));
    }
    let ptr = core.shmem.map(&rust_handle).map_err(|e| core_err(e.into()))?;
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
        *ptr.add(bytes.len()) = 0;
    }
    core.shmem.unmap(&rust_handle).map_err(|e| core_err(e.into()))?;
    Ok(())
}

// ---------------------------------------------------------------- lifecycle

#[no_mangle]
pub extern "C" fn bridge_initialize(config: *const BridgeConfig) -> BridgeResult {
    let config = match unsafe { require(config) } {
        Ok(c) => c,
        Err((kind, message)) => {
            bridge_error::record(kind, message);
            return kind.code();
        }
    };
    state::initialize(config)
}

#[no_mangle]
pub extern "C" fn bridge_shutdown() -> BridgeResult {
    state::shutdown()
}

#[no_mangle]
pub extern "C" fn bridge_status(out: *mut BridgeStatus) -> BridgeResult {
    finish(|| {
        let out = unsafe { require_mut(out) }?;
        out.initialized = state::is_ready_or_degraded();

        let _ = state::with_core(|core| {
            out.max_workers = core.worker_pool.max_workers() as u32;
            out.active_workers = core.worker_pool.active_workers() as u32;
            out.segment_count = core.shmem.segment_count() as u32;
            Ok(())
        });

        let snapshot = match bridge_error::last() {
            Some(err) => err.message,
            None => String::new(),
        };
        write_fixed_cstr(&mut out.last_error_snapshot, &snapshot);
        Ok(())
    })
}

fn write_fixed_cstr(buf: &mut [c_char], s: &str) {
    let bytes = s.as_bytes();
    let max = buf.len().saturating_sub(1);
    let n = bytes.len().min(max);
    for (dst, src) in buf.iter_mut().zip(bytes[..n].iter()) {
        *dst = *src as c_char;
    }
    buf[n] = 0;
}

// ------------------------------------------------------------- error store

#[no_mangle]
pub extern "C" fn bridge_get_last_error(buf: *mut c_char, len: usize) -> BridgeResult {
    finish(|| {
        if buf.is_null() || len == 0 {
            return Err(abi_err(ErrorKind::NullPointer, "buffer must be non-null and non-empty"));
        }
        let message = bridge_error::last().map(|e| e.message).unwrap_or_default();
        let slice = unsafe { std::slice::from_raw_parts_mut(buf, len) };
        write_fixed_cstr(slice, &message);
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn bridge_clear_error() -> BridgeResult {
    finish(|| {
        bridge_error::clear();
        Ok(())
    })
}

// ------------------------------------------------------------------ pinning

#[no_mangle]
pub extern "C" fn bridge_pin_object(handle: BridgeObjectHandle) -> BridgeResult {
    finish(|| state::with_core(|core| core.pin_object(ObjectHandle(handle)).map_err(core_err)))
}

#[no_mangle]
pub extern "C" fn bridge_unpin_object(handle: BridgeObjectHandle) -> BridgeResult {
    finish(|| state::with_core(|core| core.unpin_object(ObjectHandle(handle)).map_err(core_err)))
}

// ------------------------------------------------------------ shared memory

#[no_mangle]
pub extern "C" fn bridge_create_shared_memory(size: usize, out: *mut BridgeSharedMemoryHandle) -> BridgeResult {
    finish(|| {
        let out = unsafe { require_mut(out) }?;
        state::with_core(|core| {
            let handle = core.shmem.create(size, "host").map_err(|e| core_err(e.into()))?;
            let name_c = CString::new(handle.name).map_err(|e| abi_err(ErrorKind::InvalidArgument, e))?;
            out.name = name_c.into_raw();
            out.offset = handle.offset;
            out.size = handle.size;
            Ok(())
        })
    })
}

#[no_mangle]
pub extern "C" fn bridge_destroy_shared_memory(handle: *mut BridgeSharedMemoryHandle) -> BridgeResult {
    finish(|| {
        let handle = unsafe { require_mut(handle) }?;
        let rust_handle = to_rust_handle(handle)?;
        state::with_core(|core| core.shmem.destroy(&rust_handle).map_err(|e| core_err(e.into())))?;

        unsafe {
            drop(CString::from_raw(handle.name));
        }
        handle.name = std::ptr::null_mut();
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn bridge_map_shared_memory(handle: *const BridgeSharedMemoryHandle, out_ptr: *mut *mut u8) -> BridgeResult {
    finish(|| {
        let handle = unsafe { require(handle) }?;
        let out_ptr = unsafe { require_mut(out_ptr) }?;
        let rust_handle = to_rust_handle(handle)?;
        state::with_core(|core| {
            *out_ptr = core.shmem.map(&rust_handle).map_err(|e| core_err(e.into()))?;
            Ok(())
        })
    })
}

#[no_mangle]
pub extern "C" fn bridge_unmap_shared_memory(handle: *const BridgeSharedMemoryHandle, _ptr: *mut u8) -> BridgeResult {
    finish(|| {
        let handle = unsafe { require(handle) }?;
        let rust_handle = to_rust_handle(handle)?;
        state::with_core(|core| core.shmem.unmap(&rust_handle).map_err(|e| core_err(e.into())))
    })
}

// ---------------------------------------------------------- message/slots

#[no_mangle]
pub extern "C" fn bridge_send_message(
    target: BridgeObjectHandle,
    message: *const c_char,
    args: *const BridgeSharedMemoryHandle,
    result: *const BridgeSharedMemoryHandle,
) -> BridgeResult {
    finish(|| {
        let message = unsafe { require_str(message) }?;
        state::with_core(|core| {
            let args_bytes = match unsafe { args.as_ref() } {
                Some(h) => Some(read_shm_json(core, h)?),
                None => None,
            };
            let response = core.send_message(ObjectHandle(target), message, args_bytes.as_deref()).map_err(core_err)?;
            if let Some(result) = unsafe { result.as_ref() } {
                write_shm_json(core, result, &response)?;
            }
            Ok(())
        })
    })
}

#[no_mangle]
pub extern "C" fn bridge_get_slot(target: BridgeObjectHandle, slot: *const c_char, result: *const BridgeSharedMemoryHandle) -> BridgeResult {
    finish(|| {
        let slot = unsafe { require_str(slot) }?;
        let result = unsafe { require(result) }?;
        state::with_core(|core| {
            let response = core.get_slot(ObjectHandle(target), slot).map_err(core_err)?;
            write_shm_json(core, result, &response)
        })
    })
}

#[no_mangle]
pub extern "C" fn bridge_set_slot(target: BridgeObjectHandle, slot: *const c_char, value: *const BridgeSharedMemoryHandle) -> BridgeResult {
    finish(|| {
        let slot = unsafe { require_str(slot) }?;
        let value = unsafe { require(value) }?;
        state::with_core(|core| {
            let value_bytes = read_shm_json(core, value)?;
            core.set_slot(ObjectHandle(target), slot, &value_bytes).map_err(core_err)
        })
    })
}

// -------------------------------------------------------------- worker tasks

#[no_mangle]
pub extern "C" fn bridge_submit_json_task(request: *const BridgeSharedMemoryHandle, response: *const BridgeSharedMemoryHandle) -> BridgeResult {
    finish(|| {
        let request = unsafe { require(request) }?;
        let response = unsafe { require(response) }?;
        state::with_core(|core| {
            let request_bytes = read_shm_json(core, request)?;
            let response_bytes = core.submit_json_task(&request_bytes).map_err(core_err)?;
            write_shm_json(core, response, &response_bytes)
        })
    })
}

#[no_mangle]
pub extern "C" fn bridge_execute_vsa_batch(
    operation_name: *const c_char,
    input: *const BridgeSharedMemoryHandle,
    output: *const BridgeSharedMemoryHandle,
    batch_size: usize,
) -> BridgeResult {
    finish(|| {
        let operation_name = unsafe { require_str(operation_name) }?;
        let input = unsafe { require(input) }?;
        let output = unsafe { require(output) }?;
        state::with_core(|core| {
            let input_handle = to_rust_handle(input)?;
            let output_handle = to_rust_handle(output)?;
            core.execute_vsa_batch(operation_name, batch_size, &input_handle, &output_handle).map(|_| ()).map_err(core_err)
        })
    })
}

#[no_mangle]
pub extern "C" fn bridge_ann_search(query: *const BridgeSharedMemoryHandle, k: i32, results: *const BridgeSharedMemoryHandle, similarity_threshold: f64) -> BridgeResult {
    finish(|| {
        let query = unsafe { require(query) }?;
        let results = unsafe { require(results) }?;
        state::with_core(|core| {
            let query_handle = to_rust_handle(query)?;
            let results_handle = to_rust_handle(results)?;
            core.ann_search(k, similarity_threshold, &query_handle, &results_handle).map(|_| ()).map_err(core_err)
        })
    })
}

/// `config_json` carries `{"oid": ..., "index_name": ...}` — the
/// symbol table (spec §6.1) gives these three mutations a single
/// trailing `const char*`, so the two strings travel together as JSON
/// rather than as two separate arguments.
fn vector_mutation(vector_id: i64, vector_shm: *const BridgeSharedMemoryHandle, config_json: *const c_char, action: VectorAction) -> BridgeResult {
    finish(|| {
        let config_json = unsafe { require_str(config_json) }?;
        let config: serde_json::Value = serde_json::from_str(config_json).map_err(|e| abi_err(ErrorKind::InvalidArgument, e))?;
        let oid = config
            .get("oid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| abi_err(ErrorKind::InvalidArgument, "config_json missing 'oid'"))?;
        let index_name = config
            .get("index_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| abi_err(ErrorKind::InvalidArgument, "config_json missing 'index_name'"))?;

        state::with_core(|core| {
            let vector_handle = unsafe { vector_shm.as_ref() }.map(to_rust_handle).transpose()?;
            core.vector_operation(action, vector_id, oid, index_name, vector_handle.as_ref())
                .map(|_| ())
                .map_err(core_err)
        })
    })
}

#[no_mangle]
pub extern "C" fn bridge_add_vector(vector_id: i64, vector_shm: *const BridgeSharedMemoryHandle, config_json: *const c_char) -> BridgeResult {
    vector_mutation(vector_id, vector_shm, config_json, VectorAction::Add)
}

#[no_mangle]
pub extern "C" fn bridge_update_vector(vector_id: i64, vector_shm: *const BridgeSharedMemoryHandle, config_json: *const c_char) -> BridgeResult {
    vector_mutation(vector_id, vector_shm, config_json, VectorAction::Update)
}

#[no_mangle]
pub extern "C" fn bridge_remove_vector(vector_id: i64, vector_shm: *const BridgeSharedMemoryHandle, config_json: *const c_char) -> BridgeResult {
    vector_mutation(vector_id, vector_shm, config_json, VectorAction::Remove)
}
