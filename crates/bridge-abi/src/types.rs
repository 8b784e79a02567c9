//! `#[repr(C)]` surface types shared by every entry point: the handle
//! structs that cross the boundary by value, `BridgeConfig`/
//! `BridgeStatus`, and the small helpers every facade function uses to
//! validate a pointer before touching it (spec §6.1).

use bridge_error::ErrorKind;
use std::ffi::{c_char, CStr};

/// `zero = success; negative codes per §7`.
pub type BridgeResult = i32;

/// An opaque cross-runtime object reference. `0` is never a live handle.
pub type BridgeObjectHandle = u64;

/// `(name, offset, size)` (spec §3 `SharedMemoryHandle`). `name` is an
/// owned, null-terminated C string allocated by `bridge_create_shared_memory`
/// and freed by `bridge_destroy_shared_memory`.
#[repr(C)]
pub struct BridgeSharedMemoryHandle {
    pub name: *mut c_char,
    pub offset: usize,
    pub size: usize,
}

/// Which of the three optional worker-dispatcher callables the host's
/// `worker_import` callback found. Mirrors `bridge_core::worker_pool::WorkerCallables`
/// across the ABI boundary as three bytes rather than a Rust `bool` triple.
#[repr(C)]
pub struct BridgeWorkerCallables {
    pub has_initialize_workers: u8,
    pub has_shutdown_workers: u8,
    pub has_submit_worker_task: u8,
}

/// `{ max_workers, log_sink }` (spec §3) plus the callback vtable a
/// host VM installs at `bridge_initialize` time: there is no way to
/// hand a Rust trait object across a C boundary, so RT-W's dispatcher
/// surface and VM-H's message/slot surface are each a handful of
/// `extern "C" fn` pointers operating on null-terminated JSON strings.
/// `free_string` must release a string previously returned by any of
/// the `out_*` callbacks below (mirroring whichever allocator produced
/// it on the host side).
#[repr(C)]
pub struct BridgeConfig {
    pub max_workers: u32,

    /// Optional: receives `(level, message)` for every `tracing` event
    /// emitted by the bridge, once installed. `0=trace 1=debug 2=info
    /// 3=warn 4=error`. May be null to log to stderr only.
    pub log_sink: Option<extern "C" fn(level: i32, message: *const c_char)>,

    /// `(target, message_json_args) -> result_json`, zero-arg call if
    /// `args_json` is null. Returns `0` on success, `1` if the target
    /// has no such message, any other value for every other failure.
    pub host_send_message:
        extern "C" fn(target: BridgeObjectHandle, message: *const c_char, args_json: *const c_char, out_result_json: *mut *mut c_char) -> i32,
    pub host_get_slot: extern "C" fn(target: BridgeObjectHandle, slot: *const c_char, out_result_json: *mut *mut c_char) -> i32,
    pub host_set_slot: extern "C" fn(target: BridgeObjectHandle, slot: *const c_char, value_json: *const c_char) -> i32,

    /// `(candidate_import_paths_json) -> callables`. Returns `0` on
    /// success (having imported the dispatcher module), nonzero if no
    /// candidate import path resolved.
    pub worker_import: extern "C" fn(candidates_json: *const c_char, out_callables: *mut BridgeWorkerCallables) -> i32,
    pub worker_initialize: extern "C" fn(max_workers: u32) -> i32,
    pub worker_shutdown: extern "C" fn() -> i32,
    pub worker_submit_task: extern "C" fn(task_json: *const c_char, out_response_json: *mut *mut c_char) -> i32,

    pub free_string: extern "C" fn(ptr: *mut c_char),
}

/// `{ initialized, max_workers, active_workers, last_error_snapshot }`
/// (spec §4.2). `last_error_snapshot` is a fixed-capacity byte buffer
/// rather than a pointer so `bridge_status` never allocates.
#[repr(C)]
pub struct BridgeStatus {
    pub initialized: bool,
    pub max_workers: u32,
    pub active_workers: u32,
    pub segment_count: u32,
    pub last_error_snapshot: [c_char; 256],
}

/// `(ErrorKind, message)` — the ABI-local error carried through a
/// facade function's body before being written to the thread-local
/// error store and collapsed to a `BridgeResult` code.
pub type AbiError = (ErrorKind, String);
pub type AbiResult<T> = Result<T, AbiError>;

pub fn abi_err(kind: ErrorKind, message: impl std::fmt::Display) -> AbiError {
    (kind, message.to_string())
}

pub fn core_err(err: bridge_core::BridgeError) -> AbiError {
    let kind = err.classify();
    (kind, err.to_string())
}

/// Run `body`, then record either success (clearing any prior error)
/// or the returned `(kind, message)` to the thread-local error store,
/// and collapse to the `BridgeResult` the caller sees.
pub fn finish<T>(body: impl FnOnce() -> AbiResult<T>) -> BridgeResult {
    match body() {
        Ok(_) => {
            bridge_error::record_success();
            ErrorKind::Success.code()
        }
        Err((kind, message)) => {
            bridge_error::record(kind, message);
            kind.code()
        }
    }
}

pub unsafe fn require<'a, T>(ptr: *const T) -> AbiResult<&'a T> {
    if ptr.is_null() {
        Err(abi_err(ErrorKind::NullPointer, "required pointer argument was null"))
    } else {
        Ok(&*ptr)
    }
}

pub unsafe fn require_mut<'a, T>(ptr: *mut T) -> AbiResult<&'a mut T> {
    if ptr.is_null() {
        Err(abi_err(ErrorKind::NullPointer, "required pointer argument was null"))
    } else {
        Ok(&mut *ptr)
    }
}

pub unsafe fn require_str<'a>(ptr: *const c_char) -> AbiResult<&'a str> {
    if ptr.is_null() {
        return Err(abi_err(ErrorKind::NullPointer, "required string argument was null"));
    }
    CStr::from_ptr(ptr).to_str().map_err(|e| abi_err(ErrorKind::InvalidArgument, e))
}

/// Read the JSON string a `worker_submit_task`/`host_*` callback wrote
/// into `*out_json`, then free it via `free_string`.
pub unsafe fn take_out_json(ptr: *mut c_char, free_string: extern "C" fn(*mut c_char)) -> AbiResult<String> {
    if ptr.is_null() {
        return Err(abi_err(ErrorKind::WorkerRuntimeError, "callback reported success but returned a null string"));
    }
    let owned = CStr::from_ptr(ptr).to_string_lossy().into_owned();
    free_string(ptr);
    Ok(owned)
}

pub fn to_rust_handle(c: &BridgeSharedMemoryHandle) -> AbiResult<bridge_shmem::SharedMemoryHandle> {
    let name = unsafe { require_str(c.name) }?;
    Ok(bridge_shmem::SharedMemoryHandle {
        name: name.to_string(),
        offset: c.offset,
        size: c.size,
    })
}
