//! Adapts the worker-dispatcher callback vtable inside `BridgeConfig`
//! into `bridge_core::worker_pool::WorkerRuntime`, so `DispatchCore`
//! never has to know it's ultimately talking to C function pointers
//! (spec §4.2, §4.6).

use crate::types::BridgeWorkerCallables;
use bridge_core::worker_pool::{WorkerCallables, WorkerPoolError, WorkerRuntime};
use std::ffi::{c_char, CStr, CString};

pub struct FfiWorkerRuntime {
    import_fn: extern "C" fn(*const c_char, *mut BridgeWorkerCallables) -> i32,
    initialize_fn: extern "C" fn(u32) -> i32,
    shutdown_fn: extern "C" fn() -> i32,
    submit_fn: extern "C" fn(*const c_char, *mut *mut c_char) -> i32,
    free_string: extern "C" fn(*mut c_char),
}

impl FfiWorkerRuntime {
    pub fn new(
        import_fn: extern "C" fn(*const c_char, *mut BridgeWorkerCallables) -> i32,
        initialize_fn: extern "C" fn(u32) -> i32,
        shutdown_fn: extern "C" fn() -> i32,
        submit_fn: extern "C" fn(*const c_char, *mut *mut c_char) -> i32,
        free_string: extern "C" fn(*mut c_char),
    ) -> Self {
        FfiWorkerRuntime {
            import_fn,
            initialize_fn,
            shutdown_fn,
            submit_fn,
            free_string,
        }
    }
}

impl WorkerRuntime for FfiWorkerRuntime {
    fn import(&self, import_candidates: &[String]) -> Result<WorkerCallables, WorkerPoolError> {
        let candidates_json =
            serde_json::to_string(import_candidates).map_err(|e| WorkerPoolError::ImportFailed(e.to_string()))?;
        let candidates_c = CString::new(candidates_json).map_err(|e| WorkerPoolError::ImportFailed(e.to_string()))?;

        let mut out = BridgeWorkerCallables {
            has_initialize_workers: 0,
            has_shutdown_workers: 0,
            has_submit_worker_task: 0,
        };
        let code = (self.import_fn)(candidates_c.as_ptr(), &mut out);
        if code != 0 {
            return Err(WorkerPoolError::ImportFailed(format!("worker_import callback returned {code}")));
        }

        Ok(WorkerCallables {
            has_initialize_workers: out.has_initialize_workers != 0,
            has_shutdown_workers: out.has_shutdown_workers != 0,
            has_submit_worker_task: out.has_submit_worker_task != 0,
        })
    }

    fn initialize_workers(&self, max_workers: usize) -> Result<(), WorkerPoolError> {
        let code = (self.initialize_fn)(max_workers as u32);
        if code != 0 {
            return Err(WorkerPoolError::ImportFailed(format!("worker_initialize callback returned {code}")));
        }
        Ok(())
    }

    fn shutdown_workers(&self) -> Result<(), WorkerPoolError> {
        let code = (self.shutdown_fn)();
        if code != 0 {
            return Err(WorkerPoolError::SubmitFailed(format!("worker_shutdown callback returned {code}")));
        }
        Ok(())
    }

    fn submit_worker_task(&self, task: serde_json::Value) -> Result<serde_json::Value, WorkerPoolError> {
        let task_c = CString::new(task.to_string()).map_err(|e| WorkerPoolError::SubmitFailed(e.to_string()))?;
        let mut out_ptr: *mut c_char = std::ptr::null_mut();

        let code = (self.submit_fn)(task_c.as_ptr(), &mut out_ptr);
        if code != 0 {
            return Err(WorkerPoolError::SubmitFailed(format!("worker_submit_task callback returned {code}")));
        }
        if out_ptr.is_null() {
            return Err(WorkerPoolError::SubmitFailed("worker_submit_task reported success but returned a null response".to_string()));
        }

        let response = unsafe { CStr::from_ptr(out_ptr) }.to_string_lossy().into_owned();
        (self.free_string)(out_ptr);
        serde_json::from_str(&response).map_err(|e| WorkerPoolError::SubmitFailed(e.to_string()))
    }
}
