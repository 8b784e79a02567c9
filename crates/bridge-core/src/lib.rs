//! The Dispatch Core: routes host↔worker message, slot, and task
//! traffic via the shared-memory registry and the worker pool, and
//! aggregates every component's error type behind one `BridgeError`
//! the C-ABI facade can classify into the fixed taxonomy (spec §4.5,
//! §4.6, §7).

pub mod host_call;
pub mod task;
pub mod trace;
pub mod worker_pool;

use bridge_handles::{HandleError, ObjectHandle, PinTable, RetainSubsystem};
use bridge_marshal::{HostValue, MarshalError};
use bridge_obs::DiagnosticSink;
use bridge_proxy::{Proxy, ProxyError};
use bridge_shmem::{SharedMemoryHandle, ShmError};
use host_call::{HostCallError, HostCallForwarder, HostCaller};
use std::sync::Arc;
use worker_pool::{BridgeState, WorkerCallables, WorkerPool, WorkerPoolError, WorkerRuntime};

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    WorkerPool(#[from] WorkerPoolError),
    #[error("host call failed: {0}")]
    HostCall(String),
}

impl From<HostCallError> for BridgeError {
    fn from(err: HostCallError) -> Self {
        match err {
            HostCallError::NotFound(m) => BridgeError::HostCall(m),
            HostCallError::Other(m) => BridgeError::HostCall(m),
        }
    }
}

impl BridgeError {
    /// Map onto the fixed error taxonomy the ABI facade returns codes
    /// from (spec §7).
    pub fn classify(&self) -> bridge_error::ErrorKind {
        use bridge_error::ErrorKind;
        match self {
            BridgeError::Shm(e) => match e {
                ShmError::ZeroSizedSegment | ShmError::OutOfBounds { .. } => ErrorKind::InvalidArgument,
                ShmError::NotFound(_) => ErrorKind::NotFound,
                ShmError::LiveMappings { .. } | ShmError::NotMapped(_) => ErrorKind::SharedMemory,
            },
            BridgeError::Handle(e) => match e {
                HandleError::NullHandle => ErrorKind::NullPointer,
                HandleError::NotPinned(_) => ErrorKind::InvalidHandle,
            },
            BridgeError::Marshal(_) => ErrorKind::InvalidArgument,
            BridgeError::Proxy(e) => match e {
                ProxyError::InvalidMasterHandle => ErrorKind::InvalidHandle,
                ProxyError::Handle(_) => ErrorKind::InvalidHandle,
                ProxyError::SlotNotFound(_) => ErrorKind::NotFound,
                ProxyError::ForwardFailed(_) => ErrorKind::WorkerRuntimeError,
            },
            BridgeError::WorkerPool(e) => match e {
                WorkerPoolError::ImportFailed(_) | WorkerPoolError::SubmitFailed(_) | WorkerPoolError::StubModeTaskFailure => {
                    ErrorKind::WorkerRuntimeError
                }
                WorkerPoolError::NotInitialized => ErrorKind::NotInitialized,
            },
            BridgeError::HostCall(_) => ErrorKind::WorkerRuntimeError,
        }
    }
}

/// Arguments to `DispatchCore::initialize` (spec §4.2 `initialize`):
/// the worker-pool-facing slice of `BridgeConfig`. The retain
/// subsystem and diagnostic sink are fixed at `DispatchCore::new` time
/// since they shape the pin table and proxy wiring, not the worker
/// pool's boot sequence.
pub struct InitializeArgs {
    pub max_workers: usize,
    pub import_candidates: Vec<String>,
}

/// The bridge's central, process-global state: shared-memory registry,
/// object handle pin table, worker pool, and the channel back into the
/// host VM. One instance is created at `bridge_initialize` and torn
/// down at `bridge_shutdown`.
pub struct DispatchCore {
    pub shmem: bridge_shmem::Registry,
    pub pins: Arc<PinTable>,
    pub worker_pool: WorkerPool,
    host_caller: Arc<dyn HostCaller>,
    diagnostics: Option<DiagnosticSink>,
}

impl DispatchCore {
    pub fn new(runtime: Arc<dyn WorkerRuntime>, host_caller: Arc<dyn HostCaller>, retain: RetainSubsystem, diagnostics: Option<DiagnosticSink>) -> Self {
        DispatchCore {
            shmem: bridge_shmem::Registry::new(),
            pins: Arc::new(PinTable::new(retain)),
            worker_pool: WorkerPool::new(runtime),
            host_caller,
            diagnostics,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.worker_pool.state()
    }

    pub fn initialize(&self, args: &InitializeArgs) -> Result<(), BridgeError> {
        Ok(self.worker_pool.initialize(args.max_workers, &args.import_candidates)?)
    }

    pub fn shutdown(&self) -> Result<(), BridgeError> {
        self.worker_pool.shutdown()?;
        self.shmem.clear();
        Ok(())
    }

    /// Retain `handle` in the host GC's retain set (spec §4.4).
    pub fn pin_object(&self, handle: ObjectHandle) -> Result<(), BridgeError> {
        Ok(self.pins.pin(handle, self.diagnostics.as_ref())?)
    }

    /// Release one pin previously taken via `pin_object`.
    pub fn unpin_object(&self, handle: ObjectHandle) -> Result<(), BridgeError> {
        Ok(self.pins.unpin(handle)?)
    }

    /// Wrap `handle` in a fresh proxy whose forward portal calls back
    /// into the installed `HostCaller` (spec §4.7 `proxy_from_handle`).
    pub fn make_proxy(&self, handle: ObjectHandle, object_id: Option<String>) -> Result<Proxy, BridgeError> {
        let portal = Arc::new(HostCallForwarder(self.host_caller.clone()));
        Ok(Proxy::from_handle(handle, object_id, portal, self.pins.clone(), self.diagnostics.clone())?)
    }

    pub fn send_message(&self, target: ObjectHandle, message: &str, args_json: Option<&[u8]>) -> Result<Vec<u8>, BridgeError> {
        let args = match args_json {
            Some(bytes) if !bytes.is_empty() => bridge_marshal::decode_args_array(bytes)?,
            _ => Vec::new(),
        };
        let result = self.host_caller.send_message(target, message, args)?;
        Ok(bridge_marshal::encode_host_value(&result))
    }

    pub fn get_slot(&self, target: ObjectHandle, slot: &str) -> Result<Vec<u8>, BridgeError> {
        let result = self.host_caller.get_slot(target, slot)?;
        Ok(bridge_marshal::encode_host_value(&result))
    }

    pub fn set_slot(&self, target: ObjectHandle, slot: &str, value_json: &[u8]) -> Result<(), BridgeError> {
        let value = bridge_marshal::host_value_from_json(bridge_marshal::decode_json_bytes(value_json)?);
        Ok(self.host_caller.set_slot(target, slot, value)?)
    }

    pub fn submit_json_task(&self, request_json: &[u8]) -> Result<Vec<u8>, BridgeError> {
        let mut obj = bridge_marshal::decode_json_object(request_json)?;
        trace::ensure_trace_context(&mut obj);
        let response = self.worker_pool.submit(serde_json::Value::Object(obj))?;
        Ok(serde_json::to_vec(&response).expect("worker response serializes"))
    }

    fn submit_built_task(&self, mut obj: serde_json::Map<String, serde_json::Value>) -> Result<Vec<u8>, BridgeError> {
        trace::ensure_trace_context(&mut obj);
        let response = self.worker_pool.submit(serde_json::Value::Object(obj))?;
        Ok(serde_json::to_vec(&response).expect("worker response serializes"))
    }

    pub fn execute_vsa_batch(
        &self,
        operation_name: &str,
        batch_size: usize,
        input_shm: &SharedMemoryHandle,
        output_shm: &SharedMemoryHandle,
    ) -> Result<Vec<u8>, BridgeError> {
        self.submit_built_task(task::vsa_batch_task(operation_name, batch_size, input_shm, output_shm))
    }

    pub fn ann_search(
        &self,
        k: i32,
        similarity_threshold: f64,
        query_shm: &SharedMemoryHandle,
        results_shm: &SharedMemoryHandle,
    ) -> Result<Vec<u8>, BridgeError> {
        self.submit_built_task(task::ann_search_task(k, similarity_threshold, query_shm, results_shm))
    }

    pub fn vector_operation(
        &self,
        action: task::VectorAction,
        vector_id: i64,
        oid: &str,
        index_name: &str,
        vector_shm: Option<&SharedMemoryHandle>,
    ) -> Result<Vec<u8>, BridgeError> {
        self.submit_built_task(task::vector_operation_task(action, vector_id, oid, index_name, vector_shm))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bridge_marshal::HostValue;

    struct FakeRuntime;
    impl WorkerRuntime for FakeRuntime {
        fn import(&self, _candidates: &[String]) -> Result<WorkerCallables, WorkerPoolError> {
            Ok(WorkerCallables::complete())
        }
        fn initialize_workers(&self, _max_workers: usize) -> Result<(), WorkerPoolError> {
            Ok(())
        }
        fn shutdown_workers(&self) -> Result<(), WorkerPoolError> {
            Ok(())
        }
        fn submit_worker_task(&self, task: serde_json::Value) -> Result<serde_json::Value, WorkerPoolError> {
            assert!(task["trace_context"]["traceparent"].is_string());
            Ok(serde_json::json!({"success": true, "echo": task["operation"]}))
        }
    }

    struct FakeHost;
    impl HostCaller for FakeHost {
        fn send_message(&self, _target: ObjectHandle, message: &str, args: Vec<HostValue>) -> Result<HostValue, HostCallError> {
            if message == "missing" {
                return Err(HostCallError::NotFound(message.to_string()));
            }
            Ok(HostValue::List(args))
        }
        fn get_slot(&self, _target: ObjectHandle, slot: &str) -> Result<HostValue, HostCallError> {
            Ok(HostValue::String(format!("value-of-{slot}")))
        }
        fn set_slot(&self, _target: ObjectHandle, _slot: &str, _value: HostValue) -> Result<(), HostCallError> {
            Ok(())
        }
    }

    fn core() -> DispatchCore {
        DispatchCore::new(Arc::new(FakeRuntime), Arc::new(FakeHost), RetainSubsystem::Available, None)
    }

    #[test]
    fn send_message_round_trips_through_json() {
        let core = core();
        let result = core.send_message(ObjectHandle(1), "echo", Some(br#"["a", 1, true]"#)).unwrap();
        assert_eq!(result, br#"["a",1,true]"#);
    }

    #[test]
    fn get_slot_encodes_result_as_json() {
        let core = core();
        let result = core.get_slot(ObjectHandle(1), "name").unwrap();
        assert_eq!(result, br#""value-of-name""#);
    }

    #[test]
    fn submit_json_task_injects_trace_context() {
        let core = core();
        core.initialize(&InitializeArgs {
            max_workers: 2,
            import_candidates: vec!["worker_dispatch".to_string()],
        })
        .unwrap();

        let response = core.submit_json_task(br#"{"operation": "ping"}"#).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["echo"], "ping");
    }

    #[test]
    fn execute_vsa_batch_builds_and_submits_the_task() {
        let core = core();
        core.initialize(&InitializeArgs {
            max_workers: 1,
            import_candidates: vec![],
        })
        .unwrap();

        let input = SharedMemoryHandle { name: "in".to_string(), offset: 0, size: 16 };
        let output = SharedMemoryHandle { name: "out".to_string(), offset: 0, size: 16 };
        let response = core.execute_vsa_batch("bind", 4, &input, &output).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(value["echo"], "vsa_batch");
    }

    #[test]
    fn pin_object_and_unpin_object_are_reference_counted() {
        let core = core();
        core.pin_object(ObjectHandle(9)).unwrap();
        core.pin_object(ObjectHandle(9)).unwrap();
        assert_eq!(core.pins.pin_count(ObjectHandle(9)), 2);

        core.unpin_object(ObjectHandle(9)).unwrap();
        assert_eq!(core.pins.pin_count(ObjectHandle(9)), 1);
    }

    #[test]
    fn make_proxy_pins_and_proxy_escalates_on_unknown_message() {
        let core = core();
        let proxy = core.make_proxy(ObjectHandle(5), None).unwrap();
        assert_eq!(core.pins.pin_count(ObjectHandle(5)), 1);

        let err = proxy.get("missing").unwrap_err();
        assert_eq!(err, ProxyError::SlotNotFound("missing".to_string()));
    }
}
