//! Well-known `WorkerTask` shapes (spec §6.2) and the `WorkerResponse`
//! envelope every submission returns. The coarse-grained-batching
//! helpers (`execute_vsa_batch`, `ann_search`, `add/update/remove
//! vector`) build these payloads so callers never hand-assemble JSON.

use bridge_shmem::SharedMemoryHandle;
use serde::Deserialize;
use serde_json::{json, Map, Value};

pub fn shm_handle_to_json(handle: &SharedMemoryHandle) -> Value {
    json!({ "name": handle.name, "offset": handle.offset, "size": handle.size })
}

/// `{ "success": bool, "error"?: string, ...fields }` (spec §6.2).
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl WorkerResponse {
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

pub fn shared_memory_create_task(size: usize) -> Map<String, Value> {
    json!({
        "operation": "shared_memory",
        "memory_operation": "create",
        "size": size,
    })
    .as_object()
    .unwrap()
    .clone()
}

pub fn shared_memory_destroy_task(name: &str) -> Map<String, Value> {
    json!({
        "operation": "shared_memory",
        "memory_operation": "destroy",
        "name": name,
    })
    .as_object()
    .unwrap()
    .clone()
}

pub fn vsa_batch_task(
    operation_name: &str,
    batch_size: usize,
    input_shm: &SharedMemoryHandle,
    output_shm: &SharedMemoryHandle,
) -> Map<String, Value> {
    json!({
        "operation": "vsa_batch",
        "operation_name": operation_name,
        "batch_size": batch_size,
        "input_shm": shm_handle_to_json(input_shm),
        "output_shm": shm_handle_to_json(output_shm),
    })
    .as_object()
    .unwrap()
    .clone()
}

pub fn ann_search_task(
    k: i32,
    similarity_threshold: f64,
    query_shm: &SharedMemoryHandle,
    results_shm: &SharedMemoryHandle,
) -> Map<String, Value> {
    json!({
        "operation": "ann_search",
        "k": k,
        "similarity_threshold": similarity_threshold,
        "query_shm": shm_handle_to_json(query_shm),
        "results_shm": shm_handle_to_json(results_shm),
    })
    .as_object()
    .unwrap()
    .clone()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorAction {
    Add,
    Update,
    Remove,
}

impl VectorAction {
    fn put_or_remove(self) -> &'static str {
        match self {
            VectorAction::Remove => "remove",
            VectorAction::Add | VectorAction::Update => "put",
        }
    }

    fn operation_name(self) -> &'static str {
        match self {
            VectorAction::Add => "add",
            VectorAction::Update => "update",
            VectorAction::Remove => "remove",
        }
    }
}

pub fn vector_operation_task(
    action: VectorAction,
    vector_id: i64,
    oid: &str,
    index_name: &str,
    vector_shm: Option<&SharedMemoryHandle>,
) -> Map<String, Value> {
    let mut config = Map::new();
    config.insert("oid".to_string(), json!(oid));
    config.insert("index_name".to_string(), json!(index_name));
    if let Some(shm) = vector_shm {
        config.insert("vector_shm".to_string(), shm_handle_to_json(shm));
    }

    json!({
        "operation": "vector_operations",
        "action": action.put_or_remove(),
        "vector_operation": action.operation_name(),
        "vector_id": vector_id,
        "config": config,
    })
    .as_object()
    .unwrap()
    .clone()
}
