//! The proxy object: a cross-runtime ambassador implementing
//! differential inheritance over a host-VM master object (spec §4.7).
//! A proxy caches slots locally, delegates misses to the master via a
//! forward portal, and escalates true misses as `doesNotUnderstand`
//! rather than silently failing.

pub mod metrics;

use bridge_handles::{HandleError, ObjectHandle, PinTable};
use bridge_marshal::HostValue;
use bridge_obs::DiagnosticSink;
use fxhash::FxHashMap;
use metrics::{MetricsRecord, DEFAULT_RECENT_LIMIT};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProxyError {
    #[error("null master handle")]
    InvalidMasterHandle,
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error("proxy has no slot named '{0}'")]
    SlotNotFound(String),
    #[error("forward to master failed: {0}")]
    ForwardFailed(String),
}

/// The outcome of a single forward call to the master object.
#[derive(Debug, Clone)]
pub enum ForwardError {
    /// The master has no such slot/message — triggers the
    /// `doesNotUnderstand` escalation path.
    MissingSlot(String),
    /// Any other forwarding failure (worker runtime error, transport
    /// failure, and so on).
    Other(String),
}

impl ForwardError {
    fn is_missing_slot(&self) -> bool {
        match self {
            ForwardError::MissingSlot(_) => true,
            ForwardError::Other(msg) => msg.to_lowercase().contains("not found"),
        }
    }

    fn message(&self) -> &str {
        match self {
            ForwardError::MissingSlot(m) | ForwardError::Other(m) => m,
        }
    }
}

/// The message dispatch portal (spec §3 `Proxy.forward_fn`): sends a
/// message to the proxy's master object and returns its result. The
/// ABI facade implements this over `bridge_send_message`'s host-call
/// machinery; tests implement it directly.
pub trait ForwardPortal: Send + Sync {
    fn forward(&self, master: ObjectHandle, message: &str, args: Option<HostValue>) -> Result<HostValue, ForwardError>;
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

fn generate_object_id(master: ObjectHandle) -> String {
    let seq = NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed);
    format!("proxy_{:x}_{seq:x}", master.0)
}

/// Cross-runtime ambassador for one host object (spec §3 `Proxy`).
pub struct Proxy {
    object_id: String,
    master_handle: ObjectHandle,
    local_slots: Mutex<FxHashMap<String, HostValue>>,
    dispatch_metrics: Mutex<MetricsRecord>,
    forward: Arc<dyn ForwardPortal>,
    pins: Arc<PinTable>,
    diagnostics: Option<DiagnosticSink>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("object_id", &self.object_id)
            .field("master_handle", &self.master_handle)
            .field("local_slots", &self.local_slots)
            .field("dispatch_metrics", &self.dispatch_metrics)
            .field("pins", &self.pins)
            .finish_non_exhaustive()
    }
}

impl Proxy {
    /// Create a proxy ambassador for `handle`, pinning it in the host
    /// retain set. `object_id` defaults to a generated stable string
    /// when `None`.
    pub fn from_handle(
        handle: ObjectHandle,
        object_id: Option<String>,
        forward: Arc<dyn ForwardPortal>,
        pins: Arc<PinTable>,
        diagnostics: Option<DiagnosticSink>,
    ) -> Result<Proxy, ProxyError> {
        if handle.is_null() {
            return Err(ProxyError::InvalidMasterHandle);
        }
        pins.pin(handle, diagnostics.as_ref())?;

        Ok(Proxy {
            object_id: object_id.unwrap_or_else(|| generate_object_id(handle)),
            master_handle: handle,
            local_slots: Mutex::new(FxHashMap::default()),
            dispatch_metrics: Mutex::new(MetricsRecord::new(DEFAULT_RECENT_LIMIT)),
            forward,
            pins,
            diagnostics,
        })
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    pub fn master_handle(&self) -> ObjectHandle {
        self.master_handle
    }

    pub fn set_recent_limit(&self, limit: usize) {
        self.dispatch_metrics.lock().unwrap().set_recent_limit(limit);
    }

    pub fn metrics_snapshot(&self) -> MetricsRecord {
        self.dispatch_metrics.lock().unwrap().clone()
    }

    pub fn local_slots_snapshot(&self) -> Vec<(String, HostValue)> {
        self.local_slots
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Resolve one of the proxy's own built-in attributes, used as the
    /// fallback generic-attribute-access step in `get` before
    /// escalating to `doesNotUnderstand` (spec §4.7 step 3).
    fn generic_self_attribute(&self, name: &str) -> Option<HostValue> {
        match name {
            "object_id" => Some(HostValue::String(self.object_id.clone())),
            "local_slots" => Some(HostValue::Mapping(
                self.local_slots_snapshot()
                    .into_iter()
                    .map(|(k, v)| (HostValue::String(k), v))
                    .collect(),
            )),
            "invocations" => Some(HostValue::Number(self.metrics_snapshot().invocations as f64)),
            "failures" => Some(HostValue::Number(self.metrics_snapshot().failures as f64)),
            "success_rate" => Some(HostValue::Number(self.metrics_snapshot().success_rate())),
            _ => None,
        }
    }

    /// The choke-point dispatch wrapper (spec §4.7 "Metrics"): samples
    /// a monotonic clock around `forward`, then atomically updates
    /// every metric. Metric bookkeeping cannot fail in safe Rust, so
    /// there is no diagnostic path here — diagnostics are reserved for
    /// propagation failures in `set`/`delete`.
    fn dispatch(&self, message: &str, args: Option<HostValue>) -> Result<HostValue, ForwardError> {
        let start = Instant::now();
        let result = self.forward.forward(self.master_handle, message, args);
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        let mut metrics = self.dispatch_metrics.lock().unwrap();
        match &result {
            Ok(_) => metrics.record(message, true, duration_ms, time::OffsetDateTime::now_utc(), None),
            Err(err) => metrics.record(
                message,
                false,
                duration_ms,
                time::OffsetDateTime::now_utc(),
                Some(err.message().to_string()),
            ),
        }
        result
    }

    /// Synchronously forward a `proxyDidNotUnderstand_` escalation
    /// (spec §4.7 "doesNotUnderstand escalation"). The result is not
    /// retried; forwarding failures are reported as diagnostics only.
    fn escalate_does_not_understand(&self, slot: &str, error: Option<&str>) {
        let mut payload = vec![
            (HostValue::String("slot".to_string()), HostValue::String(slot.to_string())),
            (
                HostValue::String("objectId".to_string()),
                HostValue::String(self.object_id.clone()),
            ),
        ];
        if let Some(error) = error {
            payload.push((
                HostValue::String("error".to_string()),
                HostValue::String(error.to_string()),
            ));
        }

        if let Err(err) = self
            .forward
            .forward(self.master_handle, "proxyDidNotUnderstand_", Some(HostValue::Mapping(payload)))
        {
            bridge_obs::emit_diagnostic(
                self.diagnostics.as_ref(),
                "bridge-proxy",
                format!("doesNotUnderstand escalation for slot '{slot}' was not accepted: {}", err.message()),
            );
        }
    }

    /// Get a slot (spec §4.7 "Get"): local cache first, then
    /// delegation to the master, then generic self-attribute access,
    /// then `doesNotUnderstand` escalation.
    pub fn get(&self, name: &str) -> Result<HostValue, ProxyError> {
        if let Some(value) = self.local_slots.lock().unwrap().get(name) {
            return Ok(value.clone());
        }

        match self.dispatch(name, None) {
            Ok(value) => Ok(value),
            Err(err) if err.is_missing_slot() => {
                if let Some(value) = self.generic_self_attribute(name) {
                    return Ok(value);
                }
                self.escalate_does_not_understand(name, Some(err.message()));
                Err(ProxyError::SlotNotFound(name.to_string()))
            }
            Err(err) => Err(ProxyError::ForwardFailed(err.message().to_string())),
        }
    }

    /// Set a slot (spec §4.7 "Set"): store locally first (the local
    /// cache is the single source of truth for the running proxy),
    /// then best-effort propagate to the master.
    pub fn set(&self, name: &str, value: HostValue) -> Result<(), ProxyError> {
        self.local_slots.lock().unwrap().insert(name.to_string(), value.clone());

        let args = HostValue::List(vec![HostValue::String(name.to_string()), value]);
        if let Err(err) = self.dispatch("setSlot", Some(args)) {
            bridge_obs::emit_diagnostic(
                self.diagnostics.as_ref(),
                "bridge-proxy",
                format!("propagation of slot '{name}' failed: {}", err.message()),
            );
        }
        Ok(())
    }

    /// Delete a slot (spec §4.7 "Delete"): remove locally (raising if
    /// absent), then propagate the removal.
    pub fn delete(&self, name: &str) -> Result<(), ProxyError> {
        let removed = self.local_slots.lock().unwrap().remove(name);
        if removed.is_none() {
            return Err(ProxyError::SlotNotFound(name.to_string()));
        }

        let args = HostValue::List(vec![HostValue::String(name.to_string())]);
        if let Err(err) = self.dispatch("removeSlot", Some(args)) {
            bridge_obs::emit_diagnostic(
                self.diagnostics.as_ref(),
                "bridge-proxy",
                format!("propagation of slot '{name}' removal failed: {}", err.message()),
            );
        }
        Ok(())
    }

    /// Clone the proxy: a fresh ambassador sharing the same master
    /// handle (with its own new pin) but an empty local-slot cache —
    /// the FFI expression of prototypal cloning (spec §4.7 "Cloning").
    pub fn clone_proxy(&self) -> Result<Proxy, ProxyError> {
        Proxy::from_handle(
            self.master_handle,
            None,
            self.forward.clone(),
            self.pins.clone(),
            self.diagnostics.clone(),
        )
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if let Err(err) = self.pins.unpin(self.master_handle) {
            bridge_obs::emit_diagnostic(
                self.diagnostics.as_ref(),
                "bridge-proxy",
                format!("releasing pin on proxy teardown failed: {err}"),
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bridge_handles::RetainSubsystem;
    use std::sync::Mutex as StdMutex;

    struct FakeMaster {
        slots: StdMutex<FxHashMap<String, HostValue>>,
        escalations: StdMutex<Vec<String>>,
    }

    impl FakeMaster {
        fn new() -> Arc<Self> {
            Arc::new(FakeMaster {
                slots: StdMutex::new(FxHashMap::default()),
                escalations: StdMutex::new(Vec::new()),
            })
        }
    }

    impl ForwardPortal for FakeMaster {
        fn forward(&self, _master: ObjectHandle, message: &str, args: Option<HostValue>) -> Result<HostValue, ForwardError> {
            match message {
                "proxyDidNotUnderstand_" => {
                    if let Some(HostValue::Mapping(entries)) = args {
                        if let Some((_, HostValue::String(slot))) = entries.into_iter().find(|(k, _)| *k == HostValue::String("slot".to_string())) {
                            self.escalations.lock().unwrap().push(slot);
                        }
                    }
                    Ok(HostValue::Nil)
                }
                "setSlot" => {
                    if let Some(HostValue::List(mut items)) = args {
                        let value = items.pop().unwrap();
                        if let HostValue::String(name) = items.pop().unwrap() {
                            self.slots.lock().unwrap().insert(name, value);
                        }
                    }
                    Ok(HostValue::Nil)
                }
                "removeSlot" => {
                    if let Some(HostValue::List(mut items)) = args {
                        if let Some(HostValue::String(name)) = items.pop() {
                            self.slots.lock().unwrap().remove(&name);
                        }
                    }
                    Ok(HostValue::Nil)
                }
                other => match self.slots.lock().unwrap().get(other) {
                    Some(v) => Ok(v.clone()),
                    None => Err(ForwardError::MissingSlot(other.to_string())),
                },
            }
        }
    }

    fn harness() -> (Proxy, Arc<FakeMaster>, Arc<PinTable>) {
        let master = FakeMaster::new();
        let pins = Arc::new(PinTable::new(RetainSubsystem::Available));
        let proxy = Proxy::from_handle(ObjectHandle(99), None, master.clone(), pins.clone(), None).unwrap();
        (proxy, master, pins)
    }

    #[test]
    fn from_handle_rejects_null() {
        let master = FakeMaster::new();
        let pins = Arc::new(PinTable::new(RetainSubsystem::Available));
        assert_eq!(
            Proxy::from_handle(ObjectHandle::NULL, None, master, pins, None).unwrap_err(),
            ProxyError::InvalidMasterHandle
        );
    }

    #[test]
    fn from_handle_pins_master_and_drop_unpins() {
        let (proxy, _master, pins) = harness();
        assert_eq!(pins.pin_count(ObjectHandle(99)), 1);
        drop(proxy);
        assert_eq!(pins.pin_count(ObjectHandle(99)), 0);
    }

    #[test]
    fn get_hits_local_cache_before_forwarding() {
        let (proxy, _master, _pins) = harness();
        proxy.set("x", HostValue::Number(1.0)).unwrap();
        assert_eq!(proxy.get("x").unwrap(), HostValue::Number(1.0));
        assert_eq!(proxy.metrics_snapshot().invocations, 1); // only the `set` propagation dispatched
    }

    #[test]
    fn get_delegates_to_master_on_miss() {
        let (proxy, master, _pins) = harness();
        master.slots.lock().unwrap().insert("remote".to_string(), HostValue::String("value".to_string()));

        assert_eq!(proxy.get("remote").unwrap(), HostValue::String("value".to_string()));
        assert_eq!(proxy.metrics_snapshot().invocations, 1);
        assert_eq!(proxy.metrics_snapshot().failures, 0);
    }

    #[test]
    fn get_resolves_generic_self_attribute_before_escalating() {
        let (proxy, _master, _pins) = harness();
        assert_eq!(proxy.get("object_id").unwrap(), HostValue::String(proxy.object_id().to_string()));
    }

    #[test]
    fn get_escalates_does_not_understand_on_true_miss() {
        let (proxy, master, _pins) = harness();
        let err = proxy.get("totally_unknown").unwrap_err();
        assert_eq!(err, ProxyError::SlotNotFound("totally_unknown".to_string()));
        assert_eq!(master.escalations.lock().unwrap().as_slice(), ["totally_unknown"]);
    }

    #[test]
    fn set_stores_locally_even_if_propagation_would_fail() {
        let (proxy, _master, _pins) = harness();
        proxy.set("y", HostValue::Bool(true)).unwrap();
        assert_eq!(proxy.get("y").unwrap(), HostValue::Bool(true));
    }

    #[test]
    fn delete_removes_local_slot_and_propagates() {
        let (proxy, master, _pins) = harness();
        proxy.set("z", HostValue::Nil).unwrap();
        proxy.delete("z").unwrap();

        assert_eq!(proxy.local_slots_snapshot().len(), 0);
        assert!(!master.slots.lock().unwrap().contains_key("z"));
    }

    #[test]
    fn delete_missing_slot_is_an_error() {
        let (proxy, _master, _pins) = harness();
        assert_eq!(proxy.delete("nope").unwrap_err(), ProxyError::SlotNotFound("nope".to_string()));
    }

    #[test]
    fn clone_proxy_shares_master_but_starts_with_empty_slots() {
        let (proxy, _master, pins) = harness();
        proxy.set("carried", HostValue::Number(7.0)).unwrap();

        let clone = proxy.clone_proxy().unwrap();
        assert_eq!(clone.master_handle(), proxy.master_handle());
        assert_ne!(clone.object_id(), proxy.object_id());
        assert!(clone.local_slots_snapshot().is_empty());
        assert_eq!(pins.pin_count(ObjectHandle(99)), 2);
    }

    #[test]
    fn metrics_record_failures_from_forward_errors() {
        let (proxy, _master, _pins) = harness();
        let _ = proxy.get("nonexistent");
        let metrics = proxy.metrics_snapshot();
        assert_eq!(metrics.invocations, 1);
        assert_eq!(metrics.failures, 1);
        assert_eq!(metrics.success_streak, 0);
    }
}
