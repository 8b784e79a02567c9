//! The cross-runtime object handle table: a counted pin set keyed by
//! `ObjectHandle`, defeating the fact that the host VM and the worker
//! runtime each run an independent garbage collector (spec §4.4, §9
//! "Cross-runtime GC coordination").
//!
//! The worker-runtime side only ever holds the opaque handle; all
//! proxy/handle interchange is mediated here rather than by raw
//! pointers.

use bridge_obs::DiagnosticSink;
use std::collections::HashMap;
use std::sync::Mutex;

/// Opaque identifier for a host-VM object. The bridge never interprets
/// the value — it is whatever the host VM uses to name one of its own
/// objects (an object table index, a tagged pointer, and so on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub u64);

impl ObjectHandle {
    pub const NULL: ObjectHandle = ObjectHandle(0);

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    #[error("null object handle")]
    NullHandle,
    #[error("object handle {0:?} is not currently pinned")]
    NotPinned(ObjectHandle),
}

/// Whether the host VM build exposes a retain subsystem the pin table
/// can register with. Builds without one (spec §4.4) still accept
/// `pin_object`/`unpin_object` calls but only record intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainSubsystem {
    Available,
    Unavailable,
}

/// Counted pin set. One instance lives inside the bridge's singleton
/// state, shared by every `bridge_pin_object`/`bridge_unpin_object`
/// call and consulted by the proxy runtime when it owns a master
/// handle.
#[derive(Debug)]
pub struct PinTable {
    retain: RetainSubsystem,
    counts: Mutex<HashMap<ObjectHandle, usize>>,
}

impl PinTable {
    pub fn new(retain: RetainSubsystem) -> Self {
        PinTable {
            retain,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Register one pin on `handle`. Idempotent-per-call: N calls
    /// require N matching `unpin` calls to fully release. On a build
    /// without a retain subsystem, the call records intent (a
    /// diagnostic) and reports success without tracking a count.
    pub fn pin(&self, handle: ObjectHandle, diagnostics: Option<&DiagnosticSink>) -> Result<(), HandleError> {
        if handle.is_null() {
            return Err(HandleError::NullHandle);
        }

        match self.retain {
            RetainSubsystem::Available => {
                let mut counts = self.counts.lock().unwrap();
                *counts.entry(handle).or_insert(0) += 1;
                tracing::trace!(handle = handle.0, "pinned object handle");
            }
            RetainSubsystem::Unavailable => {
                bridge_obs::emit_diagnostic(
                    diagnostics,
                    "bridge-handles",
                    format_args!("pin intent recorded for handle {:?} without a retain subsystem", handle),
                );
            }
        }

        Ok(())
    }

    /// Release one pin on `handle`. Fails with `NotPinned` if the
    /// handle currently has no outstanding pins (a caller bug — the
    /// bridge never unpins on its own initiative beyond what the host
    /// requested). A no-op success on retain-unavailable builds,
    /// mirroring `pin`'s degraded behavior.
    pub fn unpin(&self, handle: ObjectHandle) -> Result<(), HandleError> {
        if handle.is_null() {
            return Err(HandleError::NullHandle);
        }

        match self.retain {
            RetainSubsystem::Available => {
                let mut counts = self.counts.lock().unwrap();
                match counts.get_mut(&handle) {
                    None => Err(HandleError::NotPinned(handle)),
                    Some(count) => {
                        *count -= 1;
                        if *count == 0 {
                            counts.remove(&handle);
                        }
                        tracing::trace!(handle = handle.0, "unpinned object handle");
                        Ok(())
                    }
                }
            }
            RetainSubsystem::Unavailable => Ok(()),
        }
    }

    /// Current pin count for `handle`, for tests and status reporting.
    pub fn pin_count(&self, handle: ObjectHandle) -> usize {
        self.counts.lock().unwrap().get(&handle).copied().unwrap_or(0)
    }

    /// Number of distinct handles with at least one outstanding pin.
    pub fn pinned_object_count(&self) -> usize {
        self.counts.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn null_handle_is_rejected() {
        let table = PinTable::new(RetainSubsystem::Available);
        assert_eq!(table.pin(ObjectHandle::NULL, None), Err(HandleError::NullHandle));
        assert_eq!(table.unpin(ObjectHandle::NULL), Err(HandleError::NullHandle));
    }

    #[test]
    fn pins_are_reference_counted() {
        let table = PinTable::new(RetainSubsystem::Available);
        let handle = ObjectHandle(42);

        table.pin(handle, None).unwrap();
        table.pin(handle, None).unwrap();
        table.pin(handle, None).unwrap();
        assert_eq!(table.pin_count(handle), 3);

        table.unpin(handle).unwrap();
        assert_eq!(table.pin_count(handle), 2);
        table.unpin(handle).unwrap();
        table.unpin(handle).unwrap();
        assert_eq!(table.pin_count(handle), 0);
        assert_eq!(table.pinned_object_count(), 0);
    }

    #[test]
    fn unpin_without_a_pin_fails() {
        let table = PinTable::new(RetainSubsystem::Available);
        let handle = ObjectHandle(7);
        assert_eq!(table.unpin(handle), Err(HandleError::NotPinned(handle)));
    }

    #[test]
    fn degraded_mode_pin_always_succeeds_and_tracks_nothing() {
        let events = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let captured = events.clone();
        let sink: DiagnosticSink = std::sync::Arc::new(move |event| captured.lock().unwrap().push(event));

        let table = PinTable::new(RetainSubsystem::Unavailable);
        let handle = ObjectHandle(1);

        table.pin(handle, Some(&sink)).unwrap();
        table.unpin(handle).unwrap();
        assert_eq!(table.pin_count(handle), 0);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].component, "bridge-handles");
    }
}
