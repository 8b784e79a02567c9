//! Adapts VM-H's message/slot callback vtable into
//! `bridge_core::host_call::HostCaller` (spec §4.5). Arguments and
//! results cross as JSON strings, matching the wire format the rest of
//! the bridge already uses for shared-memory payloads.

use bridge_core::host_call::{HostCallError, HostCaller};
use bridge_handles::ObjectHandle;
use bridge_marshal::HostValue;
use std::ffi::{c_char, CStr, CString};

/// Return code convention for every `host_*` callback: `0` success,
/// `1` target has no such message/slot, anything else an opaque
/// host-side failure.
const HOST_CALLBACK_NOT_FOUND: i32 = 1;

pub struct FfiHostCaller {
    send_message_fn: extern "C" fn(u64, *const c_char, *const c_char, *mut *mut c_char) -> i32,
    get_slot_fn: extern "C" fn(u64, *const c_char, *mut *mut c_char) -> i32,
    set_slot_fn: extern "C" fn(u64, *const c_char, *const c_char) -> i32,
    free_string: extern "C" fn(*mut c_char),
}

impl FfiHostCaller {
    pub fn new(
        send_message_fn: extern "C" fn(u64, *const c_char, *const c_char, *mut *mut c_char) -> i32,
        get_slot_fn: extern "C" fn(u64, *const c_char, *mut *mut c_char) -> i32,
        set_slot_fn: extern "C" fn(u64, *const c_char, *const c_char) -> i32,
        free_string: extern "C" fn(*mut c_char),
    ) -> Self {
        FfiHostCaller {
            send_message_fn,
            get_slot_fn,
            set_slot_fn,
            free_string,
        }
    }

    fn decode_out(&self, code: i32, ptr: *mut c_char, what: &str) -> Result<HostValue, HostCallError> {
        if code == HOST_CALLBACK_NOT_FOUND {
            return Err(HostCallError::NotFound(what.to_string()));
        }
        if code != 0 {
            return Err(HostCallError::Other(format!("host callback returned {code}")));
        }
        if ptr.is_null() {
            return Ok(HostValue::Nil);
        }
        let raw = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
        (self.free_string)(ptr);
        let json: serde_json::Value = serde_json::from_str(&raw).map_err(|e| HostCallError::Other(e.to_string()))?;
        Ok(bridge_marshal::host_value_from_json(json))
    }
}

fn other(err: impl std::fmt::Display) -> HostCallError {
    HostCallError::Other(err.to_string())
}

impl HostCaller for FfiHostCaller {
    fn send_message(&self, target: ObjectHandle, message: &str, args: Vec<HostValue>) -> Result<HostValue, HostCallError> {
        let message_c = CString::new(message).map_err(other)?;
        let args_json = serde_json::to_string(&bridge_marshal::host_value_to_json(&HostValue::List(args))).map_err(other)?;
        let args_c = CString::new(args_json).map_err(other)?;

        let mut out_ptr: *mut c_char = std::ptr::null_mut();
        let code = (self.send_message_fn)(target.0, message_c.as_ptr(), args_c.as_ptr(), &mut out_ptr);
        self.decode_out(code, out_ptr, message)
    }

    fn get_slot(&self, target: ObjectHandle, slot: &str) -> Result<HostValue, HostCallError> {
        let slot_c = CString::new(slot).map_err(other)?;
        let mut out_ptr: *mut c_char = std::ptr::null_mut();
        let code = (self.get_slot_fn)(target.0, slot_c.as_ptr(), &mut out_ptr);
        self.decode_out(code, out_ptr, slot)
    }

    fn set_slot(&self, target: ObjectHandle, slot: &str, value: HostValue) -> Result<(), HostCallError> {
        let slot_c = CString::new(slot).map_err(other)?;
        let value_json = serde_json::to_string(&bridge_marshal::host_value_to_json(&value)).map_err(other)?;
        let value_c = CString::new(value_json).map_err(other)?;

        let code = (self.set_slot_fn)(target.0, slot_c.as_ptr(), value_c.as_ptr());
        match code {
            0 => Ok(()),
            HOST_CALLBACK_NOT_FOUND => Err(HostCallError::NotFound(slot.to_string())),
            err_code => Err(HostCallError::Other(format!("host callback returned {err_code}"))),
        }
    }
}
