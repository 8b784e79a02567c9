//! The channel back into the host VM: `send_message`/`get_slot`/
//! `set_slot` (spec §4.5) all bottom out in a `HostCaller`, and the
//! proxy runtime's `ForwardPortal` is just a thin adapter over the
//! same channel. Exactly one `HostCaller` implementation is installed
//! at `bridge_initialize` time; tests supply fakes.

use bridge_handles::ObjectHandle;
use bridge_marshal::HostValue;
use bridge_proxy::{ForwardError, ForwardPortal};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum HostCallError {
    /// The target object has no such message/slot.
    NotFound(String),
    /// Any other host-side failure (host VM exception, transport
    /// failure, and so on), captured textually.
    Other(String),
}

impl HostCallError {
    pub fn message(&self) -> &str {
        match self {
            HostCallError::NotFound(m) | HostCallError::Other(m) => m,
        }
    }
}

pub trait HostCaller: Send + Sync {
    fn send_message(&self, target: ObjectHandle, message: &str, args: Vec<HostValue>) -> Result<HostValue, HostCallError>;
    fn get_slot(&self, target: ObjectHandle, slot: &str) -> Result<HostValue, HostCallError>;
    fn set_slot(&self, target: ObjectHandle, slot: &str, value: HostValue) -> Result<(), HostCallError>;
}

/// Adapts a `HostCaller` into the `ForwardPortal` the proxy runtime
/// expects: `forward_fn` is always a zero/one-arg `send_message`.
pub struct HostCallForwarder(pub Arc<dyn HostCaller>);

impl ForwardPortal for HostCallForwarder {
    fn forward(&self, master: ObjectHandle, message: &str, args: Option<HostValue>) -> Result<HostValue, ForwardError> {
        let args = match args {
            Some(HostValue::List(items)) => items,
            Some(single) => vec![single],
            None => Vec::new(),
        };

        self.0.send_message(master, message, args).map_err(|err| match err {
            HostCallError::NotFound(m) => ForwardError::MissingSlot(m),
            HostCallError::Other(m) => ForwardError::Other(m),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct AlwaysMissing;
    impl HostCaller for AlwaysMissing {
        fn send_message(&self, _target: ObjectHandle, message: &str, _args: Vec<HostValue>) -> Result<HostValue, HostCallError> {
            Err(HostCallError::NotFound(message.to_string()))
        }
        fn get_slot(&self, _target: ObjectHandle, slot: &str) -> Result<HostValue, HostCallError> {
            Err(HostCallError::NotFound(slot.to_string()))
        }
        fn set_slot(&self, _target: ObjectHandle, _slot: &str, _value: HostValue) -> Result<(), HostCallError> {
            Ok(())
        }
    }

    #[test]
    fn forwarder_maps_not_found_to_missing_slot() {
        let forwarder = HostCallForwarder(Arc::new(AlwaysMissing));
        let err = forwarder.forward(ObjectHandle(1), "getX", None).unwrap_err();
        assert!(matches!(err, ForwardError::MissingSlot(m) if m == "getX"));
    }

    #[test]
    fn single_value_args_are_wrapped_in_a_list() {
        struct Echo;
        impl HostCaller for Echo {
            fn send_message(&self, _target: ObjectHandle, _message: &str, args: Vec<HostValue>) -> Result<HostValue, HostCallError> {
                Ok(HostValue::List(args))
            }
            fn get_slot(&self, _target: ObjectHandle, _slot: &str) -> Result<HostValue, HostCallError> {
                unimplemented!()
            }
            fn set_slot(&self, _target: ObjectHandle, _slot: &str, _value: HostValue) -> Result<(), HostCallError> {
                unimplemented!()
            }
        }

        let forwarder = HostCallForwarder(Arc::new(Echo));
        let result = forwarder.forward(ObjectHandle(1), "setSlot", Some(HostValue::String("x".to_string()))).unwrap();
        assert_eq!(result, HostValue::List(vec![HostValue::String("x".to_string())]));
    }
}
