//! Bidirectional conversion between host-VM values and the UTF-8 JSON
//! byte payloads that cross the ABI boundary (spec §4.5 "Value
//! mapping"). Used by message/slot dispatch and by worker task
//! submission alike — both travel as JSON written into shared memory.

use std::fmt;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MarshalError {
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("expected a JSON object at the task boundary")]
    ExpectedJsonObject,
}

/// A host-VM value, as seen across the marshalling boundary. `Object`
/// stands in for any host value with no direct JSON shape (most
/// commonly a mapping key that is itself a host object) — it carries
/// enough to name itself when coerced to a JSON object key.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Nil,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<HostValue>),
    Mapping(Vec<(HostValue, HostValue)>),
    Object { name: Option<String>, address: u64 },
}

impl HostValue {
    /// Coerce this value to a JSON object key per the host→JSON key
    /// rules: numbers by exact textual representation, booleans as
    /// `true`/`false`, nil as `nil`, otherwise by object name or a
    /// `object_<addr>` fallback.
    pub fn coerce_to_key(&self) -> String {
        match self {
            HostValue::Nil => "nil".to_string(),
            HostValue::Bool(true) => "true".to_string(),
            HostValue::Bool(false) => "false".to_string(),
            HostValue::Number(n) => format_number_exact(*n),
            HostValue::String(s) => s.clone(),
            HostValue::Object { name, address } => name
                .clone()
                .unwrap_or_else(|| format!("object_{address:x}")),
            HostValue::List(_) | HostValue::Mapping(_) => {
                format!("object_{:x}", fallback_address(self))
            }
        }
    }
}

/// Format an `f64` the way a host numeric value's exact textual
/// representation would read: integral values print without a
/// trailing `.0`.
fn format_number_exact(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e18 {
        format!("{}", n as i64)
    } else {
        let mut s = format!("{n}");
        if !s.contains('.') && !s.contains('e') && !s.contains("inf") && !s.contains("NaN") {
            s.push_str(".0");
        }
        s
    }
}

/// A stand-in "address" for composite values used as mapping keys,
/// which have no real object identity on this side of the boundary.
fn fallback_address(value: &HostValue) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    struct DebugHash<'a>(&'a HostValue);
    impl Hash for DebugHash<'_> {
        fn hash<H: Hasher>(&self, state: &mut H) {
            format!("{:?}", self.0).hash(state);
        }
    }

    let mut hasher = DefaultHasher::new();
    DebugHash(value).hash(&mut hasher);
    hasher.finish()
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Nil => write!(f, "nil"),
            HostValue::Bool(b) => write!(f, "{b}"),
            HostValue::Number(n) => write!(f, "{}", format_number_exact(*n)),
            HostValue::String(s) => write!(f, "{s}"),
            HostValue::List(_) => write!(f, "<list>"),
            HostValue::Mapping(_) => write!(f, "<mapping>"),
            HostValue::Object { name, address } => match name {
                Some(name) => write!(f, "{name}"),
                None => write!(f, "object_{address:x}"),
            },
        }
    }
}

/// Decode raw UTF-8 JSON bytes into a `serde_json::Value`.
pub fn decode_json_bytes(bytes: &[u8]) -> Result<serde_json::Value, MarshalError> {
    let text = std::str::from_utf8(bytes).map_err(|_| MarshalError::InvalidUtf8)?;
    serde_json::from_str(text).map_err(|e| MarshalError::InvalidJson(e.to_string()))
}

/// Decode raw UTF-8 JSON bytes that must describe a JSON object (the
/// shape every `WorkerTask` and every `send_message` args array's
/// object elements must have at the top level where objects occur).
pub fn decode_json_object(bytes: &[u8]) -> Result<serde_json::Map<String, serde_json::Value>, MarshalError> {
    match decode_json_bytes(bytes)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(MarshalError::ExpectedJsonObject),
    }
}

/// JSON → host value (spec §4.5 "Value mapping", JSON→host direction).
pub fn host_value_from_json(value: serde_json::Value) -> HostValue {
    match value {
        serde_json::Value::Null => HostValue::Nil,
        serde_json::Value::Bool(b) => HostValue::Bool(b),
        serde_json::Value::Number(n) => HostValue::Number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => HostValue::String(s),
        serde_json::Value::Array(items) => HostValue::List(items.into_iter().map(host_value_from_json).collect()),
        serde_json::Value::Object(map) => HostValue::Mapping(
            map.into_iter()
                .map(|(k, v)| (HostValue::String(k), host_value_from_json(v)))
                .collect(),
        ),
    }
}

/// Host value → JSON (spec §4.5, host→JSON direction). Mapping keys
/// are coerced to strings per `HostValue::coerce_to_key`.
pub fn host_value_to_json(value: &HostValue) -> serde_json::Value {
    match value {
        HostValue::Nil => serde_json::Value::Null,
        HostValue::Bool(b) => serde_json::Value::Bool(*b),
        HostValue::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        HostValue::String(s) => serde_json::Value::String(s.clone()),
        HostValue::List(items) => serde_json::Value::Array(items.iter().map(host_value_to_json).collect()),
        HostValue::Mapping(entries) => {
            let mut map = serde_json::Map::with_capacity(entries.len());
            for (k, v) in entries {
                map.insert(k.coerce_to_key(), host_value_to_json(v));
            }
            serde_json::Value::Object(map)
        }
        HostValue::Object { .. } => serde_json::Value::String(value.to_string()),
    }
}

/// Serialize a host value to JSON bytes, suitable for writing into a
/// shared-memory result segment (the caller appends the trailing null
/// terminator the ABI contract requires).
pub fn encode_host_value(value: &HostValue) -> Vec<u8> {
    serde_json::to_vec(&host_value_to_json(value)).expect("HostValue always serializes to JSON")
}

/// Decode a JSON args array (spec §4.5 `send_message`: "decodes the
/// JSON array in `args_segment` into an ordered sequence of host
/// values") into a `Vec<HostValue>`. An empty/absent segment maps to a
/// zero-arg call by convention at the caller.
pub fn decode_args_array(bytes: &[u8]) -> Result<Vec<HostValue>, MarshalError> {
    match decode_json_bytes(bytes)? {
        serde_json::Value::Array(items) => Ok(items.into_iter().map(host_value_from_json).collect()),
        other => Ok(vec![host_value_from_json(other)]),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn json_scalars_round_trip() {
        for (json, expected) in [
            ("null", HostValue::Nil),
            ("true", HostValue::Bool(true)),
            ("false", HostValue::Bool(false)),
            ("42", HostValue::Number(42.0)),
            (r#""hi""#, HostValue::String("hi".to_string())),
        ] {
            let value = decode_json_bytes(json.as_bytes()).unwrap();
            let host = host_value_from_json(value);
            assert_eq!(host, expected);
            assert_eq!(decode_json_bytes(&encode_host_value(&host)).unwrap(), decode_json_bytes(json.as_bytes()).unwrap());
        }
    }

    #[test]
    fn arrays_preserve_insertion_order() {
        let value = decode_json_bytes(br#"[3, 1, 2]"#).unwrap();
        let host = host_value_from_json(value);
        assert_eq!(
            host,
            HostValue::List(vec![
                HostValue::Number(3.0),
                HostValue::Number(1.0),
                HostValue::Number(2.0)
            ])
        );
    }

    #[test]
    fn objects_become_string_keyed_mappings() {
        let value = decode_json_bytes(br#"{"a": 1, "b": "x"}"#).unwrap();
        let host = host_value_from_json(value);
        match host {
            HostValue::Mapping(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].0, HostValue::String("a".to_string()));
            }
            other => panic!("expected Mapping, got {other:?}"),
        }
    }

    #[test]
    fn non_string_keys_are_coerced_on_the_way_out() {
        let mapping = HostValue::Mapping(vec![
            (HostValue::Number(1.0), HostValue::String("one".to_string())),
            (HostValue::Bool(true), HostValue::String("yes".to_string())),
            (HostValue::Nil, HostValue::String("none".to_string())),
            (
                HostValue::Object { name: Some("widget".to_string()), address: 0xbeef },
                HostValue::String("named".to_string()),
            ),
            (
                HostValue::Object { name: None, address: 0xcafe },
                HostValue::String("anon".to_string()),
            ),
        ]);

        let json = host_value_to_json(&mapping);
        let obj = json.as_object().unwrap();
        assert_eq!(obj.get("1").unwrap(), "one");
        assert_eq!(obj.get("true").unwrap(), "yes");
        assert_eq!(obj.get("nil").unwrap(), "none");
        assert_eq!(obj.get("widget").unwrap(), "named");
        assert_eq!(obj.get("object_cafe").unwrap(), "anon");
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        assert_eq!(decode_json_bytes(&[0xff, 0xfe]), Err(MarshalError::InvalidUtf8));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(decode_json_bytes(b"{not json"), Err(MarshalError::InvalidJson(_))));
    }

    #[test]
    fn decode_json_object_requires_an_object() {
        assert_eq!(decode_json_object(b"[1,2,3]"), Err(MarshalError::ExpectedJsonObject));
        assert!(decode_json_object(br#"{"operation":"ping"}"#).is_ok());
    }

    #[test]
    fn args_array_of_empty_defaults_are_supported() {
        let args = decode_args_array(b"[]").unwrap();
        assert!(args.is_empty());
    }
}
