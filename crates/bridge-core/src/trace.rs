//! W3C-style trace context propagation across the FFI boundary (spec
//! §4.6 "Trace propagation", §6.3).

use rand::RngCore;

/// A trace id or span id is "non-zero" if any of its bytes are nonzero.
fn random_nonzero_bytes<R: RngCore>(rng: &mut R, len: usize) -> Vec<u8> {
    loop {
        let mut bytes = vec![0u8; len];
        rng.fill_bytes(&mut bytes);
        if bytes.iter().any(|b| *b != 0) {
            return bytes;
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Generate a fresh `traceparent` of the form
/// `00-<32 hex trace id>-<16 hex span id>-01`.
pub fn generate_traceparent() -> String {
    let mut rng = rand::thread_rng();
    let trace_id = hex(&random_nonzero_bytes(&mut rng, 16));
    let span_id = hex(&random_nonzero_bytes(&mut rng, 8));
    format!("00-{trace_id}-{span_id}-01")
}

/// Ensure `task` carries a `trace_context.traceparent`, generating one
/// if absent, and defaulting `tracestate` to the empty string.
pub fn ensure_trace_context(task: &mut serde_json::Map<String, serde_json::Value>) {
    let needs_traceparent = !matches!(
        task.get("trace_context").and_then(|v| v.get("traceparent")),
        Some(serde_json::Value::String(s)) if !s.is_empty()
    );

    if !needs_traceparent {
        let trace_context = task.get_mut("trace_context").unwrap().as_object_mut().unwrap();
        trace_context
            .entry("tracestate")
            .or_insert_with(|| serde_json::Value::String(String::new()));
        return;
    }

    let mut trace_context = serde_json::Map::new();
    trace_context.insert("traceparent".to_string(), serde_json::Value::String(generate_traceparent()));
    trace_context.insert("tracestate".to_string(), serde_json::Value::String(String::new()));
    task.insert("trace_context".to_string(), serde_json::Value::Object(trace_context));
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn traceparent_has_expected_shape() {
        let tp = generate_traceparent();
        let parts: Vec<&str> = tp.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "00");
        assert_eq!(parts[1].len(), 32);
        assert_eq!(parts[2].len(), 16);
        assert_eq!(parts[3], "01");
        assert!(parts[1].chars().any(|c| c != '0'));
        assert!(parts[2].chars().any(|c| c != '0'));
    }

    #[test]
    fn missing_trace_context_is_generated() {
        let mut task = json!({"operation": "ping"}).as_object().unwrap().clone();
        ensure_trace_context(&mut task);

        let traceparent = task["trace_context"]["traceparent"].as_str().unwrap();
        assert!(traceparent.starts_with("00-"));
        assert_eq!(task["trace_context"]["tracestate"], "");
    }

    #[test]
    fn existing_traceparent_is_preserved() {
        let mut task = json!({
            "operation": "ping",
            "trace_context": {"traceparent": "00-aaaa-bbbb-01"}
        })
        .as_object()
        .unwrap()
        .clone();

        ensure_trace_context(&mut task);
        assert_eq!(task["trace_context"]["traceparent"], "00-aaaa-bbbb-01");
        assert_eq!(task["trace_context"]["tracestate"], "");
    }

    #[test]
    fn empty_traceparent_is_treated_as_absent() {
        let mut task = json!({
            "operation": "ping",
            "trace_context": {"traceparent": ""}
        })
        .as_object()
        .unwrap()
        .clone();

        ensure_trace_context(&mut task);
        assert_ne!(task["trace_context"]["traceparent"], "");
    }
}
