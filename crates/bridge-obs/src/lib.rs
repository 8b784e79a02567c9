//! Structured logging and diagnostic-sink plumbing shared by every bridge
//! component. All facade-visible failures travel through `bridge-error`;
//! everything here is for the *unraisable* side-channel — proxy metric
//! updates, propagation failures, and other events that must never
//! escape as an ABI error but still need to be observable (spec §4.7,
//! §7).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod tracing_layer;

/// Mirrors the bridge's `LogLevel` C-ABI enum; used both for the
/// structured log records below and for mapping `tracing::Level`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// A single structured log line, suitable for forwarding to the host
/// VM's own log aggregation. Timestamps are RFC3339 to match what most
/// host-side log collectors expect.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Log {
    #[serde(
        serialize_with = "time::serde::rfc3339::serialize",
        deserialize_with = "time::serde::rfc3339::deserialize"
    )]
    pub ts: time::OffsetDateTime,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Box<serde_json::value::RawValue>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spans: Vec<Log>,
}

/// A record of an internal bridge failure that must not be raised across
/// the ABI (proxy metric bookkeeping, propagation-on-set failures, and
/// the like). These are reported through a caller-supplied
/// [`DiagnosticSink`] rather than through the thread-local error store.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DiagnosticEvent {
    #[serde(
        serialize_with = "time::serde::rfc3339::serialize",
        deserialize_with = "time::serde::rfc3339::deserialize"
    )]
    pub ts: time::OffsetDateTime,
    pub component: String,
    pub message: String,
}

/// Callback invoked with each [`DiagnosticEvent`]. Cloned freely; the
/// bridge holds one inside its global config for the lifetime of a
/// `bridge_initialize`/`bridge_shutdown` cycle.
pub type DiagnosticSink = std::sync::Arc<dyn Fn(DiagnosticEvent) + Send + Sync>;

/// Record an unraisable failure: always logged via `tracing`, and
/// additionally forwarded to `sink` if one is installed. Never panics,
/// per the "metric updates must not raise" rule in spec §4.7.
pub fn emit_diagnostic(sink: Option<&DiagnosticSink>, component: &str, message: impl std::fmt::Display) {
    let message = message.to_string();
    tracing::warn!(component, %message, "unraisable diagnostic");

    if let Some(sink) = sink {
        let event = DiagnosticEvent {
            ts: time::OffsetDateTime::now_utc(),
            component: component.to_string(),
            message,
        };
        sink(event);
    }
}
