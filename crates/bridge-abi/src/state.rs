//! The bridge's process-global singleton: `bridge_initialize` installs
//! a `DispatchCore` wired to the host's callback vtable; every other
//! facade function borrows it. Swapped out wholesale by
//! `bridge_shutdown` so the next `bridge_initialize` starts clean
//! (spec §4.2, §4.9).

use crate::ffi_host::FfiHostCaller;
use crate::ffi_runtime::FfiWorkerRuntime;
use crate::types::{abi_err, BridgeConfig, BridgeResult};
use bridge_core::DispatchCore;
use bridge_error::ErrorKind;
use bridge_handles::RetainSubsystem;
use bridge_obs::DiagnosticEvent;
use std::ffi::CString;
use std::sync::Arc;

lazy_static::lazy_static! {
    static ref BRIDGE: parking_lot::RwLock<Option<DispatchCore>> = parking_lot::RwLock::new(None);
}

static TRACING_INSTALLED: std::sync::Once = std::sync::Once::new();

/// Borrow the installed `DispatchCore`, or fail with `NotInitialized`.
pub fn with_core<T>(f: impl FnOnce(&DispatchCore) -> crate::types::AbiResult<T>) -> crate::types::AbiResult<T> {
    let guard = BRIDGE.read();
    match guard.as_ref() {
        Some(core) => f(core),
        None => Err(abi_err(ErrorKind::NotInitialized, "bridge is not initialized")),
    }
}

pub fn is_installed() -> bool {
    BRIDGE.read().is_some()
}

/// `(Ready | Degraded)`, matching `bridge_status.initialized`.
pub fn is_ready_or_degraded() -> bool {
    BRIDGE
        .read()
        .as_ref()
        .map(|core| matches!(core.state(), bridge_core::worker_pool::BridgeState::Ready | bridge_core::worker_pool::BridgeState::Degraded))
        .unwrap_or(false)
}

fn install_tracing(config: &BridgeConfig) {
    TRACING_INSTALLED.call_once(|| {
        use tracing_subscriber::prelude::*;

        if let Some(log_sink) = config.log_sink {
            let handler = move |log: bridge_obs::Log| {
                let level = match log.level {
                    bridge_obs::LogLevel::Trace => 0,
                    bridge_obs::LogLevel::Debug => 1,
                    bridge_obs::LogLevel::Info => 2,
                    bridge_obs::LogLevel::Warn => 3,
                    bridge_obs::LogLevel::Error => 4,
                };
                if let Ok(message) = CString::new(log.message) {
                    log_sink(level, message.as_ptr());
                }
            };
            let env_filter = tracing_subscriber::EnvFilter::from_default_env();
            let _ = tracing_subscriber::registry()
                .with(bridge_obs::tracing_layer::Layer::new(handler, std::time::SystemTime::now).with_filter(env_filter))
                .try_init();
        } else {
            let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();
        }
    });
}

/// Build the `DiagnosticSink` that forwards unraisable proxy/pin
/// failures (spec §4.7, §7) to `config.log_sink`, if installed.
fn diagnostic_sink(config: &BridgeConfig) -> Option<bridge_obs::DiagnosticSink> {
    let log_sink = config.log_sink?;
    Some(Arc::new(move |event: DiagnosticEvent| {
        if let Ok(message) = CString::new(format!("[{}] {}", event.component, event.message)) {
            log_sink(3, message.as_ptr());
        }
    }))
}

pub fn initialize(config: &BridgeConfig) -> BridgeResult {
    crate::types::finish(|| {
        install_tracing(config);

        let runtime = Arc::new(FfiWorkerRuntime::new(
            config.worker_import,
            config.worker_initialize,
            config.worker_shutdown,
            config.worker_submit_task,
            config.free_string,
        ));
        let host_caller = Arc::new(FfiHostCaller::new(config.host_send_message, config.host_get_slot, config.host_set_slot, config.free_string));

        let mut guard = BRIDGE.write();
        let already_active = guard
            .as_ref()
            .map(|core| matches!(core.state(), bridge_core::worker_pool::BridgeState::Ready | bridge_core::worker_pool::BridgeState::Degraded))
            .unwrap_or(false);
        if !already_active {
            *guard = Some(DispatchCore::new(runtime, host_caller, RetainSubsystem::Available, diagnostic_sink(config)));
        }
        let core = guard.as_ref().unwrap();

        core.initialize(&bridge_core::InitializeArgs {
            max_workers: config.max_workers as usize,
            import_candidates: vec!["worker_dispatch".to_string(), "synaptic_bridge_worker".to_string()],
        })
        .map_err(crate::types::core_err)
    })
}

pub fn shutdown() -> BridgeResult {
    crate::types::finish(|| {
        let guard = BRIDGE.read();
        if let Some(core) = guard.as_ref() {
            core.shutdown().map_err(crate::types::core_err)?;
        }
        Ok(())
    })
}
