//! Worker pool coordination: booting RT-W, caching which optional
//! callables it exposes, and quarantining every call to it behind a
//! single scoped lock standing in for RT-W's global interpreter lock
//! (spec §4.2, §4.6 "GIL/global-lock quarantine", §4.9).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum WorkerPoolError {
    #[error("failed to import worker dispatcher module: {0}")]
    ImportFailed(String),
    #[error("worker task submission failed: {0}")]
    SubmitFailed(String),
    #[error("worker runtime is in degraded stub mode; task rejected")]
    StubModeTaskFailure,
    #[error("worker pool is not initialized")]
    NotInitialized,
}

/// Which optional callables a successfully imported dispatcher module
/// exposed. Missing any of them puts the bridge in degraded mode
/// (spec §4.2).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerCallables {
    pub has_initialize_workers: bool,
    pub has_shutdown_workers: bool,
    pub has_submit_worker_task: bool,
}

impl WorkerCallables {
    pub fn complete() -> Self {
        WorkerCallables {
            has_initialize_workers: true,
            has_shutdown_workers: true,
            has_submit_worker_task: true,
        }
    }

    pub fn is_complete(self) -> bool {
        self.has_initialize_workers && self.has_shutdown_workers && self.has_submit_worker_task
    }
}

/// Dependency-injected worker runtime (RT-W). The real implementation
/// embeds an interpreter and imports a dispatcher module by name; test
/// implementations fake all three operations directly.
pub trait WorkerRuntime: Send + Sync {
    fn import(&self, import_candidates: &[String]) -> Result<WorkerCallables, WorkerPoolError>;
    fn initialize_workers(&self, max_workers: usize) -> Result<(), WorkerPoolError>;
    fn shutdown_workers(&self) -> Result<(), WorkerPoolError>;
    fn submit_worker_task(&self, task: serde_json::Value) -> Result<serde_json::Value, WorkerPoolError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Uninitialized,
    Initializing,
    Ready,
    Degraded,
    ShuttingDown,
}

pub struct WorkerPool {
    runtime: Arc<dyn WorkerRuntime>,
    gil: parking_lot::Mutex<()>,
    state: parking_lot::Mutex<BridgeState>,
    callables: parking_lot::Mutex<Option<WorkerCallables>>,
    max_workers: AtomicUsize,
    active_workers: AtomicUsize,
}

impl WorkerPool {
    pub fn new(runtime: Arc<dyn WorkerRuntime>) -> Self {
        WorkerPool {
            runtime,
            gil: parking_lot::Mutex::new(()),
            state: parking_lot::Mutex::new(BridgeState::Uninitialized),
            callables: parking_lot::Mutex::new(None),
            max_workers: AtomicUsize::new(0),
            active_workers: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.state.lock()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Idempotent: calling `initialize` while already `Ready` or
    /// `Degraded` is a no-op success (spec §4.2).
    pub fn initialize(&self, max_workers: usize, import_candidates: &[String]) -> Result<(), WorkerPoolError> {
        {
            let state = self.state.lock();
            if matches!(*state, BridgeState::Ready | BridgeState::Degraded) {
                return Ok(());
            }
        }
        *self.state.lock() = BridgeState::Initializing;

        // Scoped acquisition: the guard is dropped (and the lock released)
        // on every exit path, including the `?` early returns below.
        let next_state = (|| -> Result<BridgeState, WorkerPoolError> {
            let _gil = self.gil.lock();
            let callables = self.runtime.import(import_candidates)?;
            self.max_workers.store(max_workers, Ordering::SeqCst);

            if callables.is_complete() {
                self.runtime.initialize_workers(max_workers)?;
                self.active_workers.store(max_workers, Ordering::SeqCst);
                *self.callables.lock() = Some(callables);
                Ok(BridgeState::Ready)
            } else {
                tracing::warn!(
                    has_initialize = callables.has_initialize_workers,
                    has_shutdown = callables.has_shutdown_workers,
                    has_submit = callables.has_submit_worker_task,
                    "worker dispatcher missing optional callables; entering degraded stub mode"
                );
                *self.callables.lock() = Some(callables);
                Ok(BridgeState::Degraded)
            }
        })();

        match next_state {
            Ok(state) => {
                *self.state.lock() = state;
                Ok(())
            }
            Err(err) => {
                *self.state.lock() = BridgeState::Uninitialized;
                Err(err)
            }
        }
    }

    /// Safe to call multiple times, including before `initialize`.
    pub fn shutdown(&self) -> Result<(), WorkerPoolError> {
        if self.state() == BridgeState::Uninitialized {
            return Ok(());
        }
        *self.state.lock() = BridgeState::ShuttingDown;

        let result = (|| -> Result<(), WorkerPoolError> {
            let _gil = self.gil.lock();
            let has_shutdown = self.callables.lock().as_ref().map(|c| c.has_shutdown_workers).unwrap_or(false);
            if has_shutdown {
                self.runtime.shutdown_workers()?;
            }
            Ok(())
        })();

        self.active_workers.store(0, Ordering::SeqCst);
        *self.callables.lock() = None;
        *self.state.lock() = BridgeState::Uninitialized;
        result
    }

    /// Submit a task under the GIL quarantine. Rejected outright in
    /// every state but `Ready`; degraded mode reports a distinct
    /// failure code rather than blocking (spec §4.9).
    pub fn submit(&self, task: serde_json::Value) -> Result<serde_json::Value, WorkerPoolError> {
        match self.state() {
            BridgeState::Ready => {
                let _gil = self.gil.lock();
                self.runtime.submit_worker_task(task)
            }
            BridgeState::Degraded => Err(WorkerPoolError::StubModeTaskFailure),
            BridgeState::Uninitialized | BridgeState::Initializing | BridgeState::ShuttingDown => {
                Err(WorkerPoolError::NotInitialized)
            }
        }
    }
}
