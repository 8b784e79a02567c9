//! Thread-local error store and the fixed error taxonomy shared by every
//! bridge component. The ABI facade is exception-free: a failing call
//! records a `(code, message)` pair here and returns only the code. The
//! caller then uses the two-call protocol (`last`/`clear`) to retrieve
//! the message.

use std::cell::RefCell;
use std::fmt;

/// Upper bound on a recorded error message, in UTF-8 bytes.
pub const MAX_MESSAGE_BYTES: usize = 1024;

/// The fixed taxonomy of bridge failures. Values are stable across
/// releases and double as the negative `BridgeResult` codes returned
/// from every `extern "C"` entry point.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("success")]
    Success = 0,
    #[error("null pointer argument")]
    NullPointer = -1,
    #[error("invalid handle")]
    InvalidHandle = -2,
    #[error("memory allocation failure")]
    MemoryAllocation = -3,
    #[error("worker runtime error")]
    WorkerRuntimeError = -4,
    #[error("shared memory error")]
    SharedMemory = -5,
    #[error("operation timed out")]
    Timeout = -6,
    #[error("bridge already initialized")]
    AlreadyInitialized = -7,
    #[error("bridge not initialized")]
    NotInitialized = -8,
    #[error("resource already exists")]
    AlreadyExists = -9,
    #[error("resource not found")]
    NotFound = -10,
    #[error("invalid argument")]
    InvalidArgument = -11,
    #[error("resource exhausted")]
    ResourceExhausted = -12,
}

impl ErrorKind {
    /// The `BridgeResult` value an ABI function should return for this kind.
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// A thread-local error record: the taxonomy code plus a bounded
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub code: ErrorKind,
    pub message: String,
}

impl ErrorRecord {
    fn new(code: ErrorKind, message: impl fmt::Display) -> Self {
        let mut message = message.to_string();
        truncate_to_byte_budget(&mut message, MAX_MESSAGE_BYTES);
        ErrorRecord { code, message }
    }
}

/// Truncate `s` in place to at most `max_bytes` UTF-8 bytes, never
/// splitting a multi-byte codepoint.
fn truncate_to_byte_budget(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

thread_local! {
    static LAST_ERROR: RefCell<Option<ErrorRecord>> = RefCell::new(None);
}

/// Record a failure on the calling thread. Called by any facade
/// function that fails, with the `ErrorKind` it is about to return.
pub fn record(code: ErrorKind, message: impl fmt::Display) {
    let record = ErrorRecord::new(code, message);
    LAST_ERROR.with(|cell| *cell.borrow_mut() = Some(record));
}

/// Mark the calling thread as having just completed a successful call,
/// clearing any previously recorded error per the two-call protocol.
pub fn record_success() {
    clear();
}

/// Read the calling thread's last recorded error, if any, without
/// clearing it.
pub fn last() -> Option<ErrorRecord> {
    LAST_ERROR.with(|cell| cell.borrow().clone())
}

/// Reset the calling thread's error record.
pub fn clear() {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = None);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_then_read_then_clear() {
        clear();
        assert!(last().is_none());

        record(ErrorKind::NotFound, "segment 'foo' not found");
        let err = last().expect("error was recorded");
        assert_eq!(err.code, ErrorKind::NotFound);
        assert_eq!(err.message, "segment 'foo' not found");

        // Reading again does not clear.
        assert!(last().is_some());

        clear();
        assert!(last().is_none());
    }

    #[test]
    fn success_clears_prior_error() {
        record(ErrorKind::Timeout, "slow");
        assert!(last().is_some());
        record_success();
        assert!(last().is_none());
    }

    #[test]
    fn message_is_truncated_to_byte_budget() {
        let huge = "x".repeat(MAX_MESSAGE_BYTES * 4);
        record(ErrorKind::InvalidArgument, &huge);
        let err = last().unwrap();
        assert!(err.message.len() <= MAX_MESSAGE_BYTES);
    }

    #[test]
    fn truncation_respects_utf8_boundaries() {
        // Each "é" is 2 bytes; build a string whose naive byte-cut would
        // land mid-codepoint.
        let mut s = "é".repeat(MAX_MESSAGE_BYTES); // 2*MAX bytes
        truncate_to_byte_budget(&mut s, MAX_MESSAGE_BYTES);
        assert!(s.len() <= MAX_MESSAGE_BYTES);
        assert!(std::str::from_utf8(s.as_bytes()).is_ok());
    }

    #[test]
    fn error_kind_codes_are_stable() {
        assert_eq!(ErrorKind::Success.code(), 0);
        assert_eq!(ErrorKind::NullPointer.code(), -1);
        assert_eq!(ErrorKind::ResourceExhausted.code(), -12);
    }

    #[test]
    fn threads_have_independent_records() {
        record(ErrorKind::Timeout, "main thread error");
        let handle = std::thread::spawn(|| {
            assert!(last().is_none());
            record(ErrorKind::NotFound, "worker thread error");
            last().unwrap().message
        });
        let worker_message = handle.join().unwrap();
        assert_eq!(worker_message, "worker thread error");
        assert_eq!(last().unwrap().message, "main thread error");
    }
}
