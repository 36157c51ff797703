//! Status codes and the internal unwind signal
//!
//! There is no native exception mechanism to lean on here: every engine
//! operation that can fail or suspend returns `Result<T, Signal>`, and the
//! signal says which of the two non-local transfers is in flight: an error
//! looking for the nearest recovery point, or a yield looking for the resume
//! boundary. Protected calls intercept errors; resume intercepts yields.
//! Nothing else is allowed to swallow a signal.

use rill_core::Value;
use std::fmt;

/// Outcome classification for calls, resumes, and loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Completed normally.
    Ok,
    /// Suspended in a yield; resumable.
    Yield,
    /// Runtime error (type error, limit error, explicit `error(...)`).
    RuntimeError,
    /// Chunk failed load-time validation.
    ChunkError,
    /// Allocation exceeded the memory budget even after a full collection.
    MemoryError,
    /// Error raised while running a finalizer.
    FinalizerError,
    /// Error raised while already handling an error. Fatal: never retried,
    /// caught only to be reported.
    HandlerError,
}

impl Status {
    /// Anything that should be handed to a recovery point.
    #[inline]
    pub fn is_error(self) -> bool {
        !matches!(self, Status::Ok | Status::Yield)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::Yield => "yield",
            Status::RuntimeError => "runtime error",
            Status::ChunkError => "chunk error",
            Status::MemoryError => "out of memory",
            Status::FinalizerError => "finalizer error",
            Status::HandlerError => "error in error handling",
        };
        f.write_str(s)
    }
}

/// An error in flight: the status class plus the carried value (any value;
/// by convention a message string enriched with source position).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorInfo {
    pub status: Status,
    pub value: Value,
}

/// The internal non-local transfer. `Err(Signal::...)` propagates up the
/// engine's own call structure until something entitled to intercept it
/// does; see module docs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    /// Unwinding toward the nearest recovery point on this task.
    Error(ErrorInfo),
    /// Unwinding toward the resume boundary of this task. The task's
    /// execution state already records the yielded values.
    Yield,
}

impl Signal {
    #[inline]
    pub fn error(status: Status, value: Value) -> Signal {
        Signal::Error(ErrorInfo { status, value })
    }
}

/// Host-facing error from a protected entry point: the status plus the
/// error value. Resolve the value against the owning runtime to display it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VmError {
    pub status: Status,
    pub value: Value,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status)
    }
}

impl std::error::Error for VmError {}
