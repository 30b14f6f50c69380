//! Structured errors for the bridge, plus a thread-local last-error slot.
//!
//! Every fallible operation returns a [`BridgeResult`]. Errors raised by a
//! native closure while script code is running cannot travel through the
//! interpreter as Rust values, so the block-function wrapper raises a
//! `NativeError` script exception and also records the original error here.
//! Retrieve it with [`last_error`] / [`take_last_error`].
//!
//! The slot is per thread: contexts are confined to one thread anyway.

use std::cell::RefCell;
use std::io;

use pyo3::exceptions::PySyntaxError;
use pyo3::prelude::*;
use thiserror::Error;

/// Errors surfaced by conversion, association, context and loading operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    // Value layer
    #[error("unsupported value kind: {0}")]
    UnsupportedValueKind(String),

    #[error("malformed point value: {0}")]
    MalformedPointValue(String),

    #[error("conversion failed: {0}")]
    ConversionFailed(String),

    // Association layer
    #[error("no script object is associated with this instance")]
    NoAssociatedScriptObject,

    #[error("method not found: {0}")]
    MethodNotFound(String),

    // Context layer
    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("{}", format_script_error(.message, .line, .column))]
    ScriptExecution {
        message: String,
        line: Option<u32>,
        column: Option<u32>,
    },

    #[error("context is not active")]
    ContextNotActive,

    /// Failure signalled by a registered native closure.
    #[error("native function failed: {0}")]
    Native(String),

    // Script loading
    #[error("script not found: {0}")]
    ScriptNotFound(String),

    #[error("io error: {0}")]
    Io(String),
}

fn format_script_error(message: &str, line: &Option<u32>, column: &Option<u32>) -> String {
    match (line, column) {
        (Some(line), Some(column)) => format!("script error at {line}:{column}: {message}"),
        (Some(line), None) => format!("script error at line {line}: {message}"),
        _ => format!("script error: {message}"),
    }
}

impl BridgeError {
    /// Shorthand for closures reporting their own failure.
    pub fn native(message: impl Into<String>) -> Self {
        BridgeError::Native(message.into())
    }

    /// Build a [`BridgeError::ScriptExecution`] from a Python exception.
    ///
    /// Syntax errors carry the offending line and offset. Runtime exceptions
    /// report the line of the innermost traceback frame.
    pub fn from_script(py: Python<'_>, err: PyErr) -> Self {
        let message = err.to_string();
        let (line, column) = if err.is_instance_of::<PySyntaxError>(py) {
            let value = err.value(py);
            (
                optional_u32(value.getattr("lineno").ok()),
                optional_u32(value.getattr("offset").ok()),
            )
        } else {
            (innermost_line(py, &err), None)
        };
        BridgeError::ScriptExecution {
            message,
            line,
            column,
        }
    }
}

impl From<io::Error> for BridgeError {
    fn from(err: io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

fn optional_u32(value: Option<Bound<'_, PyAny>>) -> Option<u32> {
    value.and_then(|v| v.extract::<Option<u32>>().ok().flatten())
}

fn innermost_line(py: Python<'_>, err: &PyErr) -> Option<u32> {
    let mut frame = err.traceback(py)?.into_any();
    loop {
        match frame.getattr("tb_next") {
            Ok(next) if !next.is_none() => frame = next,
            _ => break,
        }
    }
    optional_u32(frame.getattr("tb_lineno").ok())
}

// ==================== Last Error ====================

thread_local! {
    static LAST_ERROR: RefCell<Option<BridgeError>> = const { RefCell::new(None) };
}

/// Record an error for later retrieval by the host.
pub fn set_last_error(err: BridgeError) {
    LAST_ERROR.with(|cell| {
        *cell.borrow_mut() = Some(err);
    });
}

/// Clear the thread-local error.
pub fn clear_last_error() {
    LAST_ERROR.with(|cell| {
        *cell.borrow_mut() = None;
    });
}

/// The most recent error recorded on this thread, if any.
pub fn last_error() -> Option<BridgeError> {
    LAST_ERROR.with(|cell| cell.borrow().clone())
}

/// Take the most recent error, leaving the slot empty.
pub fn take_last_error() -> Option<BridgeError> {
    LAST_ERROR.with(|cell| cell.borrow_mut().take())
}
