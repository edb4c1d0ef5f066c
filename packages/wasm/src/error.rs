//! Error types for boundary operations

use crate::value::HostValue;
use std::fmt;
use thiserror::Error;

/// Result type for boundary operations
pub type BoundaryResult<T> = Result<T, BoundaryError>;

/// Errors that can occur while crossing the module/host boundary
#[derive(Error, Debug)]
pub enum BoundaryError {
    /// Bytes at a claimed range are not valid UTF-8
    #[error("Invalid UTF-8 at {ptr:#x}+{len}: {source}")]
    Decode {
        ptr: u32,
        len: u32,
        #[source]
        source: std::str::Utf8Error,
    },

    /// A host value was thrown during a capability call
    #[error("Host error thrown: {}", .0.debug_string())]
    Thrown(HostValue),

    /// Closure called after its single invocation or after release
    #[error("Closure {id} invoked after being consumed or released")]
    ClosureConsumed { id: u64 },

    /// Mutable closure called while a call is already in flight
    #[error("Closure {id} invoked recursively or after being dropped")]
    ClosureReentered { id: u64 },

    /// Attempt to free one of the constant slots
    #[error("Slot {0} is reserved and cannot be freed")]
    ReservedSlot(u32),

    /// Handle refers to an empty or out-of-range slot
    #[error("Invalid handle {0}: slot is empty or out of range")]
    InvalidHandle(u32),

    /// A second exception was stored before the first was taken
    #[error("Exception slot already holds handle {pending}")]
    ExceptionSlotOccupied { pending: u32 },

    /// Stream adapter used after close/cancel/abort/free
    #[error("{kind} used after ownership was transferred")]
    AdapterConsumed { kind: &'static str },

    /// Host value has the wrong variant for the requested access
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// Module asked for an import that was never linked
    #[error("Missing import {module}::{name}")]
    MissingImport { module: String, name: String },

    /// Required export not found in the module
    #[error("Missing required export: {export_name}")]
    MissingExport { export_name: String },

    /// Operation needs a module but none is attached
    #[error("No module attached to this boundary")]
    ModuleNotAttached,

    /// Memory access violation
    #[error("Memory access error: {message}")]
    MemoryAccess { message: String },

    /// Extern reference table cannot grow any further
    #[error("Extern reference table exhausted: {requested} slots requested, limit is {limit}")]
    TableExhausted { requested: usize, limit: usize },

    /// Linear memory cannot grow any further
    #[error("Failed to grow linear memory by {pages} pages: {message}")]
    MemoryGrow { pages: u64, message: String },

    /// Module code trapped or returned a malformed result
    #[error("Module trapped in {function}: {message}")]
    Trap { function: String, message: String },

    /// Failed to set up imports or attach a module
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Invalid TOML configuration
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BoundaryError {
    pub fn memory_access(message: impl Into<String>) -> Self {
        BoundaryError::MemoryAccess {
            message: message.into(),
        }
    }

    pub fn missing_export(export_name: impl Into<String>) -> Self {
        BoundaryError::MissingExport {
            export_name: export_name.into(),
        }
    }

    pub fn trap(function: impl Into<String>, message: impl Into<String>) -> Self {
        BoundaryError::Trap {
            function: function.into(),
            message: message.into(),
        }
    }

    /// Throw a fresh host `Error` carrying `message`
    pub fn thrown(message: impl Into<String>) -> Self {
        BoundaryError::Thrown(HostValue::error(message))
    }

    /// Only host throws are converted into values the module can branch on.
    /// Everything else is misuse or exhaustion and must propagate.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BoundaryError::Thrown(_))
    }

    /// Convert into a host value suitable for rejecting a promise
    pub fn into_thrown(self) -> HostValue {
        match self {
            BoundaryError::Thrown(value) => value,
            other => HostValue::error(other.to_string()),
        }
    }

    pub fn code(&self) -> BoundaryErrorCode {
        match self {
            BoundaryError::Decode { .. } => BoundaryErrorCode::InvalidUtf8,
            BoundaryError::Thrown(_) => BoundaryErrorCode::Thrown,
            BoundaryError::ClosureConsumed { .. } | BoundaryError::ClosureReentered { .. } => {
                BoundaryErrorCode::ClosureState
            }
            BoundaryError::ReservedSlot(_) | BoundaryError::InvalidHandle(_) => {
                BoundaryErrorCode::InvalidHandle
            }
            BoundaryError::ExceptionSlotOccupied { .. } => BoundaryErrorCode::ExceptionPending,
            BoundaryError::AdapterConsumed { .. } => BoundaryErrorCode::ClosureState,
            BoundaryError::TypeMismatch { .. } => BoundaryErrorCode::InvalidArgument,
            BoundaryError::MissingImport { .. }
            | BoundaryError::MissingExport { .. }
            | BoundaryError::ModuleNotAttached => BoundaryErrorCode::NotFound,
            BoundaryError::MemoryAccess { .. } => BoundaryErrorCode::MemoryAccess,
            BoundaryError::TableExhausted { .. } | BoundaryError::MemoryGrow { .. } => {
                BoundaryErrorCode::OutOfMemory
            }
            BoundaryError::Trap { .. } => BoundaryErrorCode::Trap,
            BoundaryError::Initialization(_)
            | BoundaryError::Config(_)
            | BoundaryError::Json(_) => BoundaryErrorCode::Internal,
        }
    }
}

/// Integer error words written back into module memory
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryErrorCode {
    /// Success
    Ok = 0,
    /// Host value thrown, stored in the exception slot
    Thrown = -1,
    /// Invalid argument
    InvalidArgument = -2,
    /// Import, export or module not found
    NotFound = -3,
    /// Handle is reserved, freed or out of range
    InvalidHandle = -4,
    /// Table or memory exhausted
    OutOfMemory = -5,
    /// Out-of-bounds memory access
    MemoryAccess = -6,
    /// Closure or adapter used in the wrong lifecycle state
    ClosureState = -7,
    /// Exception slot already occupied
    ExceptionPending = -8,
    /// Module trapped
    Trap = -9,
    /// Invalid UTF-8
    InvalidUtf8 = -10,
    /// Internal error
    Internal = -11,
}

impl BoundaryErrorCode {
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(BoundaryErrorCode::Ok),
            -1 => Some(BoundaryErrorCode::Thrown),
            -2 => Some(BoundaryErrorCode::InvalidArgument),
            -3 => Some(BoundaryErrorCode::NotFound),
            -4 => Some(BoundaryErrorCode::InvalidHandle),
            -5 => Some(BoundaryErrorCode::OutOfMemory),
            -6 => Some(BoundaryErrorCode::MemoryAccess),
            -7 => Some(BoundaryErrorCode::ClosureState),
            -8 => Some(BoundaryErrorCode::ExceptionPending),
            -9 => Some(BoundaryErrorCode::Trap),
            -10 => Some(BoundaryErrorCode::InvalidUtf8),
            -11 => Some(BoundaryErrorCode::Internal),
            _ => None,
        }
    }

    pub fn is_error(code: i32) -> bool {
        code < 0
    }
}

impl fmt::Display for BoundaryErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundaryErrorCode::Ok => write!(f, "OK"),
            BoundaryErrorCode::Thrown => write!(f, "Thrown"),
            BoundaryErrorCode::InvalidArgument => write!(f, "Invalid argument"),
            BoundaryErrorCode::NotFound => write!(f, "Not found"),
            BoundaryErrorCode::InvalidHandle => write!(f, "Invalid handle"),
            BoundaryErrorCode::OutOfMemory => write!(f, "Out of memory"),
            BoundaryErrorCode::MemoryAccess => write!(f, "Memory access"),
            BoundaryErrorCode::ClosureState => write!(f, "Closure state"),
            BoundaryErrorCode::ExceptionPending => write!(f, "Exception pending"),
            BoundaryErrorCode::Trap => write!(f, "Trap"),
            BoundaryErrorCode::InvalidUtf8 => write!(f, "Invalid UTF-8"),
            BoundaryErrorCode::Internal => write!(f, "Internal error"),
        }
    }
}
