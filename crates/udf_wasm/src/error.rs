//! Error taxonomy of the sandbox.
//!
//! Registration failures (`CompilationError`, `ValidationError`) reject a
//! function before it is stored. Invocation failures (`MarshalingError`,
//! `RuntimeFailure`) are fatal to one call only. The display strings are
//! matched on by clients and must stay stable.

use crate::memory::MemoryError;
use std::fmt;
use udf_core::SlotKind;

/// Result type for sandbox operations
pub type UdfResult<T> = Result<T, UdfError>;

/// Module bytes could not be turned into a module
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompilationError {
    /// Not valid module text or bytecode
    #[error("Compilation failed: {0}")]
    InvalidModule(String),

    /// Source larger than the configured maximum
    #[error("Compilation failed: module size {size} exceeds limit {limit}")]
    TooLarge { size: usize, limit: usize },
}

/// Where in a signature a slot sits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPosition {
    /// Zero-based parameter index
    Parameter(usize),
    /// The single return value
    Return,
}

impl fmt::Display for SlotPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parameter(i) => write!(f, "parameter {}", i),
            Self::Return => f.write_str("return value"),
        }
    }
}

/// Declared signature does not fit the exported function
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureMismatch {
    /// Parameter counts differ
    #[error(
        "type mismatch: invalid number of arguments for {export}: declared {declared}, module function takes {actual}"
    )]
    Arity {
        /// Export name
        export: String,
        /// Slots implied by the declaration
        declared: usize,
        /// Parameters of the exported function
        actual: usize,
    },

    /// The function does not return exactly one value
    #[error(
        "type mismatch: {export} must return exactly one value, module function returns {actual}"
    )]
    ResultCount {
        /// Export name
        export: String,
        /// Results of the exported function
        actual: usize,
    },

    /// Slot kinds differ at one position
    #[error("type mismatch at {position}: Expected {expected}, got {found}")]
    Slot {
        /// Position of the offending slot
        position: SlotPosition,
        /// Kind implied by the declaration
        expected: SlotKind,
        /// Kind declared by the module
        found: String,
    },
}

/// Module compiled but cannot serve the declared function
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// No export with the function's name
    #[error("function {export} not found in module exports")]
    ExportNotFound { export: String },

    /// Export exists but is a memory, global or table
    #[error("export {export} is not a function (it is a {kind})")]
    NotAFunction { export: String, kind: &'static str },

    /// Signature does not match the export
    #[error(transparent)]
    SignatureMismatch(#[from] SignatureMismatch),

    /// `_scylla_abi` holds a value the host does not speak
    #[error("unsupported abi version {found}")]
    UnsupportedAbi { found: String },

    /// Declared types cannot be passed under the module's ABI
    #[error("unsupported calling convention: {reason}")]
    UnsupportedConvention { reason: String },

    /// Module needs host imports, none are provided
    #[error("module imports {module}::{name}, but no host functions are provided")]
    UnresolvedImport { module: String, name: String },

    /// Instantiation failed while reading module metadata
    #[error("module cannot be instantiated: {reason}")]
    Instantiation { reason: String },
}

/// Arguments or result could not be converted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarshalingError {
    /// Value or slot kind differs from what was expected
    #[error("type mismatch for {position}: Expected {expected}, got {found}")]
    TypeMismatch {
        /// Position of the offending value
        position: SlotPosition,
        /// Expected kind
        expected: String,
        /// Kind found
        found: String,
    },

    /// Wrong number of bound arguments
    #[error("invalid number of arguments: expected {expected}, got {actual}")]
    ArgumentCountMismatch { expected: usize, actual: usize },

    /// Returned value could not be decoded
    #[error("invalid result: {0}")]
    InvalidResult(String),

    /// Guest memory could not hold an argument or result
    #[error("guest memory error: {0}")]
    Memory(#[from] MemoryError),
}

impl From<SignatureMismatch> for MarshalingError {
    fn from(mismatch: SignatureMismatch) -> Self {
        match mismatch {
            SignatureMismatch::Arity {
                declared, actual, ..
            } => Self::ArgumentCountMismatch {
                // Expected is the module function's arity, actual the declared one
                expected: actual,
                actual: declared,
            },
            SignatureMismatch::ResultCount { actual, .. } => Self::TypeMismatch {
                position: SlotPosition::Return,
                expected: "1 result".to_string(),
                found: format!("{} results", actual),
            },
            SignatureMismatch::Slot {
                position,
                expected,
                found,
            } => Self::TypeMismatch {
                position,
                expected: expected.to_string(),
                found,
            },
        }
    }
}

/// Sandboxed execution did not complete
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeFailure {
    /// Illegal operation inside the sandbox
    #[error("wasm execution trapped: {0}")]
    Trapped(String),

    /// Fuel budget ran out
    #[error("fuel consumed: execution exceeded budget of {budget} units")]
    FuelExhausted { budget: u64 },
}

/// Failure of a single call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvocationError {
    /// Conversion failure
    #[error(transparent)]
    Marshaling(#[from] MarshalingError),

    /// Execution failure
    #[error(transparent)]
    Runtime(#[from] RuntimeFailure),
}

impl From<MemoryError> for InvocationError {
    fn from(err: MemoryError) -> Self {
        Self::Marshaling(MarshalingError::Memory(err))
    }
}

/// Top-level sandbox error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UdfError {
    /// Registration rejected: bad module
    #[error(transparent)]
    Compilation(#[from] CompilationError),

    /// Registration rejected: module does not serve the declaration
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A call failed
    #[error("wasm function {function} failed: {source}")]
    Invocation {
        /// Function being called
        function: String,
        /// What went wrong
        source: InvocationError,
    },

    /// No such registered function
    #[error("function {function} does not exist")]
    NotFound { function: String },

    /// A function with that name is already registered
    #[error("function {function} already exists")]
    AlreadyExists { function: String },

    /// Engine could not be set up
    #[error("sandbox setup failed: {0}")]
    Setup(String),
}

impl UdfError {
    /// Whether the error is a fuel exhaustion
    #[must_use]
    pub fn is_fuel_exhausted(&self) -> bool {
        matches!(
            self,
            Self::Invocation {
                source: InvocationError::Runtime(RuntimeFailure::FuelExhausted { .. }),
                ..
            }
        )
    }

    /// Whether the error is a trap other than fuel exhaustion
    #[must_use]
    pub fn is_trap(&self) -> bool {
        matches!(
            self,
            Self::Invocation {
                source: InvocationError::Runtime(RuntimeFailure::Trapped(_)),
                ..
            }
        )
    }

    /// Whether the error rejected a registration
    #[must_use]
    pub fn is_registration_error(&self) -> bool {
        matches!(self, Self::Compilation(_) | Self::Validation(_))
    }
}
