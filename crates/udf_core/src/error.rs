//! Core error types for the UDF data model.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Unknown CQL type name
    UnknownType { name: String },

    /// Type has no representation for the requested operation
    UnsupportedType { type_name: String, reason: String },

    /// Literal could not be parsed as a value of the given type
    InvalidLiteral { type_name: String, literal: String },

    /// Serialized bytes have the wrong length for the type
    InvalidLength {
        /// Type being decoded
        type_name: String,
        /// Bytes expected
        expected: usize,
        /// Bytes found
        actual: usize,
    },

    /// Serialized text is not valid UTF-8
    InvalidUtf8,

    /// Invalid function name
    InvalidName { name: String, reason: String },

    /// Parse error
    ParseError { message: String },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType { name } => write!(f, "Unknown CQL type: {}", name),
            Self::UnsupportedType { type_name, reason } => {
                write!(f, "Unsupported type {}: {}", type_name, reason)
            }
            Self::InvalidLiteral { type_name, literal } => {
                write!(f, "Invalid {} literal: {}", type_name, literal)
            }
            Self::InvalidLength {
                type_name,
                expected,
                actual,
            } => write!(
                f,
                "Invalid serialized {}: expected {} bytes, got {}",
                type_name, expected, actual
            ),
            Self::InvalidUtf8 => write!(f, "Serialized text is not valid UTF-8"),
            Self::InvalidName { name, reason } => {
                write!(f, "Invalid function name '{}': {}", name, reason)
            }
            Self::ParseError { message } => write!(f, "Parse error: {}", message),
        }
    }
}

impl std::error::Error for CoreError {}
