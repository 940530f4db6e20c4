//! CQL column types and their sandbox-side representations.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Column types a user-defined function can take or return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CqlType {
    /// 8-bit signed integer
    TinyInt,
    /// 16-bit signed integer
    SmallInt,
    /// 32-bit signed integer
    Int,
    /// 64-bit signed integer
    BigInt,
    /// IEEE-754 single precision
    Float,
    /// IEEE-754 double precision
    Double,
    /// Boolean
    Boolean,
    /// UTF-8 text
    Text,
}

impl CqlType {
    /// All supported types
    pub const ALL: [CqlType; 8] = [
        Self::TinyInt,
        Self::SmallInt,
        Self::Int,
        Self::BigInt,
        Self::Float,
        Self::Double,
        Self::Boolean,
        Self::Text,
    ];

    /// CQL name of the type
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::TinyInt => "tinyint",
            Self::SmallInt => "smallint",
            Self::Int => "int",
            Self::BigInt => "bigint",
            Self::Float => "float",
            Self::Double => "double",
            Self::Boolean => "boolean",
            Self::Text => "text",
        }
    }

    /// Primitive kind the type collapses to
    #[must_use]
    pub const fn primitive(&self) -> PrimitiveKind {
        match self {
            Self::TinyInt | Self::SmallInt | Self::Int => PrimitiveKind::Int32,
            Self::BigInt => PrimitiveKind::Int64,
            Self::Float => PrimitiveKind::Float32,
            Self::Double => PrimitiveKind::Float64,
            Self::Boolean => PrimitiveKind::Bool,
            Self::Text => PrimitiveKind::Text,
        }
    }

    /// Native slot used when the value is passed by value.
    ///
    /// Returns `None` for variable-length types, which only travel through
    /// linear memory.
    #[must_use]
    pub const fn native_slot(&self) -> Option<SlotKind> {
        match self.primitive() {
            PrimitiveKind::Int32 | PrimitiveKind::Bool => Some(SlotKind::I32),
            PrimitiveKind::Int64 => Some(SlotKind::I64),
            PrimitiveKind::Float32 => Some(SlotKind::F32),
            PrimitiveKind::Float64 => Some(SlotKind::F64),
            PrimitiveKind::Text => None,
        }
    }

    /// Width of the serialized form, `None` for variable-length types
    #[must_use]
    pub const fn fixed_width(&self) -> Option<usize> {
        match self {
            Self::TinyInt | Self::Boolean => Some(1),
            Self::SmallInt => Some(2),
            Self::Int | Self::Float => Some(4),
            Self::BigInt | Self::Double => Some(8),
            Self::Text => None,
        }
    }
}

impl fmt::Display for CqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CqlType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "tinyint" => Ok(Self::TinyInt),
            "smallint" => Ok(Self::SmallInt),
            "int" => Ok(Self::Int),
            "bigint" => Ok(Self::BigInt),
            "float" => Ok(Self::Float),
            "double" => Ok(Self::Double),
            "boolean" => Ok(Self::Boolean),
            "text" | "varchar" => Ok(Self::Text),
            _ => Err(CoreError::UnknownType {
                name: s.to_string(),
            }),
        }
    }
}

/// Closed set of primitive kinds a parameter or return value can have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveKind {
    /// 32-bit integer
    Int32,
    /// 64-bit integer
    Int64,
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
    /// Boolean
    Bool,
    /// Variable-length text
    Text,
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Bool => "bool",
            Self::Text => "text",
        };
        f.write_str(s)
    }
}

/// Native value kinds of the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotKind {
    /// 32-bit integer
    I32,
    /// 64-bit integer
    I64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        };
        f.write_str(s)
    }
}

/// What happens when a function is called with a null argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NullPolicy {
    /// Skip the call and return null
    #[default]
    ReturnsNullOnNullInput,
    /// Run the function and let it see the null
    CalledOnNullInput,
}

impl NullPolicy {
    /// Whether null arguments reach the function body
    #[must_use]
    pub const fn accepts_null(&self) -> bool {
        matches!(self, Self::CalledOnNullInput)
    }
}

impl fmt::Display for NullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReturnsNullOnNullInput => f.write_str("RETURNS NULL ON NULL INPUT"),
            Self::CalledOnNullInput => f.write_str("CALLED ON NULL INPUT"),
        }
    }
}
