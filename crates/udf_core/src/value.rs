//! Typed CQL values and their big-endian wire encoding.
//!
//! The wire form is what a function sees when an argument travels through
//! linear memory instead of a native slot: fixed-width types in network byte
//! order, text as raw UTF-8.

use crate::error::{CoreError, CoreResult};
use crate::types::CqlType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A non-null CQL value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CqlValue {
    /// tinyint
    TinyInt(i8),
    /// smallint
    SmallInt(i16),
    /// int
    Int(i32),
    /// bigint
    BigInt(i64),
    /// float
    Float(f32),
    /// double
    Double(f64),
    /// boolean
    Boolean(bool),
    /// text
    Text(String),
}

impl CqlValue {
    /// Type of this value
    #[must_use]
    pub const fn cql_type(&self) -> CqlType {
        match self {
            Self::TinyInt(_) => CqlType::TinyInt,
            Self::SmallInt(_) => CqlType::SmallInt,
            Self::Int(_) => CqlType::Int,
            Self::BigInt(_) => CqlType::BigInt,
            Self::Float(_) => CqlType::Float,
            Self::Double(_) => CqlType::Double,
            Self::Boolean(_) => CqlType::Boolean,
            Self::Text(_) => CqlType::Text,
        }
    }

    /// Encode into the wire form
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8> {
        match self {
            Self::TinyInt(v) => v.to_be_bytes().to_vec(),
            Self::SmallInt(v) => v.to_be_bytes().to_vec(),
            Self::Int(v) => v.to_be_bytes().to_vec(),
            Self::BigInt(v) => v.to_be_bytes().to_vec(),
            Self::Float(v) => v.to_bits().to_be_bytes().to_vec(),
            Self::Double(v) => v.to_bits().to_be_bytes().to_vec(),
            Self::Boolean(v) => vec![u8::from(*v)],
            Self::Text(s) => s.as_bytes().to_vec(),
        }
    }

    /// Decode a value of type `ty` from its wire form
    ///
    /// # Errors
    ///
    /// Returns error if the length does not match a fixed-width type or the
    /// text is not UTF-8
    pub fn from_wire(ty: CqlType, bytes: &[u8]) -> CoreResult<Self> {
        if let Some(width) = ty.fixed_width() {
            if bytes.len() != width {
                return Err(CoreError::InvalidLength {
                    type_name: ty.name().to_string(),
                    expected: width,
                    actual: bytes.len(),
                });
            }
        }

        let value = match ty {
            CqlType::TinyInt => Self::TinyInt(i8::from_be_bytes([bytes[0]])),
            CqlType::SmallInt => Self::SmallInt(i16::from_be_bytes(fixed(bytes))),
            CqlType::Int => Self::Int(i32::from_be_bytes(fixed(bytes))),
            CqlType::BigInt => Self::BigInt(i64::from_be_bytes(fixed(bytes))),
            CqlType::Float => Self::Float(f32::from_bits(u32::from_be_bytes(fixed(bytes)))),
            CqlType::Double => Self::Double(f64::from_bits(u64::from_be_bytes(fixed(bytes)))),
            CqlType::Boolean => Self::Boolean(bytes[0] != 0),
            CqlType::Text => Self::Text(
                String::from_utf8(bytes.to_vec()).map_err(|_| CoreError::InvalidUtf8)?,
            ),
        };
        Ok(value)
    }

    /// Parse a literal as written on a command line
    ///
    /// # Errors
    ///
    /// Returns error if the literal is not valid for `ty`
    pub fn parse_literal(ty: CqlType, literal: &str) -> CoreResult<Self> {
        let invalid = || CoreError::InvalidLiteral {
            type_name: ty.name().to_string(),
            literal: literal.to_string(),
        };
        let trimmed = literal.trim();

        let value = match ty {
            CqlType::TinyInt => Self::TinyInt(trimmed.parse().map_err(|_| invalid())?),
            CqlType::SmallInt => Self::SmallInt(trimmed.parse().map_err(|_| invalid())?),
            CqlType::Int => Self::Int(trimmed.parse().map_err(|_| invalid())?),
            CqlType::BigInt => Self::BigInt(trimmed.parse().map_err(|_| invalid())?),
            CqlType::Float => Self::Float(trimmed.parse().map_err(|_| invalid())?),
            CqlType::Double => Self::Double(trimmed.parse().map_err(|_| invalid())?),
            CqlType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "true" => Self::Boolean(true),
                "false" => Self::Boolean(false),
                _ => return Err(invalid()),
            },
            CqlType::Text => {
                let unquoted = trimmed
                    .strip_prefix('\'')
                    .and_then(|s| s.strip_suffix('\''))
                    .unwrap_or(literal);
                Self::Text(unquoted.to_string())
            }
        };
        Ok(value)
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut arr = [0u8; N];
    arr.copy_from_slice(&bytes[..N]);
    arr
}

impl fmt::Display for CqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TinyInt(v) => write!(f, "{}", v),
            Self::SmallInt(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::BigInt(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::Boolean(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "'{}'", s),
        }
    }
}
